//! Build script for aniso-gpu
//!
//! Compiles the CUDA kernels to PTX for runtime loading.
//!
//! CUDA COMPILATION:
//! - Target architecture: sm_86 (single-arch, --ptx mode)
//! - PTX output: target/ptx/<module>.ptx plus a copy under OUT_DIR
//! - Skipped entirely unless the `cuda` feature is enabled, so the host
//!   crate builds on machines without a toolkit
//!
//! SECURITY:
//! - Each PTX module is signed with SHA-256; signatures live next to the
//!   module as <module>.ptx.sha256 and are verified at load time under a
//!   strict policy.

use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=src/kernels/");

    let cuda_enabled = env::var("CARGO_FEATURE_CUDA").is_ok();
    if !cuda_enabled {
        println!("cargo:warning=CUDA feature not enabled, skipping PTX compilation");
        return;
    }

    let nvcc = find_nvcc().expect("nvcc not found. Ensure CUDA toolkit is installed.");
    println!("cargo:info=Using nvcc: {}", nvcc);

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let ptx_dir = out_dir.join("ptx");
    std::fs::create_dir_all(&ptx_dir).expect("Failed to create PTX output directory");

    let target_ptx_dir = PathBuf::from("target/ptx");
    std::fs::create_dir_all(&target_ptx_dir).expect("Failed to create target/ptx directory");

    compile_kernel(
        &nvcc,
        "src/kernels/ellipsoid_pair.cu",
        &ptx_dir.join("ellipsoid_pair.ptx"),
        &target_ptx_dir.join("ellipsoid_pair.ptx"),
    );

    println!("cargo:info=PTX compilation completed successfully");
}

/// Finds nvcc in CUDA_HOME, the common install paths, or PATH.
fn find_nvcc() -> Option<String> {
    if let Ok(cuda_home) = env::var("CUDA_HOME") {
        let nvcc_path = PathBuf::from(cuda_home).join("bin").join("nvcc");
        if nvcc_path.exists() {
            return Some(nvcc_path.to_string_lossy().to_string());
        }
    }

    let common_paths = vec![
        "/usr/local/cuda/bin/nvcc",
        "/usr/local/cuda-12/bin/nvcc",
        "/opt/cuda/bin/nvcc",
    ];
    for path in common_paths {
        if PathBuf::from(path).exists() {
            return Some(path.to_string());
        }
    }

    if Command::new("nvcc").arg("--version").output().is_ok() {
        return Some("nvcc".to_string());
    }

    None
}

/// Compiles one CUDA source to PTX and signs the result.
fn compile_kernel(nvcc: &str, source: &str, output: &PathBuf, target_output: &PathBuf) {
    println!("cargo:info=Compiling {} -> {}", source, output.display());

    let status = Command::new(nvcc)
        .arg("--ptx")
        .arg("-o")
        .arg(output)
        .arg(source)
        .arg("-arch=sm_86")
        .arg("-O3")
        .arg("--use_fast_math")
        .arg("--restrict")
        .arg("--expt-relaxed-constexpr")
        .status()
        .expect("Failed to execute nvcc");

    if !status.success() {
        panic!("nvcc compilation failed for {}", source);
    }

    std::fs::copy(output, target_output).expect("Failed to copy PTX to target/ptx");
    generate_ptx_signature(target_output);

    println!("cargo:info=PTX compiled: {}", target_output.display());
}

/// Writes the SHA-256 signature file checked by the strict load policy.
fn generate_ptx_signature(ptx_path: &PathBuf) {
    use sha2::{Digest, Sha256};

    let ptx_bytes = std::fs::read(ptx_path).expect("Failed to read PTX file");
    let hash_hex = hex::encode(Sha256::digest(&ptx_bytes));

    let sig_path = ptx_path.with_extension("ptx.sha256");
    std::fs::write(&sig_path, hash_hex).expect("Failed to write signature file");

    println!("cargo:info=PTX signature: {}", sig_path.display());
}
