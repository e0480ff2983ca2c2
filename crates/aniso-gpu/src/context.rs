//! GPU context management.
//!
//! ASSUMPTIONS:
//! - `CudaContext::new(device_id)` initializes the CUDA runtime.
//! - PTX modules are pre-compiled by `build.rs` into `ptx_dir`.
//! - Signature files follow the naming `<module>.ptx.sha256` (hex-encoded).
//!
//! SECURITY:
//! - `require_signed_ptx`: verifies SHA256 signatures before loading.
//! - `trusted_ptx_dir`: restricts PTX loading to one directory.
//!
//! Launches are issued on a single stream in order; nothing in this engine
//! blocks the host except explicit readbacks.

use anyhow::{Context, Result};
use cudarc::driver::{CudaContext, CudaModule, CudaStream};
use cudarc::nvrtc::Ptx;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the pair-kernel module this engine ships.
pub const PAIR_MODULE: &str = "ellipsoid_pair";

/// Security policy for PTX loading.
#[derive(Debug, Clone, Default)]
pub struct PtxPolicy {
    /// Require signed PTX files with SHA256 verification (default: false).
    pub require_signed_ptx: bool,

    /// Directory containing trusted PTX modules and signatures.
    pub trusted_ptx_dir: Option<PathBuf>,
}

impl PtxPolicy {
    /// Permissive policy for development and testing.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Strict policy for production: signed PTX from one directory only.
    pub fn strict(trusted_ptx_dir: PathBuf) -> Self {
        Self {
            require_signed_ptx: true,
            trusted_ptx_dir: Some(trusted_ptx_dir),
        }
    }
}

/// CUDA device handle plus the registry of loaded PTX modules.
///
/// Thread-safe via `Arc<CudaContext>`; one instance is shared by every
/// engine bound to the same device.
pub struct GpuContext {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    modules: HashMap<String, Arc<CudaModule>>,
    policy: PtxPolicy,
    ptx_dir: PathBuf,
}

impl GpuContext {
    /// Creates a context on `device_id` and pre-loads the pair-kernel
    /// module from `ptx_dir`.
    ///
    /// # Errors
    /// Fails if the device cannot be initialized, the PTX directory does
    /// not exist, or signature verification fails under a strict policy.
    /// A missing module file is a warning, not an error, so host-only
    /// paths (reference packer, planning) remain usable.
    pub fn new(device_id: usize, policy: PtxPolicy, ptx_dir: &Path) -> Result<Self> {
        log::info!(
            "Initializing GPU context on device {} with PTX dir: {}",
            device_id,
            ptx_dir.display()
        );

        anyhow::ensure!(
            ptx_dir.is_dir(),
            "PTX directory does not exist: {}",
            ptx_dir.display()
        );

        let context = CudaContext::new(device_id)
            .with_context(|| format!("Failed to initialize CUDA device {}", device_id))?;
        let stream = context.default_stream();

        let mut ctx = Self {
            context,
            stream,
            modules: HashMap::new(),
            policy,
            ptx_dir: ptx_dir.to_path_buf(),
        };

        let pair_ptx = ctx.ptx_dir.join(format!("{PAIR_MODULE}.ptx"));
        if pair_ptx.exists() {
            ctx.load_ptx_module(PAIR_MODULE, &pair_ptx)?;
        } else {
            log::warn!(
                "PTX module not found (skipping): {} - kernel dispatch unavailable",
                pair_ptx.display()
            );
        }

        log::info!(
            "GPU context initialized with {} module(s)",
            ctx.modules.len()
        );
        Ok(ctx)
    }

    /// Loads one PTX module from disk, verifying the policy first.
    pub fn load_ptx_module(&mut self, name: &str, ptx_path: &Path) -> Result<()> {
        log::debug!("Loading PTX module '{}' from: {}", name, ptx_path.display());

        if let Some(trusted_dir) = &self.policy.trusted_ptx_dir {
            let canonical_ptx = ptx_path.canonicalize().with_context(|| {
                format!("Failed to canonicalize PTX path: {}", ptx_path.display())
            })?;
            let canonical_trusted = trusted_dir.canonicalize().with_context(|| {
                format!(
                    "Failed to canonicalize trusted dir: {}",
                    trusted_dir.display()
                )
            })?;
            anyhow::ensure!(
                canonical_ptx.starts_with(&canonical_trusted),
                "PTX file outside trusted directory: {} not in {}",
                ptx_path.display(),
                trusted_dir.display()
            );
        }

        if self.policy.require_signed_ptx {
            self.verify_ptx_signature(ptx_path)?;
        }

        let ptx_str = std::fs::read_to_string(ptx_path)
            .with_context(|| format!("Failed to read PTX file: {}", ptx_path.display()))?;

        let module = self
            .context
            .load_module(Ptx::from_src(ptx_str))
            .with_context(|| format!("Failed to load PTX module '{}'", name))?;

        log::info!("Loaded PTX module: {}", name);
        self.modules.insert(name.to_string(), module);
        Ok(())
    }

    /// Verifies the SHA256 signature stored next to a PTX file.
    fn verify_ptx_signature(&self, ptx_path: &Path) -> Result<()> {
        use sha2::{Digest, Sha256};

        let sig_path = ptx_path.with_extension("ptx.sha256");
        let expected = std::fs::read_to_string(&sig_path)
            .with_context(|| {
                format!(
                    "PTX signature verification failed: signature file not found: {}",
                    sig_path.display()
                )
            })?
            .trim()
            .to_lowercase();

        let content = std::fs::read(ptx_path).with_context(|| {
            format!(
                "Failed to read PTX for signature verification: {}",
                ptx_path.display()
            )
        })?;
        let actual = hex::encode(Sha256::digest(&content));

        anyhow::ensure!(
            expected == actual,
            "PTX signature mismatch for '{}'\nExpected: {}\nGot:      {}",
            ptx_path.display(),
            expected,
            actual
        );

        log::debug!("PTX signature verified: {}", ptx_path.display());
        Ok(())
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn get_module(&self, name: &str) -> Option<&Arc<CudaModule>> {
        self.modules.get(name)
    }

    /// Underlying CUDA device handle.
    pub fn device(&self) -> &Arc<CudaContext> {
        &self.context
    }

    /// The single ordered stream all launches go through.
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }

    /// Largest padded type count the fast constants path supports for the
    /// given precision.
    pub fn max_shared_types<P: crate::real::Real>(&self) -> usize {
        P::MAX_SHARED_TYPES
    }

    /// Checks whether a CUDA device is available at all.
    pub fn is_available() -> bool {
        match CudaContext::new(0) {
            Ok(_) => {
                log::debug!("GPU detected and available");
                true
            }
            Err(e) => {
                log::debug!("GPU not available: {}", e);
                false
            }
        }
    }

    pub fn ptx_dir(&self) -> &Path {
        &self.ptx_dir
    }

    pub fn policy(&self) -> &PtxPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = PtxPolicy::default();
        assert!(!policy.require_signed_ptx);
        assert!(policy.trusted_ptx_dir.is_none());

        let strict = PtxPolicy::strict(PathBuf::from("/trusted"));
        assert!(strict.require_signed_ptx);
        assert!(strict.trusted_ptx_dir.is_some());
    }

    #[test]
    fn test_missing_ptx_dir_rejected() {
        let result = GpuContext::new(0, PtxPolicy::default(), Path::new("/nonexistent"));
        assert!(result.is_err());
    }

    #[test]
    fn test_is_available_does_not_panic() {
        let available = GpuContext::is_available();
        log::info!("GPU available: {}", available);
    }
}
