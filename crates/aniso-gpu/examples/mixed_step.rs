//! Runs one evaluation step over a small mixed population: a prefix of
//! ellipsoids and a suffix of point particles on a line.
//!
//! Requires compiled kernels: cargo run -p aniso-gpu --features cuda --example mixed_step

use aniso_core::{
    AtomCounts, CompressedNeighborList, EngineConfig, EvalFlags, FormCode, PairCoeffs,
};
use aniso_gpu::{EllipsoidPairGpu, GpuContext, KernelSet, PtxPolicy};
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    if !GpuContext::is_available() {
        eprintln!("No CUDA device available; nothing to demonstrate.");
        return Ok(());
    }

    let n = 24;
    let last_ellipse = 8;
    let ntypes = 2;

    let square = |v: f64| vec![vec![v; ntypes]; ntypes];
    let form: Vec<Vec<FormCode>> = (0..ntypes)
        .map(|i| {
            (0..ntypes)
                .map(|j| match (i == 0, j == 0) {
                    (true, true) => FormCode::EllipseEllipse,
                    (true, false) => FormCode::EllipseSphere,
                    (false, true) => FormCode::SphereEllipse,
                    (false, false) => FormCode::SphereSphere,
                })
                .collect()
        })
        .collect();
    let coeffs = PairCoeffs {
        ntypes,
        shape: vec![[1.0, 1.0, 3.0], [1.0, 1.0, 1.0]],
        well: vec![[1.0, 1.0, 0.2], [1.0, 1.0, 1.0]],
        cutsq: square(16.0),
        sigma: square(1.0),
        epsilon: square(1.0),
        lj1: square(48.0),
        lj2: square(24.0),
        lj3: square(4.0),
        lj4: square(4.0),
        offset: square(0.0),
        form,
        special_lj: [1.0, 0.0, 0.0, 0.5],
    };

    let ctx = Arc::new(GpuContext::new(
        0,
        PtxPolicy::permissive(),
        &PathBuf::from("target/ptx"),
    )?);
    let mut engine: EllipsoidPairGpu<f32> = EllipsoidPairGpu::initialize(
        ctx,
        &KernelSet::ellipsoid_pair(),
        &coeffs,
        AtomCounts {
            nlocal: n,
            nall: n,
        },
        EngineConfig::default(),
    )?;
    println!(
        "engine allocated: {} bytes on device, fast path: {}",
        engine.device_bytes(),
        engine.layout().shared_const
    );

    let mut x = vec![0.0f32; n * 4];
    let mut quat = vec![0.0f32; n * 4];
    let mut types = vec![0i32; n];
    for i in 0..n {
        x[i * 4] = i as f32 * 1.1;
        quat[i * 4] = 1.0;
        types[i] = (i >= last_ellipse) as i32;
    }
    let adjacency: Vec<Vec<i32>> = (0..n)
        .map(|i| {
            (0..n)
                .filter(|&j| j != i && (j as i32 - i as i32).abs() <= 3)
                .map(|j| j as i32)
                .collect()
        })
        .collect();

    engine.stage_particles(&x, Some(&quat), &types, last_ellipse)?;
    engine.stage_neighbors(&CompressedNeighborList::from_adjacency(&adjacency))?;

    let outcome = engine.compute(EvalFlags {
        energy: true,
        virial: true,
    })?;
    println!("step telemetry: {}", outcome.telemetry_json());

    if let Some(fault) = outcome.fault {
        eprintln!("device fault: {}", fault.diagnostic());
        return Ok(());
    }

    let ans = engine.read_forces_torques()?;
    let engv = engine.read_energy_virial()?;
    let total_energy: f32 = (0..n).map(|i| engv[i * 7]).sum();
    println!("total pair energy: {total_energy:.4}");
    println!(
        "first ellipsoid force: [{:.4}, {:.4}, {:.4}] torque: [{:.4}, {:.4}, {:.4}]",
        ans[0], ans[1], ans[2], ans[4], ans[5], ans[6]
    );

    engine.clear()?;
    println!("cleared, tracked bytes: {}", engine.device_bytes());
    Ok(())
}
