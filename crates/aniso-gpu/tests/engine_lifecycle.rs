//! Hardware integration tests for the pair engine lifecycle.
//!
//! Run with: cargo test -p aniso-gpu --features cuda -- --ignored

#![cfg(feature = "cuda")]

use aniso_core::{
    AtomCounts, CompressedNeighborList, EngineConfig, EvalFlags, FormCode, PairCoeffs,
};
use aniso_gpu::{EllipsoidPairGpu, GpuContext, KernelSet, PtxPolicy};
use std::path::PathBuf;
use std::sync::Arc;

fn mixed_coeffs(ntypes: usize) -> PairCoeffs {
    let square = |v: f64| vec![vec![v; ntypes]; ntypes];
    // Type 0 is extended, the rest are points.
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
    PairCoeffs {
        ntypes,
        shape: vec![[1.0, 1.0, 3.0]; ntypes],
        well: vec![[1.0, 1.0, 0.2]; ntypes],
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
    }
}

fn init_engine(nlocal: usize, nall: usize) -> anyhow::Result<EllipsoidPairGpu<f32>> {
    let ctx = Arc::new(GpuContext::new(
        0,
        PtxPolicy::permissive(),
        &PathBuf::from("target/ptx"),
    )?);
    EllipsoidPairGpu::initialize(
        ctx,
        &KernelSet::ellipsoid_pair(),
        &mixed_coeffs(2),
        AtomCounts { nlocal, nall },
        EngineConfig::default(),
    )
}

/// A small mixed population laid out on a line: 4 extended bodies then 8
/// points, every particle neighboring its successor.
fn stage_line(engine: &mut EllipsoidPairGpu<f32>, n: usize, last_ellipse: usize) {
    let mut x = vec![0.0f32; n * 4];
    let mut quat = vec![0.0f32; n * 4];
    let mut types = vec![0i32; n];
    for i in 0..n {
        x[i * 4] = i as f32 * 1.2;
        quat[i * 4] = 1.0;
        types[i] = if i < last_ellipse { 0 } else { 1 };
    }
    let adjacency: Vec<Vec<i32>> = (0..n)
        .map(|i| if i + 1 < n { vec![(i + 1) as i32] } else { vec![] })
        .collect();

    engine
        .stage_particles(&x, Some(&quat), &types, last_ellipse)
        .expect("stage particles");
    engine
        .stage_neighbors(&CompressedNeighborList::from_adjacency(&adjacency))
        .expect("stage neighbors");
}

#[test]
#[ignore] // Requires CUDA hardware
fn test_init_compute_clear_releases_memory() -> anyhow::Result<()> {
    env_logger::builder().is_test(true).try_init().ok();

    let mut engine = init_engine(12, 12)?;
    assert!(engine.is_allocated());
    assert!(engine.device_bytes() > 0);

    stage_line(&mut engine, 12, 4);
    let outcome = engine.compute(EvalFlags {
        energy: true,
        virial: true,
    })?;
    assert!(outcome.fault.is_none(), "healthy system must not fault");

    let forces = engine.read_forces_torques()?;
    assert_eq!(forces.len(), 12 * 8);
    assert!(
        forces.iter().any(|&v| v != 0.0),
        "interacting particles must produce forces"
    );

    engine.clear()?;
    assert_eq!(engine.device_bytes(), 0);
    // Second clear is a no-op.
    engine.clear()?;
    assert_eq!(engine.device_bytes(), 0);
    Ok(())
}

#[test]
#[ignore] // Requires CUDA hardware
fn test_all_point_step_zeroes_extended_timers() -> anyhow::Result<()> {
    let mut engine = init_engine(8, 8)?;
    stage_line(&mut engine, 8, 0);
    let outcome = engine.compute(EvalFlags::default())?;
    assert!(outcome.timers.extended_all_zero());
    assert!(outcome.fault.is_none());
    Ok(())
}

#[test]
#[ignore] // Requires CUDA hardware
fn test_degenerate_shape_sets_sticky_fault() -> anyhow::Result<()> {
    let ctx = Arc::new(GpuContext::new(
        0,
        PtxPolicy::permissive(),
        &PathBuf::from("target/ptx"),
    )?);
    // A zero semi-axis makes the pair orientation matrix singular.
    let mut coeffs = mixed_coeffs(2);
    coeffs.shape = vec![[0.0, 0.0, 0.0]; 2];
    coeffs.sigma = vec![vec![0.0; 2]; 2];

    let mut engine: EllipsoidPairGpu<f32> = EllipsoidPairGpu::initialize(
        ctx,
        &KernelSet::ellipsoid_pair(),
        &coeffs,
        AtomCounts {
            nlocal: 4,
            nall: 4,
        },
        EngineConfig::default(),
    )?;
    stage_line(&mut engine, 4, 4);

    let outcome = engine.compute(EvalFlags::default())?;
    assert_eq!(
        outcome.fault,
        Some(aniso_core::DeviceFault::BadMatrixInversion)
    );

    // Sticky: a later healthy-looking step still observes the flag.
    let outcome = engine.compute(EvalFlags::default())?;
    assert_eq!(
        outcome.fault,
        Some(aniso_core::DeviceFault::BadMatrixInversion)
    );
    Ok(())
}
