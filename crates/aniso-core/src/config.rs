//! Engine configuration.
//!
//! `EngineConfig` is the host-side, serde-backed configuration handed to
//! initialization. `LaunchSpan` is the FFI-safe, `#[repr(C)]` index-range
//! record passed by value to accelerator kernels; its layout must match the
//! struct of the same name in the CUDA sources.

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default thread-block size for all kernel launches.
pub const DEFAULT_BLOCK_SIZE: u32 = 64;

/// Host-side engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// CUDA device ordinal.
    pub device_id: usize,

    /// Thread-block size for every kernel launch. Must be a multiple of
    /// `threads_per_atom`.
    pub block_size: u32,

    /// Threads cooperating on one owner's neighbor loop. Applied to the
    /// extended-body kernels only; point-particle kernels always run one
    /// thread per owner.
    pub threads_per_atom: u32,

    /// Upper bound on per-owner neighbor count; sizes the packed list.
    pub max_nbors: usize,

    /// Upper bound on per-atom special (topologically close) neighbors.
    pub max_special: usize,

    /// Spatial cell size used by the upstream neighbor builder.
    pub cell_size: f64,

    /// Fraction of owner particles evaluated on the accelerator; the host
    /// keeps the remainder. Clamped to (0, 1].
    pub gpu_split: f64,

    /// Directory holding compiled PTX modules.
    pub ptx_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            threads_per_atom: 1,
            max_nbors: 300,
            max_special: 0,
            cell_size: 0.0,
            gpu_split: 1.0,
            ptx_dir: PathBuf::from("target/ptx"),
        }
    }
}

impl EngineConfig {
    /// Validates the configuration, clamping `gpu_split` into (0, 1].
    pub fn validate(&mut self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(EngineError::config(format!(
                "block_size must be a positive power of two, got {}",
                self.block_size
            )));
        }
        if self.threads_per_atom == 0
            || !self.threads_per_atom.is_power_of_two()
            || self.threads_per_atom > 32
            || self.block_size % self.threads_per_atom != 0
        {
            return Err(EngineError::config(format!(
                "threads_per_atom ({}) must be a power of two <= 32 dividing block_size ({})",
                self.threads_per_atom, self.block_size
            )));
        }
        if self.max_nbors == 0 {
            return Err(EngineError::config("max_nbors must be positive"));
        }
        if !self.gpu_split.is_finite() || self.gpu_split <= 0.0 {
            return Err(EngineError::config(format!(
                "gpu_split must be in (0, 1], got {}",
                self.gpu_split
            )));
        }
        if self.gpu_split > 1.0 {
            self.gpu_split = 1.0;
        }
        Ok(())
    }

    /// Number of owner particles the accelerator evaluates out of `nlocal`.
    pub fn device_share(&self, nlocal: usize) -> usize {
        ((nlocal as f64) * self.gpu_split).ceil() as usize
    }
}

/// Index-range record passed by value to every pair kernel.
///
/// `begin..end` is the owner range this launch covers; `inum` is the total
/// owner count (the global packed-list stride); `stride` duplicates it on
/// the device side so kernels never recompute it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LaunchSpan {
    pub begin: i32,
    pub end: i32,
    pub inum: i32,
    pub stride: i32,
}

impl LaunchSpan {
    pub fn new(begin: usize, end: usize, inum: usize) -> Self {
        Self {
            begin: begin as i32,
            end: end as i32,
            inum: inum as i32,
            stride: inum as i32,
        }
    }

    pub fn count(&self) -> usize {
        (self.end - self.begin).max(0) as usize
    }
}
