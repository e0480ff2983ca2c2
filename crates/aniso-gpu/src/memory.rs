//! Device memory accounting.
//!
//! Every device buffer the engine allocates is charged to a `MemoryLedger`
//! so the host can report the accelerator footprint; `clear()` must return
//! the tracked total to zero. `VramInfo` queries the real device state
//! through the driver for startup safety checks.

use cudarc::driver::DriverError;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Fraction of total VRAM an allocation may reach before being refused.
const VRAM_SAFETY_THRESHOLD: f64 = 0.9;

/// Memory accounting and query errors.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// GPU memory query failed.
    #[error("Failed to query GPU memory: {0}")]
    QueryFailed(#[from] DriverError),

    /// GPU device not available for a memory query.
    #[error("GPU device unavailable for memory query")]
    DeviceUnavailable,

    /// Requested allocation exceeds the safe limit.
    #[error("VRAM exhaustion risk: required {required_mb}MB exceeds safe limit of {available_mb}MB (90% of {total_mb}MB)")]
    InsufficientVram {
        required_mb: u64,
        available_mb: u64,
        total_mb: u64,
    },
}

/// GPU memory state at query time.
#[derive(Debug, Clone)]
pub struct VramInfo {
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub safe_limit_bytes: usize,
}

impl VramInfo {
    pub fn total_mb(&self) -> u64 {
        (self.total_bytes / (1024 * 1024)) as u64
    }

    pub fn free_mb(&self) -> u64 {
        (self.free_bytes / (1024 * 1024)) as u64
    }

    pub fn safe_limit_mb(&self) -> u64 {
        (self.safe_limit_bytes / (1024 * 1024)) as u64
    }

    /// Queries the current device state via `cuMemGetInfo`.
    pub fn query() -> Result<Self, MemoryError> {
        let mut free_bytes: usize = 0;
        let mut total_bytes: usize = 0;

        unsafe {
            let result = cudarc::driver::sys::cuMemGetInfo_v2(
                &mut free_bytes as *mut usize,
                &mut total_bytes as *mut usize,
            );
            if result != cudarc::driver::sys::CUresult::CUDA_SUCCESS {
                log::error!("cuMemGetInfo failed with code: {:?}", result);
                return Err(MemoryError::DeviceUnavailable);
            }
        }

        Ok(Self {
            total_bytes,
            free_bytes,
            used_bytes: total_bytes - free_bytes,
            safe_limit_bytes: (total_bytes as f64 * VRAM_SAFETY_THRESHOLD) as usize,
        })
    }

    /// Refuses allocations that would push the device past the safe limit.
    pub fn verify_allocation(&self, required_bytes: usize) -> Result<(), MemoryError> {
        if required_bytes > self.safe_limit_bytes || required_bytes > self.free_bytes {
            return Err(MemoryError::InsufficientVram {
                required_mb: (required_bytes / (1024 * 1024)) as u64,
                available_mb: self.free_mb().min(self.safe_limit_mb()),
                total_mb: self.total_mb(),
            });
        }
        Ok(())
    }
}

/// Running total of device bytes this engine holds.
///
/// Single-writer in practice (allocations happen on the host thread) but
/// atomic so read-side reporting never needs a lock.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    bytes: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charges an allocation of `len` elements of `T`, returning the byte
    /// count charged.
    pub fn charge<T>(&self, len: usize) -> usize {
        let bytes = len * std::mem::size_of::<T>();
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        bytes
    }

    /// Releases previously charged bytes. Saturates at zero so a double
    /// release cannot wrap.
    pub fn release(&self, bytes: usize) {
        let mut current = self.bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Total device bytes currently tracked.
    pub fn total_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}
