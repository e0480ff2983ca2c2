//! Numeric precision as a configuration parameter.
//!
//! The engine is generic over the device scalar; each precision binds the
//! kernel-name suffix and the fast-constant-memory capacity compiled into
//! the matching kernels. The two constants here must agree with
//! `MAX_SHARED_TYPES_F` / `MAX_SHARED_TYPES_D` in
//! `src/kernels/ellipsoid_pair.cu`.

use cudarc::driver::{DeviceRepr, ValidAsZeroBits};

/// Device scalar for table entries, particle state, and accumulators.
pub trait Real:
    DeviceRepr
    + ValidAsZeroBits
    + Copy
    + Default
    + PartialOrd
    + Send
    + Sync
    + std::fmt::Debug
    + 'static
{
    /// Suffix appended to every precision-specialized kernel name.
    const KERNEL_SUFFIX: &'static str;

    /// Largest padded type count whose pair tables fit the static shared
    /// allocation of the fast point-point kernel.
    const MAX_SHARED_TYPES: usize;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Real for f32 {
    const KERNEL_SUFFIX: &'static str = "_f";
    const MAX_SHARED_TYPES: usize = 32;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    const KERNEL_SUFFIX: &'static str = "_d";
    const MAX_SHARED_TYPES: usize = 22;

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }
}
