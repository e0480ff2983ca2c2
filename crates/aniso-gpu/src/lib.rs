//! # aniso-gpu
//!
//! GPU-resident neighbor-list packing and multi-form pair-kernel dispatch
//! for orientation-dependent interactions.
//!
//! The host simulation owns particle state, domain decomposition, and time
//! integration; this crate owns the accelerator-side evaluation of one
//! pair interaction per step:
//!
//! - [`tables`] — padded, type-indexed constant tables and the
//!   shared-fast-path decision
//! - [`nbor`] — compressed-to-packed neighbor reshaping (device kernels
//!   plus a bit-identical host reference)
//! - [`partition`] — interaction-form classification and launch planning
//! - [`engine`] — per-step dispatch, accumulators, sticky error channel,
//!   and the allocate/clear lifecycle
//! - [`context`] / [`memory`] — device handle, PTX registry, byte ledger

pub mod context;
pub mod engine;
pub mod memory;
pub mod nbor;
pub mod partition;
pub mod real;
pub mod tables;

// Essential exports
pub use context::{GpuContext, PtxPolicy, PAIR_MODULE};
pub use engine::{EllipsoidPairGpu, GroupTimers, KernelSet, StepOutcome};
pub use memory::{MemoryLedger, MemoryError, VramInfo};
pub use nbor::{
    blocks_of_four, pack_host, packed_rows, unpack_host, DeviceSpan, NborDevice, PackedNeighbors,
};
pub use partition::{classify_boundary, grid_for, GroupKind, GroupLaunch, PartitionPlan};
pub use real::Real;
pub use tables::{pack2, pack4, DeviceTables, HostTables, TableLayout};
