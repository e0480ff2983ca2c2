//! Collaborator seams between the host simulation and the engine.
//!
//! The engine never owns particle state or adjacency; it reads both through
//! these traits each step. Dump/trajectory readers, domain decomposition,
//! and integrators live behind them, outside this workspace.

use crate::types::{CompressedNeighborList, ParticleRole};

/// Source of the current particle state snapshot.
///
/// Positions are 4-wide per atom (`x, y, z, type-as-scalar`) and
/// orientations are unit quaternions, 4-wide per atom, present only for
/// systems with extended bodies. Layouts match the device buffers the
/// engine stages, so providers can hand over slices without reshaping.
pub trait ParticleStateProvider {
    /// Total staged atom count, ghosts included.
    fn nall(&self) -> usize;

    /// Locally owned atom count.
    fn nlocal(&self) -> usize;

    /// 4-wide positions, `nall * 4` scalars.
    fn positions(&self) -> &[f64];

    /// 4-wide quaternions, `nall * 4` scalars; `None` for all-point systems.
    fn orientations(&self) -> Option<&[f64]>;

    /// Role per atom, `nall` entries. Extended bodies must form a
    /// contiguous prefix of the owner ordering.
    fn roles(&self) -> &[ParticleRole];
}

/// Source of the current compressed adjacency.
pub trait NeighborListProvider {
    /// The compressed list for the current step. Rebuilt upstream whenever
    /// particles migrate; the engine repacks on every change.
    fn compressed(&self) -> &CompressedNeighborList;
}
