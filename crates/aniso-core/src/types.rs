//! Core data types shared between the host simulation and the accelerator
//! engine.
//!
//! ## Memory layout notes
//!
//! - Per-type-pair coefficient matrices are carried here in their host form
//!   (row-per-type nested vectors); the engine flattens them into padded,
//!   type-indexed device tables at initialization.
//! - The compressed neighbor list keeps the device wire format (a flat pool
//!   with an inline count word preceding each payload run) but addresses it
//!   through explicit tagged records instead of positional convention.

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Bit position of the bonded-scaling class inside a neighbor word.
///
/// The top two bits of each neighbor index carry the bond-separation class
/// (0 = unbonded, 1..3 = topologically close pair classes); the low 30 bits
/// carry the actual particle index.
pub const SBBITS: u32 = 30;

/// Mask extracting the particle index from a neighbor word.
pub const NEIGH_MASK: i32 = 0x3FFF_FFFF;

/// Splits a neighbor word into (particle index, bond-separation class).
#[inline]
pub fn decode_neighbor(word: i32) -> (i32, usize) {
    (word & NEIGH_MASK, (word as u32 >> SBBITS) as usize)
}

/// Interaction-form code for a type pair, selecting which specialized
/// kernel evaluates the pair.
///
/// The numeric order matters: packing filters accept a contiguous range of
/// codes, and the accept-all filter is `[SphereSphere, EllipseEllipse]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum FormCode {
    SphereSphere = 0,
    SphereEllipse = 1,
    EllipseSphere = 2,
    EllipseEllipse = 3,
}

impl FormCode {
    /// Decodes a raw table value.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(FormCode::SphereSphere),
            1 => Some(FormCode::SphereEllipse),
            2 => Some(FormCode::EllipseSphere),
            3 => Some(FormCode::EllipseEllipse),
            _ => None,
        }
    }

    /// Form of a pair given the two roles (owner first).
    pub fn of(owner: ParticleRole, neighbor: ParticleRole) -> Self {
        match (owner, neighbor) {
            (ParticleRole::Point, ParticleRole::Point) => FormCode::SphereSphere,
            (ParticleRole::Point, ParticleRole::Extended) => FormCode::SphereEllipse,
            (ParticleRole::Extended, ParticleRole::Point) => FormCode::EllipseSphere,
            (ParticleRole::Extended, ParticleRole::Extended) => FormCode::EllipseEllipse,
        }
    }
}

/// Role flag distinguishing point particles from extended bodies with an
/// orientation-dependent interaction law.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleRole {
    Point,
    Extended,
}

/// Evaluation flags for one step: whether per-atom energy and virial/stress
/// contributions are accumulated in addition to forces and torques.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EvalFlags {
    pub energy: bool,
    pub virial: bool,
}

/// Atom counts handed over at initialization. `nlocal` atoms are owned by
/// this domain; `nall` includes ghosts staged for neighbor access.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AtomCounts {
    pub nlocal: usize,
    pub nall: usize,
}

impl AtomCounts {
    pub fn validate(&self) -> Result<()> {
        if self.nall < self.nlocal {
            return Err(EngineError::validation(format!(
                "nall ({}) must be >= nlocal ({})",
                self.nall, self.nlocal
            )));
        }
        Ok(())
    }
}

/// Tagged record addressing one owner's run inside the compressed pool.
///
/// The wire contract is count-then-payload: `pool[payload_start]` holds the
/// run length and `pool[payload_start + 1 ..= payload_start + count]` holds
/// the neighbor words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NborEntry {
    pub count: i32,
    pub payload_start: i32,
}

/// Compressed adjacency: one entry per owner particle plus the flat index
/// pool. Optimized for host-side construction, not for accelerator access;
/// the engine repacks it every time it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressedNeighborList {
    entries: Vec<NborEntry>,
    pool: Vec<i32>,
}

impl CompressedNeighborList {
    /// Builds the count-then-payload pool from per-owner adjacency runs.
    /// Neighbor words are stored verbatim (bond-class bits included).
    pub fn from_adjacency(adjacency: &[Vec<i32>]) -> Self {
        let total: usize = adjacency.iter().map(|n| n.len() + 1).sum();
        let mut pool = Vec::with_capacity(total);
        let mut entries = Vec::with_capacity(adjacency.len());
        for neighbors in adjacency {
            entries.push(NborEntry {
                count: neighbors.len() as i32,
                payload_start: pool.len() as i32,
            });
            pool.push(neighbors.len() as i32);
            pool.extend_from_slice(neighbors);
        }
        Self { entries, pool }
    }

    /// Checks the tagged records against the inline counts and pool bounds.
    pub fn validate(&self) -> Result<()> {
        for (i, e) in self.entries.iter().enumerate() {
            if e.count < 0 || e.payload_start < 0 {
                return Err(EngineError::validation(format!(
                    "owner {i}: negative count or offset"
                )));
            }
            let start = e.payload_start as usize;
            if start >= self.pool.len() || start + 1 + e.count as usize > self.pool.len() {
                return Err(EngineError::validation(format!(
                    "owner {i}: payload run at {start} (count {}) exceeds pool of {}",
                    e.count,
                    self.pool.len()
                )));
            }
            if self.pool[start] != e.count {
                return Err(EngineError::validation(format!(
                    "owner {i}: inline count {} disagrees with entry count {}",
                    self.pool[start], e.count
                )));
            }
        }
        Ok(())
    }

    /// Number of owner particles.
    pub fn owners(&self) -> usize {
        self.entries.len()
    }

    /// Largest per-owner neighbor count.
    pub fn max_count(&self) -> usize {
        self.entries.iter().map(|e| e.count as usize).max().unwrap_or(0)
    }

    pub fn entry(&self, owner: usize) -> NborEntry {
        self.entries[owner]
    }

    /// The neighbor words of one owner (count word excluded).
    pub fn payload(&self, owner: usize) -> &[i32] {
        let e = self.entries[owner];
        let start = e.payload_start as usize + 1;
        &self.pool[start..start + e.count as usize]
    }

    /// Raw pool in wire layout, for device upload.
    pub fn pool(&self) -> &[i32] {
        &self.pool
    }

    /// Per-owner payload offsets, for device upload.
    pub fn starts(&self) -> Vec<i32> {
        self.entries.iter().map(|e| e.payload_start).collect()
    }
}

/// Host-side per-type interaction coefficients handed to initialization.
///
/// All pair matrices are `ntypes x ntypes` and symmetric for a symmetric
/// interaction law; `shape` and `well` are per-type (not per-pair).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairCoeffs {
    pub ntypes: usize,
    /// Ellipsoid semi-axes per type.
    pub shape: Vec<[f64; 3]>,
    /// Well-depth anisotropy per type.
    pub well: Vec<[f64; 3]>,
    pub cutsq: Vec<Vec<f64>>,
    pub sigma: Vec<Vec<f64>>,
    pub epsilon: Vec<Vec<f64>>,
    pub lj1: Vec<Vec<f64>>,
    pub lj2: Vec<Vec<f64>>,
    pub lj3: Vec<Vec<f64>>,
    pub lj4: Vec<Vec<f64>>,
    pub offset: Vec<Vec<f64>>,
    pub form: Vec<Vec<FormCode>>,
    /// Bonded-scaling vector: one attenuation factor per bond-separation
    /// class. Immutable after initialization.
    pub special_lj: [f64; 4],
}

impl PairCoeffs {
    /// Validates matrix shapes and the symmetry invariants the device
    /// tables rely on.
    pub fn validate(&self) -> Result<()> {
        let n = self.ntypes;
        if n == 0 {
            return Err(EngineError::validation("ntypes must be positive"));
        }
        if self.shape.len() != n || self.well.len() != n {
            return Err(EngineError::validation(
                "shape/well must have one row per type",
            ));
        }
        let square = |name: &str, m: &Vec<Vec<f64>>| -> Result<()> {
            if m.len() != n || m.iter().any(|row| row.len() != n) {
                return Err(EngineError::validation(format!("{name} must be {n}x{n}")));
            }
            Ok(())
        };
        square("cutsq", &self.cutsq)?;
        square("sigma", &self.sigma)?;
        square("epsilon", &self.epsilon)?;
        square("lj1", &self.lj1)?;
        square("lj2", &self.lj2)?;
        square("lj3", &self.lj3)?;
        square("lj4", &self.lj4)?;
        square("offset", &self.offset)?;
        if self.form.len() != n || self.form.iter().any(|row| row.len() != n) {
            return Err(EngineError::validation(format!("form must be {n}x{n}")));
        }
        for i in 0..n {
            for j in (i + 1)..n {
                if self.cutsq[i][j] != self.cutsq[j][i] {
                    return Err(EngineError::validation(format!(
                        "cutsq not symmetric at ({i}, {j})"
                    )));
                }
            }
        }
        Ok(())
    }

    /// True when the form matrix mixes interaction geometries; false for a
    /// uniform extended-body system, which takes the single-form fast path.
    pub fn multiple_forms(&self) -> bool {
        self.form
            .iter()
            .flatten()
            .any(|&f| f != FormCode::EllipseEllipse)
    }
}
