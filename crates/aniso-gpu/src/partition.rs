//! Interaction-form classification and per-step launch planning.
//!
//! The particle index space is cut by a single boundary into an
//! extended-body prefix and a point-particle suffix. Every index below the
//! boundary must be an extended body; the check here is correctness, not
//! tuning — a misplaced boundary silently evaluates pairs with the wrong
//! kernel.
//!
//! Group order within a step is fixed: extended↔extended, extended↔point,
//! point↔extended, point↔point. Skipped groups stay in the result schema
//! with zeroed timers so downstream aggregation is uniform.

use aniso_core::{EngineError, FormCode, LaunchSpan, ParticleRole, Result};

/// Which specialized kernel a group launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Extended↔extended pairs over the prefix.
    EllipseEllipse,
    /// Extended↔point pairs over the prefix.
    EllipseSphere,
    /// Point↔extended pairs over the suffix.
    SphereEllipse,
    /// Point↔point pairs over the suffix; `fast` selects the
    /// constants-in-fast-memory variant.
    PointPoint { fast: bool },
}

/// One planned kernel launch: owner range, pack filter, and grid geometry.
#[derive(Debug, Clone, Copy)]
pub struct GroupLaunch {
    pub kind: GroupKind,
    pub span: LaunchSpan,
    /// Form-code range the packing pass accepts; `None` reuses the plain
    /// packed list built at staging time.
    pub filter: Option<(FormCode, FormCode)>,
    /// Work-groups for the pair kernel.
    pub grid: u32,
    /// Work-groups for the packing kernel (one thread per owner).
    pub pack_grid: u32,
    /// Threads cooperating per owner in the pair kernel.
    pub threads_per_atom: u32,
}

/// Work-groups of `block_size` threads covering `count` owners with
/// `threads_per_atom` threads each.
#[inline]
pub fn grid_for(count: usize, block_size: u32, threads_per_atom: u32) -> u32 {
    let owners_per_block = (block_size / threads_per_atom).max(1);
    (count as u32).div_ceil(owners_per_block)
}

/// Derives the partition boundary from the role array, enforcing the
/// contiguous-prefix invariant.
pub fn classify_boundary(roles: &[ParticleRole]) -> Result<usize> {
    let last_ellipse = roles
        .iter()
        .take_while(|&&r| r == ParticleRole::Extended)
        .count();
    if roles[last_ellipse..]
        .iter()
        .any(|&r| r == ParticleRole::Extended)
    {
        return Err(EngineError::validation(
            "extended bodies must form a contiguous prefix of the owner ordering",
        ));
    }
    Ok(last_ellipse)
}

/// The per-step partition: boundary, owner count, and whether the system
/// mixes interaction forms at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPlan {
    pub inum: usize,
    pub last_ellipse: usize,
    pub multiple_forms: bool,
}

impl PartitionPlan {
    pub fn new(inum: usize, last_ellipse: usize, multiple_forms: bool) -> Result<Self> {
        if last_ellipse > inum {
            return Err(EngineError::validation(format!(
                "partition boundary {last_ellipse} exceeds owner count {inum}"
            )));
        }
        Ok(Self {
            inum,
            last_ellipse,
            multiple_forms,
        })
    }

    /// True when the extended groups are skipped wholesale and the
    /// accumulator must be zeroed explicitly before the point group runs.
    pub fn skips_extended(&self) -> bool {
        self.multiple_forms && self.last_ellipse == 0
    }

    /// Plans the step's kernel launches in fixed order with the skip rules
    /// applied.
    pub fn groups(
        &self,
        block_size: u32,
        threads_per_atom: u32,
        shared_const: bool,
    ) -> Vec<GroupLaunch> {
        let mut out = Vec::with_capacity(4);
        if self.inum == 0 {
            return out;
        }

        if !self.multiple_forms {
            // Uniform extended system: one kernel covers everything with
            // an accept-all pack filter.
            let span = LaunchSpan::new(0, self.inum, self.inum);
            out.push(GroupLaunch {
                kind: GroupKind::EllipseEllipse,
                span,
                filter: Some((FormCode::SphereSphere, FormCode::EllipseEllipse)),
                grid: grid_for(self.inum, block_size, threads_per_atom),
                pack_grid: grid_for(self.inum, block_size, 1),
                threads_per_atom,
            });
            return out;
        }

        let last = self.last_ellipse;
        if last > 0 {
            let prefix = LaunchSpan::new(0, last, self.inum);
            let grid = grid_for(last, block_size, threads_per_atom);
            let pack_grid = grid_for(last, block_size, 1);
            out.push(GroupLaunch {
                kind: GroupKind::EllipseEllipse,
                span: prefix,
                filter: Some((FormCode::EllipseEllipse, FormCode::EllipseEllipse)),
                grid,
                pack_grid,
                threads_per_atom,
            });
            out.push(GroupLaunch {
                kind: GroupKind::EllipseSphere,
                span: prefix,
                filter: Some((FormCode::EllipseSphere, FormCode::EllipseSphere)),
                grid,
                pack_grid,
                threads_per_atom,
            });
        }

        if last < self.inum {
            let suffix = LaunchSpan::new(last, self.inum, self.inum);
            let count = self.inum - last;
            if last > 0 {
                out.push(GroupLaunch {
                    kind: GroupKind::SphereEllipse,
                    span: suffix,
                    filter: Some((FormCode::SphereEllipse, FormCode::SphereEllipse)),
                    grid: grid_for(count, block_size, threads_per_atom),
                    pack_grid: grid_for(count, block_size, 1),
                    threads_per_atom,
                });
            }
            out.push(GroupLaunch {
                kind: GroupKind::PointPoint { fast: shared_const },
                span: suffix,
                filter: None,
                grid: grid_for(count, block_size, 1),
                pack_grid: grid_for(count, block_size, 1),
                threads_per_atom: 1,
            });
        }

        out
    }
}
