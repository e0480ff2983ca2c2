//! Neighbor-list packing.
//!
//! The compressed list (count-then-payload pool, host-built) is reshaped
//! every time it changes into a flat packed array laid out for coalesced
//! accelerator access: column per owner, global stride equal to the owner
//! count, so all owners' k-th neighbor entries sit adjacent in memory.
//! Per-owner capacity is regrouped into blocks of 4 (minimum one block) to
//! align the consumption width of the vectorized kernels.
//!
//! Two packers exist with identical semantics:
//! - the accelerator kernels (`kernel_unpack`, `kernel_pack`) for the
//!   device share of owners;
//! - a host reference implementation used for the host share of a split
//!   run and as the oracle in tests.
//!
//! Both are idempotent: repeated invocation against unchanged input yields
//! bit-identical packed output.

use aniso_core::{CompressedNeighborList, FormCode, NEIGH_MASK};
use anyhow::{Context, Result};
use cudarc::driver::{CudaFunction, CudaSlice, CudaStream, DeviceRepr, LaunchConfig, PushKernelArg};
use rayon::prelude::*;
use std::sync::Arc;

use crate::memory::MemoryLedger;

/// Owner index range passed by value to packing and pair kernels.
/// Layout must match `struct LaunchSpan` in `src/kernels/ellipsoid_pair.cu`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceSpan {
    pub begin: i32,
    pub end: i32,
    pub inum: i32,
    pub stride: i32,
}

unsafe impl DeviceRepr for DeviceSpan {}

impl From<aniso_core::LaunchSpan> for DeviceSpan {
    fn from(s: aniso_core::LaunchSpan) -> Self {
        Self {
            begin: s.begin,
            end: s.end,
            inum: s.inum,
            stride: s.stride,
        }
    }
}

/// Blocks of 4 needed for `n` neighbors, minimum one block.
#[inline]
pub fn blocks_of_four(n: usize) -> usize {
    (n.div_ceil(4)).max(1)
}

/// Rows of the packed array: one count row plus the block-aligned
/// neighbor capacity.
#[inline]
pub fn packed_rows(max_nbors: usize) -> usize {
    1 + 4 * blocks_of_four(max_nbors)
}

/// Host-side packed pair list mirroring the device layout exactly.
///
/// Derived data: rebuilt whenever the compressed list changes, never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedNeighbors {
    inum: usize,
    rows: usize,
    data: Vec<i32>,
}

impl PackedNeighbors {
    pub fn new(inum: usize, max_nbors: usize) -> Self {
        let rows = packed_rows(max_nbors);
        Self {
            inum,
            rows,
            data: vec![0; rows * inum.max(1)],
        }
    }

    pub fn inum(&self) -> usize {
        self.inum
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Packed neighbor count of one owner.
    pub fn count(&self, owner: usize) -> usize {
        self.data[owner] as usize
    }

    /// The k-th packed neighbor word of one owner.
    pub fn neighbor(&self, owner: usize, k: usize) -> i32 {
        self.data[(1 + k) * self.inum + owner]
    }

    /// All packed neighbor words of one owner, in payload order.
    pub fn neighbors(&self, owner: usize) -> Vec<i32> {
        (0..self.count(owner)).map(|k| self.neighbor(owner, k)).collect()
    }

    pub fn raw(&self) -> &[i32] {
        &self.data
    }
}

/// Reference unpack: expands the compressed list into the packed layout,
/// copying every owner's full payload.
///
/// Semantics match `kernel_unpack`: one logical unit per owner, zero copy
/// iterations for an empty run, output advanced by the global stride per
/// element.
pub fn unpack_host(list: &CompressedNeighborList, out: &mut PackedNeighbors) -> Result<()> {
    let inum = list.owners();
    anyhow::ensure!(
        inum == out.inum,
        "packed buffer sized for {} owners, list has {}",
        out.inum,
        inum
    );
    for i in 0..inum {
        let payload = list.payload(i);
        anyhow::ensure!(
            1 + payload.len() <= out.rows,
            "owner {i} has {} neighbors, capacity is {}",
            payload.len(),
            out.rows - 1
        );
        out.data[i] = payload.len() as i32;
        for (k, &word) in payload.iter().enumerate() {
            out.data[(1 + k) * inum + i] = word;
        }
    }
    Ok(())
}

/// Reference form-filtered pack: keeps only neighbors whose (owner type,
/// neighbor type) form code falls in `lo..=hi`, for owners in
/// `begin..end`. Columns outside the range are left untouched.
///
/// The filter consults the padded form table exactly as `kernel_pack`
/// does; bond-class bits are preserved on the kept words.
#[allow(clippy::too_many_arguments)]
pub fn pack_host(
    list: &CompressedNeighborList,
    types: &[i32],
    form_table: &[i32],
    padded_types: usize,
    lo: FormCode,
    hi: FormCode,
    begin: usize,
    end: usize,
    out: &mut PackedNeighbors,
) -> Result<()> {
    let inum = list.owners();
    anyhow::ensure!(inum == out.inum, "owner count mismatch");
    anyhow::ensure!(begin <= end && end <= inum, "bad owner range");

    let (lo, hi) = (lo as i32, hi as i32);
    let filtered: Vec<(usize, Vec<i32>)> = (begin..end)
        .into_par_iter()
        .map(|i| {
            let ti = types[i] as usize;
            let kept: Vec<i32> = list
                .payload(i)
                .iter()
                .copied()
                .filter(|&word| {
                    let j = (word & NEIGH_MASK) as usize;
                    let f = form_table[ti * padded_types + types[j] as usize];
                    f >= lo && f <= hi
                })
                .collect();
            (i, kept)
        })
        .collect();

    for (i, kept) in filtered {
        anyhow::ensure!(
            1 + kept.len() <= out.rows,
            "owner {i}: filtered count {} exceeds capacity",
            kept.len()
        );
        out.data[i] = kept.len() as i32;
        for (k, word) in kept.into_iter().enumerate() {
            out.data[(1 + k) * inum + i] = word;
        }
    }
    Ok(())
}

/// Device-resident neighbor storage: the uploaded compressed pool plus the
/// two packed arrays (plain for the point kernels, form-filtered for the
/// extended-body kernels).
pub struct NborDevice {
    capacity: usize,
    rows: usize,
    inum: usize,
    dev_ij: CudaSlice<i32>,
    dev_start: CudaSlice<i32>,
    /// Form-filtered packed list, rebuilt per interaction group.
    pub dev_nbor: CudaSlice<i32>,
    /// Plain packed list covering every neighbor, rebuilt per step.
    pub dev_packed: CudaSlice<i32>,
    /// Total device bytes held.
    pub bytes: usize,
}

impl NborDevice {
    /// Allocates for up to `capacity` owners with `max_nbors` neighbors
    /// each, charging the ledger.
    pub fn new(
        stream: &Arc<CudaStream>,
        capacity: usize,
        max_nbors: usize,
        ledger: &MemoryLedger,
    ) -> Result<Self> {
        let rows = packed_rows(max_nbors);
        let pool_cap = capacity * (max_nbors + 1);
        let packed_cap = capacity * rows;
        let mut bytes = 0usize;

        let dev_ij = stream
            .alloc_zeros::<i32>(pool_cap.max(1))
            .context("Failed to allocate neighbor pool")?;
        bytes += ledger.charge::<i32>(pool_cap.max(1));
        let dev_start = stream
            .alloc_zeros::<i32>(capacity.max(1))
            .context("Failed to allocate neighbor starts")?;
        bytes += ledger.charge::<i32>(capacity.max(1));
        let dev_nbor = stream
            .alloc_zeros::<i32>(packed_cap.max(1))
            .context("Failed to allocate packed list")?;
        bytes += ledger.charge::<i32>(packed_cap.max(1));
        let dev_packed = stream
            .alloc_zeros::<i32>(packed_cap.max(1))
            .context("Failed to allocate plain packed list")?;
        bytes += ledger.charge::<i32>(packed_cap.max(1));

        Ok(Self {
            capacity,
            rows,
            inum: 0,
            dev_ij,
            dev_start,
            dev_nbor,
            dev_packed,
            bytes,
        })
    }

    /// Uploads a validated compressed list. The staged owner count becomes
    /// the packed stride until the next stage.
    pub fn stage(&mut self, stream: &Arc<CudaStream>, list: &CompressedNeighborList) -> Result<()> {
        list.validate().map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let inum = list.owners();
        anyhow::ensure!(
            inum <= self.capacity,
            "compressed list has {inum} owners, device capacity is {}",
            self.capacity
        );
        anyhow::ensure!(
            1 + list.max_count() <= self.rows,
            "max neighbor count {} exceeds configured bound {}",
            list.max_count(),
            self.rows - 1
        );

        let starts = list.starts();
        if !list.pool().is_empty() {
            let mut pool_view = self.dev_ij.slice_mut(0..list.pool().len());
            stream
                .memcpy_htod(list.pool(), &mut pool_view)
                .context("Failed to upload neighbor pool")?;
        }
        if !starts.is_empty() {
            let mut starts_view = self.dev_start.slice_mut(0..starts.len());
            stream
                .memcpy_htod(&starts, &mut starts_view)
                .context("Failed to upload neighbor starts")?;
        }
        self.inum = inum;
        log::debug!("Staged compressed list: {} owners, pool {}", inum, list.pool().len());
        Ok(())
    }

    /// Staged owner count.
    pub fn inum(&self) -> usize {
        self.inum
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Launches the plain unpack over all staged owners into `dev_packed`.
    pub fn launch_unpack(
        &mut self,
        stream: &Arc<CudaStream>,
        kernel: &CudaFunction,
        block_size: u32,
    ) -> Result<()> {
        if self.inum == 0 {
            return Ok(());
        }
        let grid = (self.inum as u32).div_ceil(block_size);
        let cfg = LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (block_size, 1, 1),
            shared_mem_bytes: 0,
        };
        let inum = self.inum as i32;
        unsafe {
            let mut builder = stream.launch_builder(kernel);
            builder.arg(&self.dev_packed);
            builder.arg(&self.dev_ij);
            builder.arg(&self.dev_start);
            builder.arg(&inum);
            builder.launch(cfg).context("kernel_unpack launch failed")?;
        }
        Ok(())
    }

    /// Launches the form-filtered pack for one owner range into
    /// `dev_nbor`.
    #[allow(clippy::too_many_arguments)]
    pub fn launch_pack(
        &mut self,
        stream: &Arc<CudaStream>,
        kernel: &CudaFunction,
        dev_type: &CudaSlice<i32>,
        dev_form: &CudaSlice<i32>,
        padded_types: i32,
        span: DeviceSpan,
        lo: FormCode,
        hi: FormCode,
        block_size: u32,
    ) -> Result<()> {
        let count = (span.end - span.begin).max(0) as u32;
        if count == 0 {
            return Ok(());
        }
        let grid = count.div_ceil(block_size);
        let cfg = LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (block_size, 1, 1),
            shared_mem_bytes: 0,
        };
        let (lo, hi) = (lo as i32, hi as i32);
        unsafe {
            let mut builder = stream.launch_builder(kernel);
            builder.arg(&self.dev_nbor);
            builder.arg(&self.dev_ij);
            builder.arg(&self.dev_start);
            builder.arg(dev_type);
            builder.arg(dev_form);
            builder.arg(&padded_types);
            builder.arg(&span);
            builder.arg(&lo);
            builder.arg(&hi);
            builder.launch(cfg).context("kernel_pack launch failed")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aniso_core::SBBITS;

    fn list_with_counts(counts: &[usize]) -> CompressedNeighborList {
        let mut next = 0i32;
        let adj: Vec<Vec<i32>> = counts
            .iter()
            .map(|&n| {
                (0..n)
                    .map(|_| {
                        next += 1;
                        next
                    })
                    .collect()
            })
            .collect();
        CompressedNeighborList::from_adjacency(&adj)
    }

    #[test]
    fn test_unpack_round_trip_counts() {
        // Boundary counts around the block-of-4 regrouping.
        for &n in &[0usize, 1, 4, 5, 1000] {
            let list = list_with_counts(&[n]);
            let mut packed = PackedNeighbors::new(1, n.max(1));
            unpack_host(&list, &mut packed).unwrap();
            assert_eq!(packed.count(0), n, "count for n={n}");
            assert_eq!(
                packed.neighbors(0),
                list.payload(0).to_vec(),
                "payload order preserved for n={n}"
            );
        }
    }

    #[test]
    fn test_unpack_is_idempotent() {
        let list = list_with_counts(&[3, 0, 7, 1]);
        let mut a = PackedNeighbors::new(4, 8);
        unpack_host(&list, &mut a).unwrap();
        let first = a.clone();
        unpack_host(&list, &mut a).unwrap();
        assert_eq!(a.raw(), first.raw(), "repeated unpack must be bit-identical");
    }

    #[test]
    fn test_packed_layout_is_column_interleaved() {
        let list = list_with_counts(&[2, 2]);
        let mut packed = PackedNeighbors::new(2, 4);
        unpack_host(&list, &mut packed).unwrap();
        // Counts occupy row 0; both owners' k-th neighbors are adjacent.
        assert_eq!(&packed.raw()[0..2], &[2, 2]);
        assert_eq!(packed.raw()[2], packed.neighbor(0, 0));
        assert_eq!(packed.raw()[3], packed.neighbor(1, 0));
    }

    #[test]
    fn test_blocks_of_four_minimum_one() {
        assert_eq!(blocks_of_four(0), 1);
        assert_eq!(blocks_of_four(1), 1);
        assert_eq!(blocks_of_four(4), 1);
        assert_eq!(blocks_of_four(5), 2);
        assert_eq!(packed_rows(5), 1 + 8);
    }

    #[test]
    fn test_overflowing_owner_rejected() {
        let list = list_with_counts(&[9]);
        let mut packed = PackedNeighbors::new(1, 4);
        assert!(unpack_host(&list, &mut packed).is_err());
    }

    #[test]
    fn test_filtered_pack_honors_form_range() {
        // Two types: type 0 extended, type 1 point. Owner 0 is extended
        // with a mixed neighborhood.
        let adj = vec![vec![1, 2, 3], vec![0], vec![0], vec![0]];
        let list = CompressedNeighborList::from_adjacency(&adj);
        let types = vec![0, 0, 1, 1];
        // 2x2 form table, padded == 2.
        let form = vec![
            FormCode::EllipseEllipse as i32,
            FormCode::EllipseSphere as i32,
            FormCode::SphereEllipse as i32,
            FormCode::SphereSphere as i32,
        ];

        let mut packed = PackedNeighbors::new(4, 4);
        pack_host(
            &list,
            &types,
            &form,
            2,
            FormCode::EllipseSphere,
            FormCode::EllipseSphere,
            0,
            1,
            &mut packed,
        )
        .unwrap();
        // Owner 0 keeps only its point neighbors (2 and 3).
        assert_eq!(packed.count(0), 2);
        assert_eq!(packed.neighbors(0), vec![2, 3]);
    }

    #[test]
    fn test_filtered_pack_preserves_bond_class_bits() {
        let tagged = (1 << SBBITS) | 1;
        let adj = vec![vec![tagged], vec![0]];
        let list = CompressedNeighborList::from_adjacency(&adj);
        let types = vec![0, 0];
        let form = vec![FormCode::EllipseEllipse as i32];

        let mut packed = PackedNeighbors::new(2, 4);
        pack_host(
            &list,
            &types,
            &form,
            1,
            FormCode::SphereSphere,
            FormCode::EllipseEllipse,
            0,
            2,
            &mut packed,
        )
        .unwrap();
        assert_eq!(packed.neighbor(0, 0), tagged);
    }
}
