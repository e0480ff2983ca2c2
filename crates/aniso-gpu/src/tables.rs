//! Device constant tables.
//!
//! Host per-type matrices are flattened into padded, row-major,
//! type-indexed tables once at initialization and stay read-only for the
//! engine's lifetime. When the true type count fits the fast
//! constant-memory capacity and the thread block is wide enough to load it
//! cooperatively, the tables are padded up to that capacity and the
//! dispatcher selects the constants-in-fast-memory point kernel.
//!
//! Table widths:
//! - `sigma_epsilon`: 2-wide (sigma, epsilon)
//! - `cut_form`: 2-wide (cutoff², form code)
//! - `lj1`: 4-wide (lj1, lj2, cutoff², form code)
//! - `lj3`: 4-wide (lj3, lj4, offset, unused)
//! - `shape`, `well`: per-type 4-wide vectors, not per-pair

use crate::memory::MemoryLedger;
use crate::real::Real;
use aniso_core::PairCoeffs;
use anyhow::{Context, Result};
use cudarc::driver::{CudaSlice, CudaStream};
use std::sync::Arc;

/// Padded table geometry plus the shared-fast-path decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    /// True number of particle types.
    pub ntypes: usize,
    /// Row/column count of the padded pair tables.
    pub padded: usize,
    /// True iff the pair tables fit fast constant memory AND the block is
    /// wide enough to stage them; consumed by the dispatcher to pick the
    /// fast point-point kernel.
    pub shared_const: bool,
}

impl TableLayout {
    /// Decides padding and the fast path.
    ///
    /// The flag is true iff `ntypes <= max_shared_types` and
    /// `block_size >= max_shared_types`; the padded count then becomes
    /// `max_shared_types` so the kernel-side static staging arrays line up.
    pub fn new(ntypes: usize, max_shared_types: usize, block_size: u32) -> Self {
        let shared_const = ntypes <= max_shared_types && block_size as usize >= max_shared_types;
        let padded = if shared_const { max_shared_types } else { ntypes };
        Self {
            ntypes,
            padded,
            shared_const,
        }
    }

    /// Entries in one padded pair table.
    pub fn pair_entries(&self) -> usize {
        self.padded * self.padded
    }
}

/// Interleaves two per-pair matrices into one 2-wide padded table,
/// zero-filling rows and columns beyond the true type count.
pub fn pack2<P: Real>(ntypes: usize, padded: usize, a: &[Vec<f64>], b: &[Vec<f64>]) -> Vec<P> {
    let mut out = vec![P::default(); padded * padded * 2];
    for i in 0..ntypes {
        for j in 0..ntypes {
            let k = (i * padded + j) * 2;
            out[k] = P::from_f64(a[i][j]);
            out[k + 1] = P::from_f64(b[i][j]);
        }
    }
    out
}

/// Interleaves four per-pair matrices into one 4-wide padded table.
pub fn pack4<P: Real>(
    ntypes: usize,
    padded: usize,
    a: &[Vec<f64>],
    b: &[Vec<f64>],
    c: &[Vec<f64>],
    d: &[Vec<f64>],
) -> Vec<P> {
    let mut out = vec![P::default(); padded * padded * 4];
    for i in 0..ntypes {
        for j in 0..ntypes {
            let k = (i * padded + j) * 4;
            out[k] = P::from_f64(a[i][j]);
            out[k + 1] = P::from_f64(b[i][j]);
            out[k + 2] = P::from_f64(c[i][j]);
            out[k + 3] = P::from_f64(d[i][j]);
        }
    }
    out
}

/// Flattened, precision-cast tables staged on the host before upload.
#[derive(Debug, Clone)]
pub struct HostTables<P: Real> {
    pub layout: TableLayout,
    pub sigma_epsilon: Vec<P>,
    pub cut_form: Vec<P>,
    pub lj1: Vec<P>,
    pub lj3: Vec<P>,
    /// Per-type ellipsoid semi-axes, 4-wide, w unused.
    pub shape: Vec<P>,
    /// Per-type well-depth anisotropy, 4-wide, w unused.
    pub well: Vec<P>,
    /// Form codes as a flat padded matrix, for the packing kernel.
    pub form: Vec<i32>,
    pub special_lj: [P; 4],
}

impl<P: Real> HostTables<P> {
    /// Builds all tables from validated coefficients.
    pub fn build(coeffs: &PairCoeffs, layout: TableLayout) -> Self {
        let n = coeffs.ntypes;
        let padded = layout.padded;

        let form_scalar: Vec<Vec<f64>> = coeffs
            .form
            .iter()
            .map(|row| row.iter().map(|&f| f as i32 as f64).collect())
            .collect();

        let mut form = vec![0i32; padded * padded];
        for i in 0..n {
            for j in 0..n {
                form[i * padded + j] = coeffs.form[i][j] as i32;
            }
        }

        let mut shape = vec![P::default(); n * 4];
        let mut well = vec![P::default(); n * 4];
        for i in 0..n {
            for k in 0..3 {
                shape[i * 4 + k] = P::from_f64(coeffs.shape[i][k]);
                well[i * 4 + k] = P::from_f64(coeffs.well[i][k]);
            }
        }

        Self {
            layout,
            sigma_epsilon: pack2(n, padded, &coeffs.sigma, &coeffs.epsilon),
            cut_form: pack2(n, padded, &coeffs.cutsq, &form_scalar),
            lj1: pack4(n, padded, &coeffs.lj1, &coeffs.lj2, &coeffs.cutsq, &form_scalar),
            lj3: pack4(
                n,
                padded,
                &coeffs.lj3,
                &coeffs.lj4,
                &coeffs.offset,
                &vec![vec![0.0; n]; n],
            ),
            shape,
            well,
            form,
            special_lj: [
                P::from_f64(coeffs.special_lj[0]),
                P::from_f64(coeffs.special_lj[1]),
                P::from_f64(coeffs.special_lj[2]),
                P::from_f64(coeffs.special_lj[3]),
            ],
        }
    }
}

/// Read-only tables resident on the accelerator.
pub struct DeviceTables<P: Real> {
    pub layout: TableLayout,
    pub sigma_epsilon: CudaSlice<P>,
    pub cut_form: CudaSlice<P>,
    pub lj1: CudaSlice<P>,
    pub lj3: CudaSlice<P>,
    pub shape: CudaSlice<P>,
    pub well: CudaSlice<P>,
    pub form: CudaSlice<i32>,
    pub special_lj: CudaSlice<P>,
    /// Total device bytes these tables occupy.
    pub bytes: usize,
}

fn upload<T: cudarc::driver::DeviceRepr + cudarc::driver::ValidAsZeroBits>(
    stream: &Arc<CudaStream>,
    host: &[T],
    ledger: &MemoryLedger,
    bytes: &mut usize,
    what: &str,
) -> Result<CudaSlice<T>> {
    let mut slice = stream
        .alloc_zeros::<T>(host.len().max(1))
        .with_context(|| format!("Failed to allocate device table: {what}"))?;
    if !host.is_empty() {
        stream
            .memcpy_htod(host, &mut slice)
            .with_context(|| format!("Failed to upload device table: {what}"))?;
    }
    *bytes += ledger.charge::<T>(host.len().max(1));
    Ok(slice)
}

impl<P: Real> DeviceTables<P> {
    /// Uploads staged tables, charging every allocation to the ledger.
    ///
    /// Any failure here is fatal to initialization; the partially built
    /// tables drop on the error path and the engine stays uninitialized.
    pub fn upload(
        stream: &Arc<CudaStream>,
        host: &HostTables<P>,
        ledger: &MemoryLedger,
    ) -> Result<Self> {
        let mut bytes = 0usize;
        let tables = Self {
            layout: host.layout,
            sigma_epsilon: upload(stream, &host.sigma_epsilon, ledger, &mut bytes, "sigma_epsilon")?,
            cut_form: upload(stream, &host.cut_form, ledger, &mut bytes, "cut_form")?,
            lj1: upload(stream, &host.lj1, ledger, &mut bytes, "lj1")?,
            lj3: upload(stream, &host.lj3, ledger, &mut bytes, "lj3")?,
            shape: upload(stream, &host.shape, ledger, &mut bytes, "shape")?,
            well: upload(stream, &host.well, ledger, &mut bytes, "well")?,
            form: upload(stream, &host.form, ledger, &mut bytes, "form")?,
            special_lj: upload(stream, &host.special_lj, ledger, &mut bytes, "special_lj")?,
            bytes,
        };
        log::debug!(
            "Device tables uploaded: {} types padded to {} ({} bytes, fast path: {})",
            host.layout.ntypes,
            host.layout.padded,
            tables.bytes,
            host.layout.shared_const
        );
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aniso_core::FormCode;

    const LIMIT: usize = 32;

    #[test]
    fn test_fast_path_boundaries() {
        // At the limit with a wide enough block: fast path on, padded up.
        let l = TableLayout::new(LIMIT, LIMIT, 64);
        assert!(l.shared_const);
        assert_eq!(l.padded, LIMIT);

        // One past the limit: off, no padding.
        let l = TableLayout::new(LIMIT + 1, LIMIT, 64);
        assert!(!l.shared_const);
        assert_eq!(l.padded, LIMIT + 1);

        // Block size exactly at the limit qualifies.
        let l = TableLayout::new(4, LIMIT, LIMIT as u32);
        assert!(l.shared_const);
        assert_eq!(l.padded, LIMIT);

        // Block size below the limit does not.
        let l = TableLayout::new(4, LIMIT, LIMIT as u32 / 2);
        assert!(!l.shared_const);
        assert_eq!(l.padded, 4);
    }

    #[test]
    fn test_pack2_pads_with_zeros() {
        let a = vec![vec![1.0, 2.0], vec![2.0, 3.0]];
        let b = vec![vec![5.0, 6.0], vec![6.0, 7.0]];
        let t: Vec<f64> = pack2(2, 4, &a, &b);
        assert_eq!(t.len(), 4 * 4 * 2);
        // (0,1) -> a=2, b=6
        assert_eq!(t[(0 * 4 + 1) * 2], 2.0);
        assert_eq!(t[(0 * 4 + 1) * 2 + 1], 6.0);
        // Padding rows/columns are zero.
        assert_eq!(t[(3 * 4 + 3) * 2], 0.0);
        assert_eq!(t[(0 * 4 + 2) * 2], 0.0);
    }

    #[test]
    fn test_pack4_interleaves() {
        let m = |v: f64| vec![vec![v; 2]; 2];
        let t: Vec<f32> = pack4(2, 2, &m(1.0), &m(2.0), &m(3.0), &m(4.0));
        assert_eq!(&t[0..4], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(t.len(), 2 * 2 * 4);
    }

    #[test]
    fn test_host_tables_carry_form_codes() {
        let n = 2;
        let square = |v: f64| vec![vec![v; n]; n];
        let coeffs = PairCoeffs {
            ntypes: n,
            shape: vec![[1.0, 1.5, 2.0]; n],
            well: vec![[1.0, 1.0, 0.5]; n],
            cutsq: square(16.0),
            sigma: square(1.0),
            epsilon: square(1.0),
            lj1: square(48.0),
            lj2: square(24.0),
            lj3: square(4.0),
            lj4: square(4.0),
            offset: square(0.0),
            form: vec![
                vec![FormCode::EllipseEllipse, FormCode::EllipseSphere],
                vec![FormCode::SphereEllipse, FormCode::SphereSphere],
            ],
            special_lj: [1.0, 0.5, 0.25, 0.125],
        };
        coeffs.validate().unwrap();

        let layout = TableLayout::new(n, LIMIT, 16);
        assert!(!layout.shared_const);
        let host: HostTables<f32> = HostTables::build(&coeffs, layout);

        // cut_form second lane carries the form code as a scalar.
        assert_eq!(host.cut_form[(0 * n + 1) * 2 + 1], 2.0);
        assert_eq!(host.form[0 * n + 1], 2);
        // shape is per-type, 4-wide, w zeroed.
        assert_eq!(host.shape.len(), n * 4);
        assert_eq!(host.shape[1], 1.5);
        assert_eq!(host.shape[3], 0.0);
        assert_eq!(host.special_lj[3], 0.125);
    }
}
