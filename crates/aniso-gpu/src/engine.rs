//! Multi-form pair dispatch engine.
//!
//! One engine instance owns the device-resident state for a single pair
//! style: constant tables, neighbor storage, output accumulators, and the
//! sticky error flag. The host simulation stages particles and the
//! compressed neighbor list, then calls [`EllipsoidPairGpu::compute`] once
//! per step; forces, torques, energy, and virial contributions are read
//! back through the accumulator accessors.
//!
//! ## Lifecycle
//!
//! uninitialized → allocated → (evaluating)* → cleared
//!
//! Construction IS initialization: a successfully built engine is in the
//! allocated state, and a failed build retains nothing (every device
//! buffer releases on the error path). `clear()` is idempotent and runs a
//! final error-flag check; `Drop` clears as a backstop, so release is
//! guaranteed on all exit paths.
//!
//! ## Error channels
//!
//! Host-side failures surface eagerly as `Err`. Device-side numerical
//! faults surface through the sticky flag carried in each step's
//! [`StepOutcome`]; the accelerator never clears the flag and the host
//! resets it only by re-arming (a fresh engine).

use aniso_core::{
    AtomCounts, CompressedNeighborList, DeviceFault, EngineConfig, EvalFlags, PairCoeffs,
};
use anyhow::{Context, Result};
use cudarc::driver::{CudaFunction, CudaModule, CudaSlice, LaunchConfig, PushKernelArg};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::context::{GpuContext, PAIR_MODULE};
use crate::memory::MemoryLedger;
use crate::nbor::{packed_rows, DeviceSpan, NborDevice};
use crate::partition::{GroupKind, PartitionPlan};
use crate::real::Real;
use crate::tables::{DeviceTables, HostTables, TableLayout};

/// Strategy object naming the accelerator entry points of one interaction
/// model. Precision suffixes are appended at load time, so a set names
/// each kernel once.
#[derive(Debug, Clone)]
pub struct KernelSet {
    pub module: String,
    pub ellipsoid: String,
    pub ellipsoid_sphere: String,
    pub sphere_ellipsoid: String,
    pub lj: String,
    pub lj_fast: String,
    pub pack: String,
    pub unpack: String,
}

impl KernelSet {
    /// The ellipsoid pair model shipped with this crate.
    pub fn ellipsoid_pair() -> Self {
        Self {
            module: PAIR_MODULE.to_string(),
            ellipsoid: "k_ellipsoid".to_string(),
            ellipsoid_sphere: "k_ellipsoid_sphere".to_string(),
            sphere_ellipsoid: "k_sphere_ellipsoid".to_string(),
            lj: "k_lj".to_string(),
            lj_fast: "k_lj_fast".to_string(),
            pack: "kernel_pack".to_string(),
            unpack: "kernel_unpack".to_string(),
        }
    }
}

/// Kernel handles resolved from a [`KernelSet`] for one precision.
struct LoadedKernels {
    ellipsoid: CudaFunction,
    ellipsoid_sphere: CudaFunction,
    sphere_ellipsoid: CudaFunction,
    lj: CudaFunction,
    lj_fast: CudaFunction,
    pack: CudaFunction,
    unpack: CudaFunction,
}

impl LoadedKernels {
    fn load(module: &Arc<CudaModule>, set: &KernelSet, suffix: &str) -> Result<Self> {
        let pair = |name: &str| -> Result<CudaFunction> {
            let full = format!("{name}{suffix}");
            module
                .load_function(&full)
                .with_context(|| format!("Failed to load kernel {full}"))
        };
        Ok(Self {
            ellipsoid: pair(&set.ellipsoid)?,
            ellipsoid_sphere: pair(&set.ellipsoid_sphere)?,
            sphere_ellipsoid: pair(&set.sphere_ellipsoid)?,
            lj: pair(&set.lj)?,
            lj_fast: pair(&set.lj_fast)?,
            pack: module
                .load_function(&set.pack)
                .with_context(|| format!("Failed to load kernel {}", set.pack))?,
            unpack: module
                .load_function(&set.unpack)
                .with_context(|| format!("Failed to load kernel {}", set.unpack))?,
        })
    }
}

/// Host-side wall time spent packing and launching each interaction
/// group. Skipped groups stay at exactly zero so the schema is uniform
/// regardless of the partition.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GroupTimers {
    pub pack_ellipse_ms: f64,
    pub ellipse_ellipse_ms: f64,
    pub pack_ellipse_sphere_ms: f64,
    pub ellipse_sphere_ms: f64,
    pub pack_sphere_ellipse_ms: f64,
    pub sphere_ellipse_ms: f64,
    pub point_point_ms: f64,
}

impl GroupTimers {
    /// True when no extended-body group contributed.
    pub fn extended_all_zero(&self) -> bool {
        self.pack_ellipse_ms == 0.0
            && self.ellipse_ellipse_ms == 0.0
            && self.pack_ellipse_sphere_ms == 0.0
            && self.ellipse_sphere_ms == 0.0
            && self.pack_sphere_ellipse_ms == 0.0
            && self.sphere_ellipse_ms == 0.0
    }
}

/// Result of one per-step evaluation.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub timers: GroupTimers,
    /// Sticky device fault observed after this step's launches, if any.
    /// Once set, extended-body results for the step are invalid.
    pub fault: Option<DeviceFault>,
}

impl StepOutcome {
    /// Telemetry snapshot for the host's step-control logging.
    pub fn telemetry_json(&self) -> serde_json::Value {
        let code = match self.fault {
            None => 0,
            Some(DeviceFault::BadMatrixInversion) => 2,
            Some(DeviceFault::Unknown(c)) => c,
            Some(_) => -1,
        };
        serde_json::json!({
            "timers": self.timers,
            "fault_code": code,
        })
    }
}

/// Everything resident on the device for one allocated engine.
struct DeviceState<P: Real> {
    tables: DeviceTables<P>,
    nbor: NborDevice,
    dev_x: CudaSlice<P>,
    dev_quat: CudaSlice<P>,
    dev_type: CudaSlice<i32>,
    dev_ans: CudaSlice<P>,
    dev_engv: CudaSlice<P>,
    dev_error: CudaSlice<i32>,
    /// Total ledger bytes held by this state.
    bytes: usize,
    capacity: usize,
    last_ellipse: usize,
    staged_atoms: bool,
}

/// GPU pair engine for orientation-dependent interactions.
///
/// Generic over the device scalar `P` (f32 or f64); the interaction-form
/// kernels are supplied by a [`KernelSet`].
pub struct EllipsoidPairGpu<P: Real> {
    ctx: Arc<GpuContext>,
    kernels: LoadedKernels,
    config: EngineConfig,
    counts: AtomCounts,
    multiple_forms: bool,
    layout: TableLayout,
    ledger: MemoryLedger,
    state: Option<DeviceState<P>>,
}

impl<P: Real> EllipsoidPairGpu<P> {
    /// Builds all constant tables, allocates device storage, and zeroes
    /// the error flag. The returned engine is in the allocated state.
    ///
    /// # Errors
    /// Any allocation or upload failure aborts initialization; partially
    /// allocated buffers release on the error path and nothing is
    /// retained.
    pub fn initialize(
        ctx: Arc<GpuContext>,
        set: &KernelSet,
        coeffs: &PairCoeffs,
        counts: AtomCounts,
        mut config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        coeffs.validate()?;
        counts.validate()?;

        let module = ctx
            .get_module(&set.module)
            .with_context(|| format!("PTX module '{}' is not loaded", set.module))?
            .clone();
        let kernels = LoadedKernels::load(&module, set, P::KERNEL_SUFFIX)?;

        let layout = TableLayout::new(
            coeffs.ntypes,
            ctx.max_shared_types::<P>(),
            config.block_size,
        );
        let multiple_forms = coeffs.multiple_forms();

        let ledger = MemoryLedger::new();
        let stream = ctx.stream();

        let host_tables = HostTables::<P>::build(coeffs, layout);
        let tables = DeviceTables::upload(stream, &host_tables, &ledger)
            .context("constant table build failed")?;
        let mut bytes = tables.bytes;

        let capacity = config.device_share(counts.nlocal);
        let nbor = NborDevice::new(stream, capacity, config.max_nbors, &ledger)
            .context("neighbor storage allocation failed")?;
        bytes += nbor.bytes;

        let nall = counts.nall.max(1);
        let dev_x = stream
            .alloc_zeros::<P>(nall * 4)
            .context("Failed to allocate position buffer")?;
        bytes += ledger.charge::<P>(nall * 4);
        let dev_quat = stream
            .alloc_zeros::<P>(nall * 4)
            .context("Failed to allocate orientation buffer")?;
        bytes += ledger.charge::<P>(nall * 4);
        let dev_type = stream
            .alloc_zeros::<i32>(nall)
            .context("Failed to allocate type buffer")?;
        bytes += ledger.charge::<i32>(nall);

        let cap = capacity.max(1);
        let dev_ans = stream
            .alloc_zeros::<P>(cap * 8)
            .context("Failed to allocate force/torque accumulator")?;
        bytes += ledger.charge::<P>(cap * 8);
        let dev_engv = stream
            .alloc_zeros::<P>(cap * 7)
            .context("Failed to allocate energy/virial accumulator")?;
        bytes += ledger.charge::<P>(cap * 7);
        let dev_error = stream
            .alloc_zeros::<i32>(1)
            .context("Failed to allocate error flag")?;
        bytes += ledger.charge::<i32>(1);

        log::info!(
            "Pair engine allocated: {} types (padded {}), {} owners, {} bytes on device, fast path: {}",
            layout.ntypes,
            layout.padded,
            capacity,
            ledger.total_bytes(),
            layout.shared_const
        );

        Ok(Self {
            ctx,
            kernels,
            config,
            counts,
            multiple_forms,
            layout,
            ledger,
            state: Some(DeviceState {
                tables,
                nbor,
                dev_x,
                dev_quat,
                dev_type,
                dev_ans,
                dev_engv,
                dev_error,
                bytes,
                capacity,
                last_ellipse: 0,
                staged_atoms: false,
            }),
        })
    }

    /// Whether the engine holds device state.
    pub fn is_allocated(&self) -> bool {
        self.state.is_some()
    }

    /// Tracked device footprint in bytes.
    pub fn device_bytes(&self) -> usize {
        self.ledger.total_bytes()
    }

    /// Table layout decided at initialization.
    pub fn layout(&self) -> TableLayout {
        self.layout
    }

    /// Device bytes one owner costs with the given neighbor bound.
    pub fn bytes_per_atom(max_nbors: usize) -> usize {
        let scalars = (4 + 4 + 8 + 7) * std::mem::size_of::<P>();
        let ints = (1 + max_nbors + 1 + 2 * packed_rows(max_nbors)) * std::mem::size_of::<i32>();
        scalars + ints
    }

    /// Host-side footprint of the orchestration layer itself.
    pub fn host_memory_usage(&self) -> usize {
        std::mem::size_of::<Self>() + 4 * std::mem::size_of::<P>()
    }

    /// Stages the particle snapshot for the coming step.
    ///
    /// `x` is 4-wide per atom, `quat` 4-wide per atom (required whenever
    /// extended bodies are present), `types` one id per atom, and
    /// `last_ellipse` the partition boundary in the owner ordering.
    pub fn stage_particles(
        &mut self,
        x: &[P],
        quat: Option<&[P]>,
        types: &[i32],
        last_ellipse: usize,
    ) -> Result<()> {
        let nall = self.counts.nall;
        let state = self
            .state
            .as_mut()
            .context("stage_particles() on a cleared engine")?;
        anyhow::ensure!(
            x.len() == nall * 4,
            "position buffer must be nall*4 ({} != {})",
            x.len(),
            nall * 4
        );
        anyhow::ensure!(types.len() == nall, "type buffer must be nall");
        if self.multiple_forms && last_ellipse > 0 {
            anyhow::ensure!(
                quat.is_some(),
                "orientations are required while extended bodies are present"
            );
        }

        let stream = self.ctx.stream();
        if !x.is_empty() {
            let mut x_view = state.dev_x.slice_mut(0..x.len());
            stream
                .memcpy_htod(x, &mut x_view)
                .context("Failed to upload positions")?;
        }
        if let Some(q) = quat {
            anyhow::ensure!(q.len() == nall * 4, "orientation buffer must be nall*4");
            if !q.is_empty() {
                let mut q_view = state.dev_quat.slice_mut(0..q.len());
                stream
                    .memcpy_htod(q, &mut q_view)
                    .context("Failed to upload orientations")?;
            }
        }
        if !types.is_empty() {
            let mut t_view = state.dev_type.slice_mut(0..types.len());
            stream
                .memcpy_htod(types, &mut t_view)
                .context("Failed to upload types")?;
        }
        state.last_ellipse = last_ellipse;
        state.staged_atoms = true;
        Ok(())
    }

    /// Stages the compressed neighbor list and rebuilds the plain packed
    /// list on the device. Called whenever the upstream list changes.
    pub fn stage_neighbors(&mut self, list: &CompressedNeighborList) -> Result<()> {
        let block = self.config.block_size;
        let stream = self.ctx.stream().clone();
        let state = self
            .state
            .as_mut()
            .context("stage_neighbors() on a cleared engine")?;
        state.nbor.stage(&stream, list)?;
        state
            .nbor
            .launch_unpack(&stream, &self.kernels.unpack, block)?;
        Ok(())
    }

    /// Evaluates one step: packs each interaction group's neighbor
    /// sub-list, launches the matching kernels in fixed order, and reads
    /// back the sticky error flag.
    pub fn compute(&mut self, flags: EvalFlags) -> Result<StepOutcome> {
        anyhow::ensure!(
            self.state.is_some(),
            "compute() is only valid in the allocated state"
        );
        anyhow::ensure!(
            self.state.as_ref().map(|s| s.staged_atoms) == Some(true),
            "compute() before stage_particles()"
        );

        let inum = self.state.as_ref().map(|s| s.nbor.inum()).unwrap_or(0);
        let last_ellipse = self.state.as_ref().map(|s| s.last_ellipse).unwrap_or(0);
        anyhow::ensure!(
            last_ellipse <= inum,
            "partition boundary {last_ellipse} exceeds staged owner count {inum}"
        );

        let plan = PartitionPlan::new(inum, last_ellipse, self.multiple_forms)?;
        let mut timers = GroupTimers::default();

        if plan.skips_extended() {
            // The first group is skipped wholesale: clear the accumulator
            // so nothing from a previous step leaks into this one. The
            // extended timers stay at their zero defaults.
            self.zero_accumulators()?;
        }

        let groups = plan.groups(
            self.config.block_size,
            self.config.threads_per_atom,
            self.layout.shared_const,
        );
        for group in &groups {
            let span = DeviceSpan::from(group.span);
            if let Some((lo, hi)) = group.filter {
                let t = Instant::now();
                self.launch_pack(span, lo, hi)?;
                let ms = t.elapsed().as_secs_f64() * 1e3;
                match group.kind {
                    GroupKind::EllipseEllipse => timers.pack_ellipse_ms = ms,
                    GroupKind::EllipseSphere => timers.pack_ellipse_sphere_ms = ms,
                    GroupKind::SphereEllipse => timers.pack_sphere_ellipse_ms = ms,
                    GroupKind::PointPoint { .. } => {}
                }
            }

            let t = Instant::now();
            self.launch_pair(group.kind, span, group.grid, flags)?;
            let ms = t.elapsed().as_secs_f64() * 1e3;
            match group.kind {
                GroupKind::EllipseEllipse => timers.ellipse_ellipse_ms = ms,
                GroupKind::EllipseSphere => timers.ellipse_sphere_ms = ms,
                GroupKind::SphereEllipse => timers.sphere_ellipse_ms = ms,
                GroupKind::PointPoint { .. } => timers.point_point_ms = ms,
            }
        }

        let fault = self.fatal_status()?;
        if let Some(f) = fault {
            log::error!("device fault after step: {}", f.diagnostic());
        }
        Ok(StepOutcome { timers, fault })
    }

    /// Reads back the sticky error flag. Synchronizes the stream up to
    /// the copy.
    pub fn fatal_status(&self) -> Result<Option<DeviceFault>> {
        let state = self
            .state
            .as_ref()
            .context("fatal_status() on a cleared engine")?;
        let mut flag = vec![0i32; 1];
        self.ctx
            .stream()
            .memcpy_dtoh(&state.dev_error, &mut flag)
            .context("Failed to read error flag")?;
        Ok(DeviceFault::from_flag(flag[0]))
    }

    /// Reads back per-owner force (4-wide) and torque (4-wide) rows.
    pub fn read_forces_torques(&self) -> Result<Vec<P>> {
        let state = self
            .state
            .as_ref()
            .context("readback on a cleared engine")?;
        let n = state.nbor.inum().max(1) * 8;
        let mut out = vec![P::default(); state.capacity.max(1) * 8];
        self.ctx
            .stream()
            .memcpy_dtoh(&state.dev_ans, &mut out)
            .context("Failed to read force accumulator")?;
        out.truncate(n);
        Ok(out)
    }

    /// Reads back per-owner energy + 6 virial components.
    pub fn read_energy_virial(&self) -> Result<Vec<P>> {
        let state = self
            .state
            .as_ref()
            .context("readback on a cleared engine")?;
        let n = state.nbor.inum().max(1) * 7;
        let mut out = vec![P::default(); state.capacity.max(1) * 7];
        self.ctx
            .stream()
            .memcpy_dtoh(&state.dev_engv, &mut out)
            .context("Failed to read energy/virial accumulator")?;
        out.truncate(n);
        Ok(out)
    }

    /// Releases every device buffer and returns the tracked footprint to
    /// zero. Idempotent; checks the error flag one last time and logs the
    /// diagnostic if it was set.
    pub fn clear(&mut self) -> Result<()> {
        let Some(state) = self.state.take() else {
            return Ok(());
        };

        let mut flag = vec![0i32; 1];
        match self.ctx.stream().memcpy_dtoh(&state.dev_error, &mut flag) {
            Ok(()) => {
                if let Some(fault) = DeviceFault::from_flag(flag[0]) {
                    log::error!("{}", fault.diagnostic());
                }
            }
            Err(e) => log::warn!("error flag unreadable at clear: {e}"),
        }

        self.ledger.release(state.bytes);
        drop(state);
        log::info!(
            "Pair engine cleared, tracked device bytes: {}",
            self.ledger.total_bytes()
        );
        Ok(())
    }

    fn zero_accumulators(&mut self) -> Result<()> {
        let stream = self.ctx.stream().clone();
        let state = self.state.as_mut().expect("checked by caller");
        let zeros_ans = vec![P::default(); state.capacity.max(1) * 8];
        let zeros_engv = vec![P::default(); state.capacity.max(1) * 7];
        stream
            .memcpy_htod(&zeros_ans, &mut state.dev_ans)
            .context("Failed to zero force accumulator")?;
        stream
            .memcpy_htod(&zeros_engv, &mut state.dev_engv)
            .context("Failed to zero energy accumulator")?;
        Ok(())
    }

    fn launch_pack(&mut self, span: DeviceSpan, lo: aniso_core::FormCode, hi: aniso_core::FormCode) -> Result<()> {
        let stream = self.ctx.stream().clone();
        let block = self.config.block_size;
        let padded = self.layout.padded as i32;
        let state = self.state.as_mut().expect("checked by caller");
        let (dev_type, dev_form) = (&state.dev_type, &state.tables.form);
        // Split borrows: the packer mutates only its own buffers.
        let nbor = &mut state.nbor;
        nbor.launch_pack(
            &stream,
            &self.kernels.pack,
            dev_type,
            dev_form,
            padded,
            span,
            lo,
            hi,
            block,
        )
    }

    fn launch_pair(
        &mut self,
        kind: GroupKind,
        span: DeviceSpan,
        grid: u32,
        flags: EvalFlags,
    ) -> Result<()> {
        if span.end <= span.begin {
            return Ok(());
        }
        let stream = self.ctx.stream().clone();
        let state = self.state.as_mut().expect("checked by caller");
        let cfg = LaunchConfig {
            grid_dim: (grid, 1, 1),
            block_dim: (self.config.block_size, 1, 1),
            shared_mem_bytes: 0,
        };
        let ltypes = self.layout.padded as i32;
        let eflag = flags.energy as i32;
        let vflag = flags.virial as i32;
        let tpa = self.config.threads_per_atom as i32;

        match kind {
            GroupKind::EllipseEllipse | GroupKind::EllipseSphere | GroupKind::SphereEllipse => {
                let kernel = match kind {
                    GroupKind::EllipseEllipse => &self.kernels.ellipsoid,
                    GroupKind::EllipseSphere => &self.kernels.ellipsoid_sphere,
                    _ => &self.kernels.sphere_ellipsoid,
                };
                unsafe {
                    let mut builder = stream.launch_builder(kernel);
                    builder.arg(&state.dev_x);
                    builder.arg(&state.dev_quat);
                    builder.arg(&state.dev_type);
                    builder.arg(&state.tables.shape);
                    builder.arg(&state.tables.well);
                    builder.arg(&state.tables.special_lj);
                    builder.arg(&state.tables.sigma_epsilon);
                    builder.arg(&state.tables.cut_form);
                    builder.arg(&ltypes);
                    builder.arg(&state.nbor.dev_nbor);
                    builder.arg(&span);
                    builder.arg(&state.dev_ans);
                    builder.arg(&state.dev_engv);
                    builder.arg(&state.dev_error);
                    builder.arg(&eflag);
                    builder.arg(&vflag);
                    builder.arg(&tpa);
                    builder.launch(cfg).context("extended-body kernel launch failed")?;
                }
            }
            GroupKind::PointPoint { fast } => {
                let kernel = if fast {
                    &self.kernels.lj_fast
                } else {
                    &self.kernels.lj
                };
                unsafe {
                    let mut builder = stream.launch_builder(kernel);
                    builder.arg(&state.dev_x);
                    builder.arg(&state.dev_type);
                    builder.arg(&state.tables.lj1);
                    builder.arg(&state.tables.lj3);
                    builder.arg(&state.tables.special_lj);
                    builder.arg(&ltypes);
                    builder.arg(&state.nbor.dev_packed);
                    builder.arg(&span);
                    builder.arg(&state.dev_ans);
                    builder.arg(&state.dev_engv);
                    builder.arg(&state.dev_error);
                    builder.arg(&eflag);
                    builder.arg(&vflag);
                    builder.launch(cfg).context("point-point kernel launch failed")?;
                }
            }
        }
        Ok(())
    }
}

impl<P: Real> Drop for EllipsoidPairGpu<P> {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(e) = self.clear() {
                log::warn!("clear during drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_set_names() {
        let set = KernelSet::ellipsoid_pair();
        assert_eq!(set.module, PAIR_MODULE);
        assert_eq!(set.ellipsoid, "k_ellipsoid");
        assert_eq!(set.unpack, "kernel_unpack");
    }

    #[test]
    fn test_timers_default_zero() {
        let timers = GroupTimers::default();
        assert!(timers.extended_all_zero());
        assert_eq!(timers.point_point_ms, 0.0);
    }

    #[test]
    fn test_outcome_telemetry_carries_fault_code() {
        let outcome = StepOutcome {
            timers: GroupTimers::default(),
            fault: Some(DeviceFault::BadMatrixInversion),
        };
        let json = outcome.telemetry_json();
        assert_eq!(json["fault_code"], 2);

        let clean = StepOutcome {
            timers: GroupTimers::default(),
            fault: None,
        };
        assert_eq!(clean.telemetry_json()["fault_code"], 0);
    }

    #[test]
    fn test_bytes_per_atom_scales_with_neighbors() {
        let small = EllipsoidPairGpu::<f32>::bytes_per_atom(16);
        let large = EllipsoidPairGpu::<f32>::bytes_per_atom(256);
        assert!(large > small);
        // f64 state costs more per atom than f32.
        assert!(EllipsoidPairGpu::<f64>::bytes_per_atom(16) > small);
    }
}
