use std::path::PathBuf;

use compute::{
    check_work_size, AccessMode, ComputeBackend, ComputeContext, ComputeError, Fill,
};
use tracing::{debug, info};

use crate::kernels::{
    FILL_FLOAT_BUFFER, FILL_FLOAT_BUFFER_SOURCE, GILLESPIE_SWITCH, GILLESPIE_SWITCH_SOURCE,
    RNG_UNIFORM, RNG_UNIFORM_SOURCE, UNIFORMS_PER_SYSTEM,
};
use crate::model::{ToggleSwitchParams, PARAM_COUNT};
use crate::sink::MeasurementSink;
use crate::{Result, SimError};

/// Steps between progress log lines.
pub const PROGRESS_INTERVAL: u64 = 1000;

// Pool slots of `gillespie_switch`, per kind, in parameter order.
const P1: usize = 0;
const P2: usize = 1;
const DOMINANT: usize = 2;
const TIME: usize = 0;
const PARAMS: usize = 1;
const RAND: usize = 2;
const SWITCH_TIME: usize = 3;

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Independent systems, one work item each.
    pub systems: usize,
    pub local_size: usize,
    /// Steps between switch-time measurements.
    pub check_interval: u64,
    /// Seed for the host generator that draws kernel seeds; `None` seeds
    /// from entropy.
    pub seed: Option<u64>,
    /// Measurement file; `None` discards measurements.
    pub output: Option<PathBuf>,
    pub params: ToggleSwitchParams,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            systems: 128_000,
            local_size: 64,
            check_interval: 5000,
            seed: None,
            output: None,
            params: ToggleSwitchParams::default(),
        }
    }
}

/// Many independent toggle switches advanced one reaction per step on the
/// compute device.
pub struct SwitchSimulation<B: ComputeBackend> {
    ctx: ComputeContext<B>,
    config: SimConfig,
    rng: fastrand::Rng,
    sink: Option<MeasurementSink>,
    steps: u64,
    batches: u64,
    measurements: u64,
}

impl<B: ComputeBackend> SwitchSimulation<B> {
    /// Registers the kernels, fills the per-system buffers and binds
    /// everything.
    ///
    /// The random-number buffer is shared with the simulation kernel and the
    /// switch-time buffer with the reset kernel, so neither is copied between
    /// steps.
    ///
    /// # Errors
    ///
    /// `Config` for an empty or oversized system count, engine errors from
    /// registration, allocation or binding, and `Sink` when the output file
    /// cannot be opened.
    pub fn initialize(mut ctx: ComputeContext<B>, config: SimConfig) -> Result<Self> {
        let systems = i32::try_from(config.systems)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| SimError::Config(format!("system count {} out of range", config.systems)))?;
        check_work_size(
            config.systems,
            config.local_size,
            ctx.device().max_work_group_size,
        )?;

        load_kernel(&mut ctx, RNG_UNIFORM, RNG_UNIFORM_SOURCE)?;
        load_kernel(&mut ctx, GILLESPIE_SWITCH, GILLESPIE_SWITCH_SOURCE)?;
        load_kernel(&mut ctx, FILL_FLOAT_BUFFER, FILL_FLOAT_BUFFER_SOURCE)?;

        let n = config.systems;
        let params = config.params;

        ctx.create_float_buffer(
            RNG_UNIFORM,
            0,
            n * UNIFORMS_PER_SYSTEM,
            AccessMode::ReadWrite,
            Fill::Zeroed,
        )?;
        ctx.create_int_arg(RNG_UNIFORM, 0, 0)?;
        ctx.create_int_arg(RNG_UNIFORM, 1, 0)?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let per_item = UNIFORMS_PER_SYSTEM as i32;
        ctx.create_int_arg(RNG_UNIFORM, 2, per_item)?;

        let rw = AccessMode::ReadWrite;
        ctx.create_int_buffer(GILLESPIE_SWITCH, P1, n, rw, Fill::Broadcast(params.p1_initial))?;
        ctx.create_int_buffer(GILLESPIE_SWITCH, P2, n, rw, Fill::Broadcast(params.p2_initial))?;
        ctx.create_int_buffer(
            GILLESPIE_SWITCH,
            DOMINANT,
            n,
            rw,
            Fill::Broadcast(params.initial_dominant()),
        )?;
        ctx.create_float_buffer(GILLESPIE_SWITCH, TIME, n, rw, Fill::Zeroed)?;
        ctx.create_float_buffer(
            GILLESPIE_SWITCH,
            PARAMS,
            n * PARAM_COUNT,
            AccessMode::ReadOnly,
            Fill::Tiled(&params.to_vector()),
        )?;
        ctx.alias_float_buffer(RNG_UNIFORM, 0, GILLESPIE_SWITCH, RAND)?;
        ctx.create_float_buffer(GILLESPIE_SWITCH, SWITCH_TIME, n, rw, Fill::Zeroed)?;
        ctx.create_int_arg(GILLESPIE_SWITCH, 0, systems)?;

        ctx.alias_float_buffer(GILLESPIE_SWITCH, SWITCH_TIME, FILL_FLOAT_BUFFER, 0)?;
        ctx.create_float_arg(FILL_FLOAT_BUFFER, 0, 0.0)?;

        for kernel in [GILLESPIE_SWITCH, RNG_UNIFORM, FILL_FLOAT_BUFFER] {
            ctx.bind(kernel)?;
        }

        let used = ctx.device_memory_used(GILLESPIE_SWITCH)?;
        #[allow(clippy::cast_precision_loss)]
        let used_mb = used as f64 / (1024.0 * 1024.0);
        info!(systems = n, bytes = used, "device memory used: {used_mb:.2} MB");

        let sink = config
            .output
            .as_ref()
            .map(|path| {
                MeasurementSink::open(path).map_err(|source| SimError::Sink {
                    path: path.clone(),
                    source,
                })
            })
            .transpose()?;
        let rng = config.seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);

        Ok(Self {
            ctx,
            config,
            rng,
            sink,
            steps: 0,
            batches: 0,
            measurements: 0,
        })
    }

    /// Advances every system by one reaction. Every `check_interval` steps
    /// the switch times are measured and cleared.
    ///
    /// # Errors
    ///
    /// Engine errors from dispatch or readback, `Sink` on a failed write.
    pub fn step(&mut self) -> Result<()> {
        self.steps += 1;
        self.reseed()?;

        let (global, local) = (self.config.systems, self.config.local_size);
        self.ctx.dispatch(RNG_UNIFORM, global, local)?;
        self.ctx.dispatch(GILLESPIE_SWITCH, global, local)?;

        if self.steps % PROGRESS_INTERVAL == 0 {
            info!(step = self.steps, "progress");
        }
        if self.config.check_interval > 0 && self.steps % self.config.check_interval == 0 {
            self.measure()?;
            self.reset_switch_times()?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// The first failing step.
    pub fn run(&mut self, steps: u64) -> Result<()> {
        for _ in 0..steps {
            self.step()?;
        }
        self.ctx.finish()?;
        debug!(steps = self.steps, batches = self.batches, "run complete");
        Ok(())
    }

    fn reseed(&mut self) -> Result<()> {
        let seed_a = self.rng.i32(0..i32::MAX);
        let seed_b = self.rng.i32(0..i32::MAX);
        self.ctx.create_int_arg(RNG_UNIFORM, 0, seed_a)?;
        self.ctx.create_int_arg(RNG_UNIFORM, 1, seed_b)?;
        // The output buffer is device-resident; only the seeds change.
        self.ctx.rebind_scalars(RNG_UNIFORM)?;
        Ok(())
    }

    /// Reads the switch times recorded since the last reset and appends the
    /// non-zero ones to the sink as one batch.
    ///
    /// # Errors
    ///
    /// Readback failures, `Sink` on a failed write.
    pub fn measure(&mut self) -> Result<Vec<f32>> {
        let times = self
            .ctx
            .read_float_buffer(GILLESPIE_SWITCH, SWITCH_TIME, self.config.systems)?;
        let switched: Vec<f32> = times.into_iter().filter(|&t| t > 0.0).collect();
        if let Some(sink) = self.sink.as_mut() {
            sink.append_batch(&switched).map_err(|source| SimError::Sink {
                path: sink.path().to_path_buf(),
                source,
            })?;
        }
        self.batches += 1;
        self.measurements += switched.len() as u64;
        debug!(step = self.steps, switched = switched.len(), "measured switch times");
        Ok(switched)
    }

    /// Zeroes the switch-time buffer on the device.
    ///
    /// # Errors
    ///
    /// Dispatch failures.
    pub fn reset_switch_times(&mut self) -> Result<()> {
        self.ctx
            .dispatch(FILL_FLOAT_BUFFER, self.config.systems, self.config.local_size)?;
        Ok(())
    }

    /// Mean p1 copy number over the first `count` systems.
    ///
    /// # Errors
    ///
    /// Readback failures.
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_p1(&self, count: usize) -> Result<f64> {
        let count = count.clamp(1, self.config.systems);
        let p1 = self.ctx.read_int_buffer(GILLESPIE_SWITCH, P1, count)?;
        let sum: i64 = p1.iter().map(|&v| i64::from(v)).sum();
        Ok(sum as f64 / count as f64)
    }

    /// Reaction rates for the configured parameters.
    #[must_use]
    pub fn propensities(&self, p1: i32, p2: i32) -> [f32; 4] {
        self.config.params.propensities(p1, p2)
    }

    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// Switch times recorded across all batches.
    #[must_use]
    pub fn measurements(&self) -> u64 {
        self.measurements
    }

    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    #[must_use]
    pub fn context(&self) -> &ComputeContext<B> {
        &self.ctx
    }

    /// Drains the device queue and releases the context.
    ///
    /// # Errors
    ///
    /// A failure of any queued command.
    pub fn close(self) -> Result<()> {
        self.ctx.close()?;
        Ok(())
    }
}

/// Registers `name` from the kernel search path, falling back to the bundled
/// source when no file is found.
fn load_kernel<B: ComputeBackend>(
    ctx: &mut ComputeContext<B>,
    name: &str,
    bundled: &str,
) -> Result<(), ComputeError> {
    let outcome = ctx.register_kernel(name, None).map(|_| ());
    match outcome {
        Err(ComputeError::KernelSourceNotFound { .. }) => {
            debug!(kernel = name, "not on the kernel path; using bundled source");
            ctx.register_kernel_source(name, bundled).map(|_| ())
        }
        other => other,
    }
}
