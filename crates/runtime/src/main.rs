#![deny(clippy::all, clippy::pedantic)]

//! # Runtime
//!
//! Headless driver for the toggle-switch simulation. The compute backend is
//! chosen at build time: the OpenCL device with the `opencl` feature, the
//! host backend otherwise.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use compute::{ComputeBackend, ComputeContext, ContextConfig, DeviceCategory};
use gillespie::kernels::GILLESPIE_SWITCH;
use gillespie::{SimConfig, SwitchSimulation, ToggleSwitchParams};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "runtime_main", about = "Stochastic toggle-switch simulation")]
struct Args {
    /// Device category: GPU, CPU, any, or a platform vendor name.
    /// Defaults to `COMPUTE_DEVICE`, then any.
    #[arg(long)]
    device: Option<String>,

    /// Directory searched for `<kernel>.cl` before the defaults. Repeatable.
    #[arg(long = "kernel-dir")]
    kernel_dirs: Vec<PathBuf>,

    /// Independent systems, one work item each.
    #[arg(long, default_value_t = 128_000)]
    systems: usize,

    #[arg(long, default_value_t = 64)]
    local_size: usize,

    #[arg(long, default_value_t = 10_000)]
    steps: u64,

    /// Steps between switch-time measurements; 0 disables them.
    #[arg(long, default_value_t = 5000)]
    check_interval: u64,

    /// Append measurements to this file.
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn context_config(&self) -> ContextConfig {
        let mut config = ContextConfig::from_env();
        if let Some(device) = &self.device {
            config = config.with_device(DeviceCategory::parse(device));
        }
        // Prepending in reverse keeps the command-line order.
        for dir in self.kernel_dirs.iter().rev() {
            config = config.with_kernel_dir(dir);
        }
        config
    }

    fn sim_config(&self) -> SimConfig {
        SimConfig {
            systems: self.systems,
            local_size: self.local_size,
            check_interval: self.check_interval,
            seed: self.seed,
            output: self.output.clone(),
            params: ToggleSwitchParams::default(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    launch(args.context_config(), args.sim_config(), args.steps)
}

#[cfg(feature = "opencl")]
fn launch(config: ContextConfig, sim: SimConfig, steps: u64) -> Result<()> {
    use compute::{OpenClBackend, OpenClOptions};
    let ctx = ComputeContext::<OpenClBackend>::open(config, OpenClOptions)
        .context("opening OpenCL device")?;
    simulate(ctx, sim, steps)
}

#[cfg(all(feature = "cpu", not(feature = "opencl")))]
fn launch(config: ContextConfig, sim: SimConfig, steps: u64) -> Result<()> {
    use compute::CpuBackend;
    let ctx = ComputeContext::<CpuBackend>::open(config, gillespie::host_library())
        .context("opening host device")?;
    simulate(ctx, sim, steps)
}

#[cfg(not(any(feature = "cpu", feature = "opencl")))]
compile_error!("enable the `cpu` or `opencl` feature");

fn simulate<B: ComputeBackend>(ctx: ComputeContext<B>, config: SimConfig, steps: u64) -> Result<()> {
    let device = ctx.device();
    info!(
        platform = %device.platform,
        device = %device.name,
        compute_units = device.compute_units,
        "using device"
    );

    let mut sim = SwitchSimulation::initialize(ctx, config).context("initialising simulation")?;
    let used = sim.context().device_memory_used(GILLESPIE_SWITCH)?;
    info!(bytes = used, "simulation kernel memory");

    info!(steps, "starting simulation");
    sim.run(steps)?;
    info!(
        steps = sim.steps(),
        batches = sim.batches(),
        measurements = sim.measurements(),
        "simulation finished"
    );
    sim.close()?;
    Ok(())
}
