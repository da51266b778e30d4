//! wattlog - measure the energy use and emissions of a command
//!
//! Samples GPU power draw while a child command runs, then reports the
//! session's energy in kWh and the matching emissions.

use std::path::PathBuf;
use std::process::{Command, ExitCode, ExitStatus};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wattlog_core::{
    DerivedMetrics, EnergySession, FakePowerProvider, PolicyKind, PowerProvider, ProviderError,
    SamplerConfig, TracingSink,
};
use wattlog_nvidia::{NvidiaPowerProvider, NvidiaSmi, DEFAULT_NVIDIA_SMI};

#[derive(Parser)]
#[command(name = "wattlog")]
#[command(about = "Measure the energy use and emissions of a command")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command while sampling device power
    Run(RunArgs),

    /// Detect and list NVIDIA devices
    Devices {
        /// Path to nvidia-smi
        #[arg(long, default_value = DEFAULT_NVIDIA_SMI)]
        nvidia_smi: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Sampling interval in milliseconds
    #[arg(long, env = "WATTLOG_INTERVAL_MS")]
    interval_ms: Option<u64>,

    /// Conversion policy (summed or integrated)
    #[arg(long)]
    policy: Option<PolicyKind>,

    /// Path to a JSON sampler config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Sample N simulated devices instead of NVIDIA hardware
    #[arg(long)]
    fake_devices: Option<usize>,

    /// Power draw of each simulated device, in milliwatts
    #[arg(long, default_value_t = 250_000.0, requires = "fake_devices")]
    fake_power_mw: f64,

    /// Path to nvidia-smi
    #[arg(long, default_value = DEFAULT_NVIDIA_SMI)]
    nvidia_smi: String,

    /// Command to run, after `--`
    #[arg(required = true, last = true)]
    command: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    command: &'a [String],
    exit_code: Option<i32>,
    provider: &'static str,
    policy: &'static str,
    interval_ms: f64,
    start_time: Option<String>,
    duration_secs: f64,
    devices: usize,
    device_ids: Vec<String>,
    samples: usize,
    metrics: &'a DerivedMetrics,
}

fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr so stdout carries only the report.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("wattlog=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => Ok(ExitCode::from(run(&args)?)),
        Commands::Devices { nvidia_smi, json } => {
            devices(&nvidia_smi, json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(args: &RunArgs) -> anyhow::Result<SamplerConfig> {
    let mut config = match &args.config {
        Some(path) => SamplerConfig::from_file(path)?,
        None => SamplerConfig::default(),
    };

    if let Some(interval_ms) = args.interval_ms {
        config.interval = Duration::from_millis(interval_ms);
    }
    if let Some(policy) = args.policy {
        config.policy = policy;
    }

    config.validate()?;
    Ok(config)
}

fn build_provider(args: &RunArgs) -> anyhow::Result<Arc<dyn PowerProvider>> {
    if let Some(count) = args.fake_devices {
        info!(devices = count, power_mw = args.fake_power_mw, "using simulated devices");
        return Ok(Arc::new(FakePowerProvider::uniform(count, args.fake_power_mw)));
    }

    let smi = NvidiaSmi::acquire_with_path(args.nvidia_smi.as_str())
        .context("no NVIDIA devices available; pass --fake-devices for a dry run")?;
    if smi.device_count() == 0 {
        warn!("nvidia-smi reported no devices; metrics will be zero");
    }
    Ok(Arc::new(NvidiaPowerProvider::new(smi)))
}

fn spawn_and_wait(command: &[String]) -> anyhow::Result<ExitStatus> {
    let Some((program, rest)) = command.split_first() else {
        bail!("no command given");
    };

    Command::new(program)
        .args(rest)
        .status()
        .with_context(|| format!("failed to run '{program}'"))
}

fn exit_code(status: ExitStatus) -> u8 {
    status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}

fn run(args: &RunArgs) -> anyhow::Result<u8> {
    let config = load_config(args)?;
    let provider = build_provider(args)?;
    let provider_name = provider.name();
    let device_count = provider.device_count();

    info!(
        provider = provider_name,
        devices = device_count,
        interval = ?config.interval(),
        policy = %config.policy,
        command = ?args.command,
        "starting energy session"
    );

    let interval_ms = config.interval().as_secs_f64() * 1000.0;
    let session = EnergySession::new(provider, config)?;
    let status = session.run(|| spawn_and_wait(&args.command))??;
    let metrics = session.finish(&TracingSink)?;
    let samples = session.samples();

    let report = Report {
        command: &args.command,
        exit_code: status.code(),
        provider: provider_name,
        policy: session.policy().name(),
        interval_ms,
        start_time: session.window().map(|w| w.start_time().to_rfc3339()),
        duration_secs: session.duration().unwrap_or_default().as_secs_f64(),
        devices: device_count,
        device_ids: samples.device_ids().map(str::to_string).collect(),
        samples: samples.total_samples(),
        metrics: &metrics,
    };
    print_report(&report, args.json)?;

    Ok(exit_code(status))
}

fn print_report(report: &Report<'_>, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Command: {}", report.command.join(" "));
    println!(
        "Session: {:.3}s, {} sample(s) from {} device(s) via {}",
        report.duration_secs, report.samples, report.devices, report.provider
    );
    if !report.device_ids.is_empty() {
        println!("Devices: {}", report.device_ids.join(", "));
    }
    println!("Policy: {} ({} ms interval)", report.policy, report.interval_ms);
    println!();

    for (name, value) in report.metrics.iter() {
        println!("  {name:<24} {value:.9}");
    }

    Ok(())
}

fn devices(nvidia_smi: &str, json: bool) -> anyhow::Result<()> {
    let smi = match NvidiaSmi::acquire_with_path(nvidia_smi) {
        Ok(smi) => smi,
        Err(ProviderError::Unavailable(reason)) => {
            println!("No GPUs detected");
            println!("{reason} - ensure NVIDIA drivers are installed");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(smi.devices())?);
        return Ok(());
    }

    if smi.device_count() == 0 {
        println!("No GPUs detected");
        return Ok(());
    }

    println!("Detected {} GPU(s):", smi.device_count());
    println!();

    for device in smi.devices() {
        println!("  GPU {}: {}", device.index, device.name);
        println!("    UUID: {}", device.uuid);
        println!("    Memory: {} MiB", device.memory_total_mib);
        println!("    Metric: {}", wattlog_nvidia::device_id(device.index));
        println!();
    }

    Ok(())
}
