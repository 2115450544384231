use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{bounded, Receiver, Sender};
use io_backends::port_engine::{PortKind, ProcessScope};
use io_backends::{AudioEngine, BackendConfig, BackendKind, BackendRegistry, NO_DEVICE};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let registry = BackendRegistry::with_defaults();
    match cli.command {
        Commands::Backends => list_backends(&registry),
        Commands::Devices(args) => list_devices(&registry, &args),
        Commands::Run(args) => run_session(&registry, args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Audio backend tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the backends compiled into this build.
    Backends,
    /// List the devices, rates and period sizes a backend offers.
    Devices(DevicesArgs),
    /// Open a device and route every capture channel to the matching
    /// playback channel.
    Run(RunArgs),
}

#[derive(Args)]
struct DevicesArgs {
    /// Backend name, e.g. `alsa` or `null`.
    #[arg(long, default_value = "null")]
    backend: String,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value = "null")]
    backend: String,
    /// Backend configuration (JSON). Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Device used for both capture and playback.
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    rate: Option<u32>,
    /// Period size in frames.
    #[arg(long)]
    frames: Option<u32>,
    #[arg(long)]
    inputs: Option<u32>,
    #[arg(long)]
    outputs: Option<u32>,
    /// Session length in seconds.
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,
    /// Process without the device clock for the whole session.
    #[arg(long)]
    freewheel: bool,
    /// Open without systemic latency compensation.
    #[arg(long)]
    measure_latency: bool,
}

fn parse_kind(registry: &BackendRegistry, name: &str) -> Result<BackendKind> {
    let kind: BackendKind = name.parse()?;
    if registry.descriptor(kind).is_none() {
        anyhow::bail!("{kind} is not available on this platform");
    }
    Ok(kind)
}

fn list_backends(registry: &BackendRegistry) -> Result<()> {
    println!("Available audio backends:");
    for kind in registry.kinds() {
        let available = registry
            .descriptor(kind)
            .map_or(false, |descriptor| descriptor.available);
        let status = if available { "" } else { " (unavailable)" };
        println!("  - {kind}{status}");
    }
    Ok(())
}

fn list_devices(registry: &BackendRegistry, args: &DevicesArgs) -> Result<()> {
    let kind = parse_kind(registry, &args.backend)?;
    let backend = registry.instantiate(kind, "io-cli")?;
    let devices = backend.devices()?;
    if devices.is_empty() {
        println!("{kind} reports no devices.");
        return Ok(());
    }
    for device in devices {
        println!(
            "{} [{}] capture: {} playback: {}",
            device.name, device.driver_id, device.capture, device.playback
        );
        println!(
            "  rates: {:?}",
            backend.available_sample_rates(&device.name)
        );
        println!(
            "  period sizes: {:?}",
            backend.available_buffer_sizes(&device.name)
        );
    }
    println!("MIDI options: {}", backend.midi_options().join(", "));
    Ok(())
}

fn load_config(args: &RunArgs) -> Result<BackendConfig> {
    let mut config = match &args.config {
        Some(path) => BackendConfig::load(path)
            .with_context(|| format!("failed to read backend config {}", path.display()))?,
        None => BackendConfig::default(),
    };
    if let Some(device) = &args.device {
        config.set_device_name(device);
    }
    if let Some(rate) = args.rate {
        config.sample_rate = rate;
    }
    if let Some(frames) = args.frames {
        config.buffer_size = frames;
    }
    if let Some(inputs) = args.inputs {
        config.input_channels = inputs;
    }
    if let Some(outputs) = args.outputs {
        config.output_channels = outputs;
    }
    Ok(config)
}

/// Engine that logs session notifications and reports a halt.
struct MonitorEngine {
    halted: Sender<String>,
}

impl AudioEngine for MonitorEngine {
    fn process(&mut self, _scope: &mut ProcessScope<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn freewheel(&mut self, onoff: bool) {
        info!(freewheel = onoff, "freewheel changed");
    }

    fn xrun(&mut self) {
        warn!("xrun");
    }

    fn halted(&mut self, reason: &str) {
        let _ = self.halted.try_send(reason.to_string());
    }

    fn connection_changed(&mut self, a: &str, b: &str, connected: bool) {
        info!(a, b, connected, "connection changed");
    }
}

fn run_session(registry: &BackendRegistry, args: RunArgs) -> Result<()> {
    let kind = parse_kind(registry, &args.backend)?;
    let mut config = load_config(&args)?;
    let mut backend = registry.instantiate(kind, "io-cli")?;

    if !config.has_device() {
        let first = backend
            .devices()?
            .into_iter()
            .next()
            .map(|device| device.name)
            .unwrap_or_else(|| NO_DEVICE.to_string());
        config.set_device_name(&first);
    }
    backend.set_config(config)?;

    let (halted_tx, halted_rx) = bounded(1);
    backend.set_engine(Box::new(MonitorEngine { halted: halted_tx }))?;
    backend
        .start(args.measure_latency)
        .with_context(|| format!("failed to start {kind}"))?;

    let capture = backend.physical_inputs(PortKind::Audio);
    let playback = backend.physical_outputs(PortKind::Audio);
    for (src, dst) in capture.iter().zip(&playback) {
        backend.connect_by_name(src, dst)?;
    }
    println!(
        "Running {kind} at {} Hz, {} frames per period, {} -> {} channels",
        backend.sample_rate(),
        backend.buffer_size(),
        capture.len(),
        playback.len()
    );

    if args.freewheel {
        backend.freewheel(true)?;
        if backend.wait_freewheel_ack(Duration::from_secs(1)).is_none() {
            warn!("freewheel was not acknowledged");
        }
    }

    let halt = wait_session(&halted_rx, Duration::from_secs_f64(args.seconds.max(0.0)));
    let frames = backend.sample_time();
    let xruns = backend.xrun_count();
    let load = backend.dsp_load();
    backend.stop()?;

    println!("Processed {frames} frames, {xruns} xruns, DSP load {load:.1}%");
    match halt {
        Some(reason) => anyhow::bail!("backend halted: {reason}"),
        None => Ok(()),
    }
}

/// Blocks for the session length or until the backend halts.
fn wait_session(halted: &Receiver<String>, length: Duration) -> Option<String> {
    halted.recv_timeout(length).ok()
}
