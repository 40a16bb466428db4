//! Pacewire - BLE fitness telemetry acquisition
//!
//! Main entry point: connects the configured sensors and prints fused samples
//! as JSON lines until Ctrl-C.

use anyhow::Context;
use clap::Parser;
use pacewire::recording::{JsonLinesSink, NullPersistence, SamplePersistence};
use pacewire::sensors::simulated::{
    demo_transport, spawn_synthetic_feed, DEMO_FOOTPOD, DEMO_HEART_RATE, DEMO_POWER,
    DEMO_SPEED_CADENCE,
};
use pacewire::sensors::{
    stop_pair, BleTransport, BtleTransport, SensorEvent, SensorManager, SensorRole, Sport,
};
use pacewire::storage::config::{load_config, load_config_from, AppConfig, DeviceSelector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pacewire", version, about = "BLE fitness telemetry acquisition")]
struct Cli {
    /// Configuration file (defaults to config.toml in the data directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use simulated sensors instead of the Bluetooth adapter
    #[arg(long)]
    simulate: bool,

    /// Override the configured sport
    #[arg(long, value_enum)]
    sport: Option<SportArg>,

    /// Start recording as soon as acquisition is running
    #[arg(long)]
    record: bool,

    /// Log filter, e.g. `debug` or `pacewire=trace`
    #[arg(long)]
    log_level: Option<String>,

    /// JSON-lines file for recorded activities
    #[arg(long)]
    output: Option<PathBuf>,

    /// ERG target power in watts for a connected trainer
    #[arg(long)]
    target_power: Option<u16>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum SportArg {
    Running,
    Cycling,
}

impl From<SportArg> for Sport {
    fn from(arg: SportArg) -> Self {
        match arg {
            SportArg::Running => Sport::Running,
            SportArg::Cycling => Sport::Cycling,
        }
    }
}

/// Point every unset demo role at its simulated device.
fn apply_simulation(config: &mut AppConfig) {
    let mut demo = vec![(SensorRole::HeartRate, DEMO_HEART_RATE)];
    match config.sensors.sport {
        Sport::Running => demo.push((SensorRole::SpeedCadence, DEMO_FOOTPOD)),
        Sport::Cycling => {
            demo.push((SensorRole::SpeedCadence, DEMO_SPEED_CADENCE));
            demo.push((SensorRole::Power, DEMO_POWER));
        }
    }
    for (role, name) in demo {
        let selector = config.sensors.selector_mut(role);
        if !selector.is_set() {
            *selector = DeviceSelector::named(name);
        }
    }
}

fn print_events(events: crossbeam::channel::Receiver<SensorEvent>) {
    for event in events.iter() {
        match event {
            SensorEvent::Sample(sample) => match serde_json::to_string(&sample) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize sample: {}", e),
            },
            SensorEvent::Link(status) => {
                tracing::info!(
                    "{} {}: {}",
                    status.role,
                    status.channel,
                    if status.connected { "connected" } else { "disconnected" }
                );
            }
            SensorEvent::State { role, state } => tracing::debug!("{}: {:?}", role, state),
            SensorEvent::Info(message) => tracing::info!("{}", message),
            SensorEvent::Error { role: Some(role), message } => {
                tracing::warn!("{}: {}", role, message)
            }
            SensorEvent::Error { role: None, message } => tracing::warn!("{}", message),
            SensorEvent::Recording(true) => tracing::info!("Recording started"),
            SensorEvent::Recording(false) => tracing::info!("Recording stopped"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Pacewire v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => load_config_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => load_config().context("failed to load configuration")?,
    };
    if let Some(sport) = cli.sport {
        config.sensors.sport = sport.into();
    }
    if cli.output.is_some() {
        config.recording.output = cli.output.clone();
    }
    if cli.simulate {
        apply_simulation(&mut config);
    }

    let acquisition = config.acquisition()?;
    if acquisition.configured_roles().is_empty() {
        anyhow::bail!("no sensors configured; set a name or address under [sensors] or use --simulate");
    }

    let simulated = cli.simulate.then(|| demo_transport(config.sensors.sport));
    let transport: Arc<dyn BleTransport> = match &simulated {
        Some(sim) => Arc::new(sim.clone()),
        None => Arc::new(BtleTransport::new()),
    };

    let persistence: Box<dyn SamplePersistence> = if cli.simulate && cli.output.is_none() {
        Box::new(NullPersistence)
    } else {
        let path = config.output_path();
        tracing::info!("Recording to {}", path.display());
        Box::new(JsonLinesSink::create(&path)?)
    };

    let mut manager = SensorManager::new(acquisition, transport);
    let events = manager.event_receiver();
    let printer = std::thread::Builder::new()
        .name("pacewire-events".to_string())
        .spawn(move || print_events(events))?;

    manager.start(persistence)?;
    if cli.record {
        manager.start_recording()?;
    }
    if let Some(watts) = cli.target_power {
        manager.set_target_power(watts)?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let (feed_stop, feed_signal) = stop_pair();
        let feed = simulated.map(|sim| {
            tokio::spawn(spawn_synthetic_feed(sim, Duration::from_secs(1), feed_signal))
        });

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
        tracing::info!("Interrupted");

        feed_stop.stop();
        if let Some(feed) = feed {
            let _ = feed.await;
        }
    });

    manager.shutdown();
    drop(manager);
    if printer.join().is_err() {
        tracing::error!("Event printer panicked");
    }
    Ok(())
}
