//! fieldlog - field station collector.
//!
//! Run with: `cargo run -p fieldlog-service`

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fieldlog_core::{PointBuilder, SensorKind, SensorSource, SimulatedSensor, SystemClock, WindSensor};
use fieldlog_service::{Config, FlushCoordinator, InfluxSink, SampleScheduler, SensorConfig};
use fieldlog_store::BufferStore;

mod service;

/// fieldlog - sample sensors and forward them to InfluxDB, buffering offline.
#[derive(Parser, Debug)]
#[command(name = "fieldlog")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Buffer file path (overrides config).
    #[arg(short, long, global = true)]
    buffer: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the collector in the foreground (default behavior).
    Run,

    /// Inspect the local buffer.
    Buffer {
        #[command(subcommand)]
        action: BufferAction,
    },

    /// Manage the background service.
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand, Debug)]
enum BufferAction {
    /// Show pending and rejected record counts.
    Status,
}

#[derive(Subcommand, Debug)]
enum ServiceAction {
    /// Install fieldlog as a system service.
    Install {
        /// Install as user-level service (no root required).
        #[arg(long)]
        user: bool,
    },

    /// Uninstall the fieldlog service.
    Uninstall {
        /// Uninstall user-level service.
        #[arg(long)]
        user: bool,
    },

    /// Start the fieldlog service.
    Start {
        /// Start user-level service.
        #[arg(long)]
        user: bool,
    },

    /// Stop the fieldlog service.
    Stop {
        /// Stop user-level service.
        #[arg(long)]
        user: bool,
    },

    /// Check the status of the fieldlog service.
    Status {
        /// Check user-level service status.
        #[arg(long)]
        user: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let Args {
        command,
        config,
        buffer,
    } = Args::parse();

    match command {
        Some(Command::Service { action }) => handle_service_action(action, config.as_deref()),
        Some(Command::Buffer {
            action: BufferAction::Status,
        }) => buffer_status(config.as_deref(), buffer),
        Some(Command::Run) | None => run_collector(config.as_deref(), buffer).await,
    }
}

fn handle_service_action(action: ServiceAction, config: Option<&Path>) -> anyhow::Result<()> {
    use service::{Level, ServiceStatus};

    let (action_name, done, result) = match action {
        ServiceAction::Install { user } => {
            // The service runs from another working directory.
            let config = config.map(std::path::absolute).transpose()?;
            (
                "install",
                "installed",
                service::install(Level::from_user_flag(user), config.as_deref()),
            )
        }
        ServiceAction::Uninstall { user } => (
            "uninstall",
            "uninstalled",
            service::uninstall(Level::from_user_flag(user)),
        ),
        ServiceAction::Start { user } => (
            "start",
            "started",
            service::start(Level::from_user_flag(user)),
        ),
        ServiceAction::Stop { user } => (
            "stop",
            "stopped",
            service::stop(Level::from_user_flag(user)),
        ),
        ServiceAction::Status { user } => {
            match service::status(Level::from_user_flag(user)) {
                Ok(ServiceStatus::Running) => println!("fieldlog is running"),
                Ok(ServiceStatus::Stopped(Some(reason))) => {
                    println!("fieldlog is stopped ({})", reason)
                }
                Ok(ServiceStatus::Stopped(None)) => println!("fieldlog is stopped"),
                Ok(ServiceStatus::NotInstalled) => println!("fieldlog is not installed"),
                Err(e) => {
                    eprintln!("Failed to get status: {}", e);
                    return Err(e.into());
                }
            }
            return Ok(());
        }
    };

    match result {
        Ok(()) => {
            println!("Successfully {} fieldlog", done);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to {} service: {}", action_name, e);
            Err(e.into())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env();
    Ok(config)
}

fn buffer_status(config: Option<&Path>, buffer: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let path = buffer.unwrap_or(config.buffer.path);

    let stats = BufferStore::inspect(&path)
        .with_context(|| format!("failed to inspect buffer {}", path.display()))?;

    println!("Buffer:           {}", path.display());
    println!("Pending records:  {}", stats.pending);
    println!("Oldest:           {}", format_time(stats.oldest));
    println!("Newest:           {}", format_time(stats.newest));
    println!("Unreadable lines: {}", stats.unreadable);
    println!("Rejected lines:   {}", stats.quarantined);
    Ok(())
}

fn format_time(at: Option<OffsetDateTime>) -> String {
    match at {
        Some(at) => at.format(&Rfc3339).unwrap_or_else(|_| at.to_string()),
        None => "-".to_string(),
    }
}

fn open_sensor(config: &SensorConfig) -> anyhow::Result<Box<dyn SensorSource>> {
    match config.kind {
        SensorKind::Wind => {
            let device = config
                .device
                .as_deref()
                .with_context(|| format!("sensor {} has no device", config.id))?;
            let sensor = WindSensor::open(
                config.id.as_str(),
                device,
                config.unit_id,
                config.baud_rate,
                config.read_timeout(),
            )
            .with_context(|| format!("failed to open {} for sensor {}", device.display(), config.id))?;
            info!(
                "Opened wind sensor {} on {} at {} baud (unit {})",
                config.id,
                device.display(),
                config.baud_rate,
                config.unit_id
            );
            Ok(Box::new(sensor))
        }
        SensorKind::Simulated => Ok(Box::new(SimulatedSensor::new(config.id.as_str()))),
        other => anyhow::bail!("sensor kind {} is not supported by this build", other),
    }
}

fn point_builder(config: &Config) -> PointBuilder {
    let mut builder = PointBuilder::new();
    for (key, value) in &config.station.tags {
        builder = builder.with_tag(key, value);
    }
    for sensor in &config.sensors {
        if let Some(measurement) = &sensor.measurement {
            builder = builder.with_measurement(sensor.id.as_str(), measurement.as_str());
        }
    }
    builder
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_collector(config: Option<&Path>, buffer: Option<PathBuf>) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fieldlog_service=info".parse()?)
                .add_directive("fieldlog_core=info".parse()?)
                .add_directive("fieldlog_store=info".parse()?),
        )
        .init();

    let mut config = load_config(config)?;
    if let Some(path) = buffer {
        config.buffer.path = path;
    }
    config.validate()?;

    let sink = InfluxSink::new(&config.sink)?;
    info!("Writing to {}", sink.write_url());

    info!("Opening buffer at {:?}", config.buffer.path);
    let buffer = BufferStore::open(&config.buffer.path)?;

    let mut scheduler = SampleScheduler::new(
        FlushCoordinator::new(sink, buffer),
        point_builder(&config),
        SystemClock,
    )
    .with_tick(config.scheduler.tick());

    for sensor in &config.sensors {
        scheduler.add_sensor(open_sensor(sensor)?, sensor.interval());
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        token.cancel();
    });

    scheduler.run(cancel).await?;
    Ok(())
}
