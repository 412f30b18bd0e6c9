use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rover_link_runtime::config::VehicleConfig;
use rover_link_runtime::runtime::{self, Mode};

/// Flight-controller actuation runtime for the rover base
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// JSON vehicle configuration (defaults are used for anything missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port of the flight controller
    #[arg(long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Camera device index
    #[arg(long)]
    camera: Option<u32>,

    /// Do not open the camera
    #[arg(long)]
    no_camera: bool,

    /// Do not publish telemetry over zenoh
    #[arg(long)]
    no_telemetry: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Execute the configured maneuver script once (default)
    Run,
    /// Execute motion intents published on rover/cmd/intent
    Listen,
}

fn load_config(cli: &Cli) -> Result<VehicleConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            VehicleConfig::load(path)?
        }
        None => VehicleConfig::default(),
    };

    if let Some(port) = &cli.port {
        config.link.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.link.baud = baud;
    }
    if let Some(index) = cli.camera {
        config.camera.device_index = index;
    }
    if cli.no_camera {
        config.camera.enabled = false;
    }
    if cli.no_telemetry {
        config.telemetry.enabled = false;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cli = Cli::parse();
    let mode = match cli.command.unwrap_or(Command::Run) {
        Command::Run => Mode::Scripted,
        Command::Listen => Mode::Listen,
    };

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime::run(config, mode).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
