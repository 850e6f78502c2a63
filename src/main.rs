//! CLI entry point for the telemetry gateway.
//!
//! Receives measurement datagrams over UDP, averages them per channel and forwards
//! one summary line per window over a USB serial link (or the console).
//!
//! # Usage
//!
//! Run with the default configuration file:
//! ```bash
//! telemetry-gateway
//! ```
//!
//! Run without hardware, printing messages to stdout:
//! ```bash
//! telemetry-gateway --config config/gateway.toml --console --log-level debug
//! ```
//!
//! Find the vendor/product ids of attached adapters:
//! ```bash
//! telemetry-gateway list-ports
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use telemetry_gateway::config::{GatewayConfig, TransportKind, DEFAULT_CONFIG_PATH};
use telemetry_gateway::data::storage::open_sink;
use telemetry_gateway::gateway::Gateway;
use telemetry_gateway::logging::{self, parse_log_level, TracingConfig};
use telemetry_gateway::network::UdpReceiver;
use telemetry_gateway::transport::{self, PortEnumerator, SystemPorts};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "telemetry-gateway")]
#[command(about = "UDP-to-serial telemetry gateway", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the console transport instead of the serial device
    #[arg(long)]
    console: bool,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default)
    Run,

    /// List serial ports with their USB vendor/product ids
    ListPorts,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::ListPorts) => list_ports(),
        Some(Commands::Run) | None => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start the async runtime")?;
            let result = runtime.block_on(run(&cli));
            // A pending console read holds a blocking stdin thread.
            runtime.shutdown_timeout(Duration::from_secs(1));
            result
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let mut config = GatewayConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if cli.console {
        config.transport.kind = TransportKind::Console;
    }
    if let Some(level) = &cli.log_level {
        parse_log_level(level)?;
        config.application.log_level = level.clone();
    }

    logging::init_from_config(&config).context("Failed to initialize logging")?;
    info!(
        name = %config.application.name,
        config = %cli.config.display(),
        "Gateway starting"
    );

    let transport = transport::build(&config).context("Failed to create transport")?;
    let sink = open_sink(&config.storage).context("Failed to open archive")?;

    let mut receiver = match UdpReceiver::bind(&config.udp).await {
        Ok(receiver) => receiver,
        Err(e) => {
            transport.close();
            transport.join().await;
            return Err(e).context("UDP receiver could not start");
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        shutdown_tx.send_replace(true);
    });

    let mut gateway = Gateway::from_config(&config, transport.clone(), sink);
    gateway.run(&mut receiver, shutdown_rx).await;

    transport.close();
    transport.join().await;
    info!("Gateway stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn list_ports() -> Result<()> {
    logging::init(TracingConfig::default())?;

    let ports = SystemPorts
        .available_ports()
        .context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}
