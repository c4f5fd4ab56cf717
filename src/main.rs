//! Gridlight GW - hardware light gateway
//!
//! Drives grid controllers and LED strips from software light modules over
//! MIDI SysEx, HTTP JSON, UDP, and a relay socket.

use anyhow::Result;
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gridlight_gw::config::ConfigWatcher;
use gridlight_gw::events::CoreEvent;
use gridlight_gw::Gateway;

/// Gridlight Gateway - drive grid controllers and LED strips from software
/// light modules
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "gateway.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available MIDI ports
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    if args.list_ports {
        list_midi_ports()?;
        return Ok(());
    }

    info!("Starting Gridlight GW...");
    info!("Configuration file: {}", args.config);

    // Load configuration with hot-reload watcher
    let (mut config_watcher, initial_config) = ConfigWatcher::new(args.config.clone()).await?;
    info!("Configuration loaded successfully with hot-reload enabled");

    let gateway = Gateway::from_config(&initial_config).await?;
    let mut events = gateway.subscribe(256);

    info!("Ready to drive lights!");

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                match event {
                    CoreEvent::Input(input) => {
                        debug!(
                            device_id = input.device_id,
                            unit = input.unit_index,
                            kind = ?input.kind,
                            value = input.value,
                            "Input"
                        );
                    }
                    CoreEvent::ConnectionChange { device_id, status } => {
                        info!(device_id, ?status, "Connection change");
                    }
                    CoreEvent::FrameComposited { .. } => {}
                }
            }

            Some(update) = config_watcher.next_update() => {
                info!(
                    added = update.added.len(),
                    removed = update.removed.len(),
                    changed = update.changed.len(),
                    "Configuration file changed, reloading..."
                );
                match gateway.apply_config(&update.config).await {
                    Ok(()) => info!("Configuration reloaded successfully"),
                    Err(e) => warn!("Failed to apply new config (keeping old one): {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, stopping event loop");
                break;
            }
        }
    }

    gateway.shutdown().await;
    info!("Gridlight GW shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

fn list_midi_ports() -> Result<()> {
    use colored::*;
    use midir::{MidiInput, MidiOutput};

    let midi_in = MidiInput::new("gridlight-gw port scan")?;
    println!("\n{}", "Available MIDI input ports:".bold().cyan());
    for port in midi_in.ports() {
        match midi_in.port_name(&port) {
            Ok(name) => println!("  {}", name.green()),
            Err(e) => println!("  {} ({})", "<unreadable>".red(), e),
        }
    }

    let midi_out = MidiOutput::new("gridlight-gw port scan")?;
    println!("\n{}", "Available MIDI output ports:".bold().cyan());
    for port in midi_out.ports() {
        match midi_out.port_name(&port) {
            Ok(name) => println!("  {}", name.green()),
            Err(e) => println!("  {} ({})", "<unreadable>".red(), e),
        }
    }

    println!();
    Ok(())
}
