mod activator;
mod config_store;
mod destination;
mod device_monitor;
mod hid;
mod hub;
mod ipc;
mod source;
mod transform;
mod wire;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use config_store::ConfigStore;
use device_monitor::DeviceMonitor;
use hub::Hub;
use ipc::IpcListener;

/// Input event router: grabs configured evdev/remote sources, applies
/// per-link transforms and activators, and forwards the result to uinput,
/// subprocess, or HID-gadget destinations.
#[derive(Parser, Debug)]
#[command(name = "evdev_transformer")]
#[command(about = "Routes Linux input events between sources and virtual sinks")]
struct Args {
    /// Configuration name, resolved to ~/.config/evdev_transformer/<name>.json
    config: String,

    /// Log level (overrides RUST_LOG/LOGLEVEL if set)
    #[arg(long)]
    log: Option<String>,
}

fn init_tracing(explicit: Option<&str>) {
    let filter = explicit
        .map(|s| s.to_string())
        .or_else(|| std::env::var("LOGLEVEL").ok())
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log.as_deref());

    let config = match evdev_transformer_config::load_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{:?}", miette::Report::new(err));
            std::process::exit(1);
        }
    };

    tracing::info!(config = %args.config, "configuration loaded");

    let config_store = Arc::new(ConfigStore::new(config));
    let device_monitor = DeviceMonitor::new().context("failed to start udev monitor")?;

    let ipc_listener = match IpcListener::bind() {
        Ok(listener) => {
            tracing::info!(path = %listener.socket_path().display(), "IPC listener bound");
            Some(listener)
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to bind IPC listener; remote sources unavailable");
            None
        }
    };

    let hub = Hub::new(config_store);

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tracing::info!("evdev_transformer starting");

    tokio::select! {
        result = hub.run(device_monitor, ipc_listener) => {
            result.context("hub event loop exited")?;
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            tracing::info!("received SIGINT, shutting down");
        }
    }

    hub.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}
