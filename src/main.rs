//! # relay
//!
//! Relay server binary: loads settings, installs logging and metrics, and
//! serves the WebSocket fan-out until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_server::RelayServer;
use relay_settings::{LogFormat, RelaySettings};

/// Real-time WebSocket fan-out relay.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Real-time WebSocket fan-out relay", version)]
struct Cli {
    /// JSON settings file.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Directory served for non-WebSocket paths.
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Log output format (pretty or json).
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Flags win over file and environment values.
    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(dir) = &self.static_dir {
            settings.server.static_dir.clone_from(dir);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = relay_settings::load_settings(cli.config.as_deref())
        .context("Failed to load settings")?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    let _ = relay_telemetry::init_telemetry(&settings.logging);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_format = %settings.logging.format,
        "starting relay"
    );

    let metrics = relay_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let server = RelayServer::new(settings.server).with_metrics(metrics);
    let handle = server.listen().await.context("Failed to start server")?;
    tracing::info!("relay listening on http://{}", handle.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down...");
    if !handle.shutdown().await {
        tracing::warn!("some tasks did not stop before the shutdown timeout");
    }
    tracing::info!("shutdown complete");
    Ok(())
}
