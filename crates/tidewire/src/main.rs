//! # tidewire
//!
//! tidewire server binary: loads configuration, initialises logging and
//! metrics, registers the demo routes and serves until Ctrl-C.

#![deny(unsafe_code)]

mod routes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tidewire_core::{FrameMode, ServerConfig};
use tidewire_server::{Server, ServerHooks};

use crate::routes::{ServerSlot, demo_router};

/// How long to wait for the serving task after shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// tidewire message server.
#[derive(Parser, Debug)]
#[command(name = "tidewire", about = "Message-oriented TCP/WebSocket server")]
struct Cli {
    /// JSON config file (falls back to `TIDEWIRE_CONFIG`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Dispatch workers (0 for a task per message).
    #[arg(long)]
    workers: Option<usize>,

    /// `websocket` or `stream`.
    #[arg(long)]
    frame_mode: Option<FrameMode>,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Command-line flags win over file and environment.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.worker_pool_size = workers;
        }
        if let Some(mode) = self.frame_mode {
            config.frame_mode = mode;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut config =
        tidewire_core::loader::load_config(args.config.as_deref()).context("Failed to load config")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if args.json_logs {
        tidewire_core::logging::init_json_subscriber(&config.log_level);
    } else {
        tidewire_core::logging::init_subscriber(&config.log_level);
    }

    let slot = ServerSlot::default();
    let hooks = ServerHooks::new()
        .on_conn_start(|conn| {
            tracing::info!(conn_id = conn.id(), remote_addr = %conn.remote_addr(), "client connected");
        })
        .on_conn_stop(|conn| {
            tracing::info!(conn_id = conn.id(), "client disconnected");
        });
    let server = Server::new(config, demo_router(&slot), hooks).context("Failed to build server")?;
    let _ = slot.set(Arc::downgrade(&server));

    match tidewire_server::metrics::install_recorder() {
        Ok(handle) => {
            let _ = server.set_metrics_handle(handle);
        }
        Err(e) => tracing::warn!(error = %e, "metrics disabled"),
    }

    let addr = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        "tidewire listening on {addr} ({} mode, {} routes)",
        server.config().frame_mode,
        server.dispatcher().router().len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server.drain(Some(SHUTDOWN_TIMEOUT)).await {
        tracing::warn!("background tasks did not finish within {SHUTDOWN_TIMEOUT:?}");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
