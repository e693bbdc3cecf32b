//! Workspace bridge host process.
//!
//! Runs the bridge for one IDE backend session inside a remote workspace
//! until the process is asked to stop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};

use workspace_bridge::bridge::{LogHost, WorkspaceBridge};
use workspace_bridge::config::{env::get_config_path, load_and_validate};
use workspace_bridge::server::WebSocketConnector;
use workspace_bridge::supervisor::HttpSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Workspace bridge v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path);

    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  Supervisor: {}", config.supervisor.url);
    info!("  Backend: {} ({})", config.ide.backend_kind, config.ide.qualifier);
    if let Some(proxy) = &config.server.proxy {
        info!("  Proxy: {}", proxy);
    }
    if config.ide.dev_mode {
        warn!("Development mode: telemetry is logged, not sent");
    }

    let supervisor = Arc::new(HttpSupervisor::new(&config.supervisor.url)?);
    let connector =
        WebSocketConnector::new(Duration::from_millis(config.server.connect_timeout_ms));

    let bridge = WorkspaceBridge::start(config, supervisor, Arc::new(LogHost), connector)?;
    bridge.set_active_session(true).await;

    let shutdown = tokio::select! {
        biased;
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            true
        }
        outcome = bridge.termination() => {
            error!("Bridge stopped: {}", outcome);
            false
        }
    };

    let timeout = Duration::from_secs(5);
    match tokio::time::timeout(timeout, bridge.shutdown()).await {
        Ok(()) => info!("All tasks stopped"),
        Err(_) => warn!("Shutdown timed out"),
    }

    info!("Exiting...");
    if !shutdown {
        std::process::exit(1);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
