//! tcprelay
//!
//! Standalone TCP relay.
//!
//! This binary:
//! - Loads listen/backend addresses from the environment
//! - Forwards every accepted connection to the backend
//! - Force-closes live connections and exits on Ctrl-C

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcprelay::{Relay, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    let log_level = std::env::var("RELAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        listen_addr = %config.listen_addr,
        backend_addr = %config.backend_addr,
        connect_timeout_ms = config.connect_timeout.map(|t| t.as_millis() as u64),
        nodelay = config.nodelay,
        "Configuration loaded"
    );

    let relay = Relay::with_config(config);
    relay.start().await.context("Failed to start relay")?;
    info!(listen_addr = %relay.listen_addr(), "Relay listening");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!(
        active_connections = relay.active_connections(),
        "Shutdown requested"
    );
    relay.close().await.context("Failed to close relay")?;

    Ok(())
}
