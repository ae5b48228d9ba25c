//! Relay configuration.
//!
//! Built in code with [`RelayConfig::new`] when the relay is embedded, or
//! from environment variables for the standalone binary.

use std::time::Duration;

use anyhow::{Context, Result};

/// Default listen address: loopback, OS-assigned port.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:0";

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on (host:port).
    pub listen_addr: String,

    /// Address every accepted connection is forwarded to (host:port).
    pub backend_addr: String,

    /// Upper bound for dialing the backend. `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,

    /// Set TCP_NODELAY on both legs of every relayed connection.
    pub nodelay: bool,
}

impl RelayConfig {
    /// Configuration with no connect timeout and TCP_NODELAY enabled.
    pub fn new(listen_addr: impl Into<String>, backend_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            backend_addr: backend_addr.into(),
            connect_timeout: None,
            nodelay: true,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr =
            lookup("RELAY_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());

        let backend_addr = lookup("RELAY_BACKEND_ADDR")
            .context("Missing backend address. Set RELAY_BACKEND_ADDR (host:port).")?;

        let connect_timeout_ms: u64 = lookup("RELAY_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(0);
        let connect_timeout =
            (connect_timeout_ms > 0).then(|| Duration::from_millis(connect_timeout_ms));

        let nodelay = lookup("RELAY_NODELAY")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        Ok(Self {
            listen_addr,
            backend_addr,
            connect_timeout,
            nodelay,
        })
    }
}
