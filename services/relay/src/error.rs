//! Error types for the relay.

use std::io;

use thiserror::Error;

/// Errors that cross the relay's boundary.
///
/// Per-connection failures (dial errors, resets, EOF) never show up here;
/// they end the affected connection and are only logged.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listen socket could not be bound.
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The accept loop panicked instead of shutting down.
    #[error("listener did not shut down cleanly")]
    ListenerClosed,

    /// No unused port could be found on the requested host.
    #[error("failed to probe unused port on {host}: {source}")]
    Probe {
        host: String,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Returns true if this error came from binding the listen socket.
    pub fn is_bind_error(&self) -> bool {
        matches!(self, RelayError::Bind { .. })
    }
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
