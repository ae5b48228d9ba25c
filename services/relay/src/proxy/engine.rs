//! Per-connection relay: dial the backend, copy bytes both ways, tear down.
//!
//! Termination rules:
//! - a direction that reaches end of stream half-closes its destination, so
//!   the peer sees EOF while the other direction keeps flowing;
//! - a direction that fails (socket error, hook error, forced close) closes
//!   both sockets, which unblocks the other direction;
//! - a read or write still in flight, including one parked inside a hook,
//!   is abandoned as soon as either socket is closed.
//!
//! Once both directions are done both sockets are closed and the
//! connection's [`Registration`] is dropped, removing it from the registry.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use super::conn::TcpConn;
use super::registry::Registration;
use super::relay::RelayStats;
use super::wrapper::WrappedConn;

/// Size of the buffer each copy direction reads into.
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Dials the fixed backend address.
#[derive(Debug, Clone)]
pub(crate) struct Dialer {
    pub backend_addr: String,
    pub connect_timeout: Option<Duration>,
    pub nodelay: bool,
}

impl Dialer {
    /// Connect to the backend. Failures are not retried.
    pub async fn dial(&self) -> io::Result<TcpConn> {
        debug!(backend_addr = %self.backend_addr, "Connecting to backend");

        let connect = TcpConn::connect(&self.backend_addr);
        let conn = match self.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect timeout",
                    ))
                }
            },
            None => connect.await?,
        };

        if self.nodelay {
            if let Err(e) = conn.set_nodelay(true) {
                debug!(error = %e, "Failed to set TCP_NODELAY on backend connection");
            }
        }

        Ok(conn)
    }
}

/// Counts a connection as active until dropped.
struct ActiveConnection<'a>(&'a RelayStats);

impl<'a> ActiveConnection<'a> {
    fn enter(stats: &'a RelayStats) -> Self {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.0.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Relay one accepted, already registered client connection.
pub(crate) async fn relay_connection(
    client: Arc<WrappedConn>,
    registration: Registration,
    dialer: Arc<Dialer>,
    stats: Arc<RelayStats>,
) {
    // Declared first so it is dropped last, after both sockets are closed.
    let _registration = registration;
    let _active = ActiveConnection::enter(&stats);

    // A forced close must also interrupt a dial that is still in flight.
    let dialed = tokio::select! {
        dialed = dialer.dial() => dialed,
        _ = client.closed() => {
            debug!("Client closed before backend was reached");
            return;
        }
    };

    let backend = match dialed {
        Ok(conn) => {
            stats.backend_connected.fetch_add(1, Ordering::Relaxed);
            WrappedConn::passthrough(conn)
        }
        Err(e) => {
            stats.backend_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                backend_addr = %dialer.backend_addr,
                error = %e,
                "Backend connection failed"
            );
            let _ = client.close();
            return;
        }
    };

    if let Ok(backend_local) = backend.local_addr() {
        debug!(backend_local = %backend_local, "Connected to backend");
    }

    let (bytes_to_backend, bytes_from_backend) =
        proxy_bidirectional(&client, &backend, &stats).await;

    let _ = client.close();
    let _ = backend.close();

    debug!(
        bytes_to_backend = bytes_to_backend,
        bytes_from_backend = bytes_from_backend,
        "Connection closed"
    );
}

/// Copy client->backend and backend->client until both directions end.
///
/// Returns (bytes_to_backend, bytes_from_backend).
async fn proxy_bidirectional(
    client: &WrappedConn,
    backend: &WrappedConn,
    stats: &RelayStats,
) -> (u64, u64) {
    let client_to_backend = async {
        let (total, result) = copy(client, backend, &stats.bytes_to_backend).await;
        finish_direction("client_to_backend", result, client, backend);
        total
    };

    let backend_to_client = async {
        let (total, result) = copy(backend, client, &stats.bytes_from_backend).await;
        finish_direction("backend_to_client", result, backend, client);
        total
    };

    tokio::join!(client_to_backend, backend_to_client)
}

/// Copy from `src` to `dst` until EOF, an error, or either side being closed.
///
/// Returns the bytes copied alongside how the copy ended.
async fn copy(src: &WrappedConn, dst: &WrappedConn, counter: &AtomicU64) -> (u64, io::Result<()>) {
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = match until_closed(src, dst, src.read(&mut buf)).await {
            Ok(0) => return (total, Ok(())),
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };

        if let Err(e) = until_closed(src, dst, dst.write_all(&buf[..n])).await {
            return (total, Err(e));
        }
        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Run one read or write, abandoning it once either connection is closed.
///
/// Hooks may block for as long as they like; a forced close still ends the
/// operation.
async fn until_closed<T>(
    src: &WrappedConn,
    dst: &WrappedConn,
    op: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    tokio::select! {
        result = op => result,
        _ = src.closed() => Err(io::Error::new(io::ErrorKind::NotConnected, "source closed")),
        _ = dst.closed() => Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "destination closed",
        )),
    }
}

fn finish_direction(
    direction: &'static str,
    result: io::Result<()>,
    src: &WrappedConn,
    dst: &WrappedConn,
) {
    match result {
        Ok(()) => {
            if let Err(e) = dst.close_write() {
                debug!(direction, error = %e, "Half-close failed");
            }
        }
        Err(e) => {
            debug!(direction, error = %e, "Copy ended with error");
            let _ = src.close();
            let _ = dst.close();
        }
    }
}
