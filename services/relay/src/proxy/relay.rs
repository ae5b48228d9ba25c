//! Relay lifecycle: binding, the accept loop, and forced shutdown.
//!
//! A [`Relay`] is either `Stopped` or `Running`. Transitions happen under a
//! lifecycle lock that is separate from the connection registry's lock, so
//! `start`/`close` never contend with connections registering or
//! deregistering themselves.
//!
//! ```text
//!            start()                       close()
//! Stopped ----------> Running --------------------------> Stopped
//!   ^  bind error        |  stop accept loop, close_all,
//!   +--------------------+  wait for the registry to drain
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::conn::TcpConn;
use super::engine::{relay_connection, Dialer};
use super::registry::ConnectionRegistry;
use super::wrapper::{Interceptors, ReadHook, WrappedConn, WriteHook};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};

/// Lifecycle state of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Running,
}

/// Statistics for a relay.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being relayed.
    pub connections_active: AtomicU64,
    /// Connections fully torn down.
    pub connections_closed: AtomicU64,
    /// Backend dials that succeeded.
    pub backend_connected: AtomicU64,
    /// Backend dials that failed.
    pub backend_failed: AtomicU64,
    /// Bytes copied client -> backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes copied backend -> client.
    pub bytes_from_backend: AtomicU64,
}

/// The listen socket while the relay is running.
struct ActiveListener {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl ActiveListener {
    /// Whether the accept loop has exited on its own (listener error).
    fn is_finished(&self) -> bool {
        self.accept_task.is_finished()
    }

    /// Stop the accept loop and wait until it has released the socket.
    ///
    /// A loop that already exited after an accept error is not a failure;
    /// only a panicked loop is reported.
    async fn close(self) -> Result<()> {
        if self.shutdown.send(()).is_err() {
            debug!(listen_addr = %self.local_addr, "Accept loop had already exited");
        }

        match self.accept_task.await {
            Err(e) if e.is_panic() => {
                error!(listen_addr = %self.local_addr, "Accept loop panicked");
                Err(RelayError::ListenerClosed)
            }
            _ => Ok(()),
        }
    }
}

enum Lifecycle {
    Stopped,
    Running(ActiveListener),
}

impl Lifecycle {
    /// A relay whose accept loop died is reported as stopped.
    fn state(&self) -> LifecycleState {
        match self {
            Lifecycle::Running(listener) if !listener.is_finished() => LifecycleState::Running,
            _ => LifecycleState::Stopped,
        }
    }
}

/// A restartable TCP relay forwarding every accepted connection to one
/// backend address.
pub struct Relay {
    /// Listen address; pinned to the bound address after the first start.
    listen_addr: ArcSwap<String>,
    dialer: Arc<Dialer>,
    interceptors: Interceptors,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<RelayStats>,
    lifecycle: Mutex<Lifecycle>,
}

impl Relay {
    /// Create a relay that is not yet listening.
    pub fn new(listen_addr: impl Into<String>, backend_addr: impl Into<String>) -> Self {
        Self::with_config(RelayConfig::new(listen_addr, backend_addr))
    }

    /// Create a relay from a full configuration.
    pub fn with_config(config: RelayConfig) -> Self {
        Self {
            listen_addr: ArcSwap::from_pointee(config.listen_addr),
            dialer: Arc::new(Dialer {
                backend_addr: config.backend_addr,
                connect_timeout: config.connect_timeout,
                nodelay: config.nodelay,
            }),
            interceptors: Interceptors::none(),
            registry: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(RelayStats::default()),
            lifecycle: Mutex::new(Lifecycle::Stopped),
        }
    }

    /// Create a relay on a port that is currently unused on `listen_host`.
    ///
    /// The port is found by binding port 0 and releasing it again, so another
    /// process may still grab it before `start`.
    pub fn on_ephemeral_port(listen_host: &str, backend_addr: impl Into<String>) -> Result<Self> {
        let probe_error = |source| RelayError::Probe {
            host: listen_host.to_string(),
            source,
        };

        let probe = std::net::TcpListener::bind((listen_host, 0)).map_err(probe_error)?;
        let addr = probe.local_addr().map_err(probe_error)?;
        drop(probe);

        Ok(Self::new(addr.to_string(), backend_addr))
    }

    /// Install the hook that replaces reads from accepted connections.
    ///
    /// Takes `&mut self`: hooks can only change while nothing else holds the
    /// relay. The accept loop captures the hooks when `start` binds, so a
    /// hook installed while the relay is running applies from the next
    /// `start` on. Existing connections keep the hooks they were accepted
    /// with.
    pub fn set_read_hook(&mut self, hook: Arc<dyn ReadHook>) {
        self.interceptors.set_read(hook);
    }

    /// Install the hook that replaces writes to accepted connections.
    ///
    /// Same timing as [`Relay::set_read_hook`]: takes effect at the next
    /// `start`.
    pub fn set_write_hook(&mut self, hook: Arc<dyn WriteHook>) {
        self.interceptors.set_write(hook);
    }

    /// Bind the listen socket and start accepting.
    ///
    /// Does nothing if the relay is already running.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match &*lifecycle {
            Lifecycle::Running(listener) if !listener.is_finished() => {
                debug!("Relay already running");
                return Ok(());
            }
            Lifecycle::Running(listener) => {
                warn!(listen_addr = %listener.local_addr, "Accept loop exited, rebinding");
            }
            Lifecycle::Stopped => {}
        }

        let addr = self.listen_addr();
        let bind_error = |source| RelayError::Bind {
            addr: addr.clone(),
            source,
        };

        let listener = TcpListener::bind(addr.as_str()).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        // Restarts must come back on the same port, even if 0 was requested.
        self.listen_addr.store(Arc::new(local_addr.to_string()));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let acceptor = Acceptor {
            listener,
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            interceptors: self.interceptors.clone(),
            dialer: Arc::clone(&self.dialer),
        };
        let accept_task = tokio::spawn(
            acceptor
                .run(shutdown_rx)
                .instrument(tracing::info_span!("relay", listen_addr = %local_addr)),
        );

        info!(
            listen_addr = %local_addr,
            backend_addr = %self.dialer.backend_addr,
            read_hook = self.interceptors.has_read(),
            write_hook = self.interceptors.has_write(),
            "Relay started"
        );

        *lifecycle = Lifecycle::Running(ActiveListener {
            local_addr,
            shutdown: shutdown_tx,
            accept_task,
        });
        Ok(())
    }

    /// Stop accepting and force-close every live connection.
    ///
    /// Returns once the listen socket is released and no connection is
    /// registered. Does nothing if the relay is already stopped. If the
    /// accept loop had died on a listener error, its connections are still
    /// torn down. A panicked accept loop is reported only after that.
    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let listener = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Stopped => {
                debug!("Relay already stopped");
                return Ok(());
            }
            Lifecycle::Running(listener) => listener,
        };

        let local_addr = listener.local_addr;
        let result = listener.close().await;

        let forced = self.registry.close_all();
        self.registry.wait_empty().await;

        info!(
            listen_addr = %local_addr,
            closed_connections = forced,
            "Relay stopped"
        );
        result
    }

    /// Force-close every registered connection but keep accepting new ones.
    pub fn close_connections(&self) {
        let forced = self.registry.close_all();
        debug!(closed_connections = forced, "Closed active connections");
    }

    /// The listen address, including the port actually bound once started.
    pub fn listen_addr(&self) -> String {
        self.listen_addr.load().as_str().to_owned()
    }

    /// The backend every connection is forwarded to.
    pub fn backend_addr(&self) -> &str {
        &self.dialer.backend_addr
    }

    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.lock().await.state()
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == LifecycleState::Running
    }

    /// Number of connections currently registered.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        // The accept loop exits on its own once the shutdown sender is dropped.
        self.registry.close_all();
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("listen_addr", &self.listen_addr())
            .field("backend_addr", &self.dialer.backend_addr)
            .field("interceptors", &self.interceptors)
            .field("active_connections", &self.registry.len())
            .finish()
    }
}

/// Owns the listen socket for one run of the relay.
struct Acceptor {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<RelayStats>,
    interceptors: Interceptors,
    dialer: Arc<Dialer>,
}

impl Acceptor {
    /// Accept until told to stop or the listener fails; the socket is
    /// released when this returns.
    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                    Err(e) => {
                        warn!(error = %e, "Accept failed, listener exiting");
                        break;
                    }
                },
            }
        }
        debug!("Accept loop finished");
    }

    /// Wrap, register and hand one accepted socket to the relay engine.
    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let client = Arc::new(WrappedConn::new(
            TcpConn::new(stream),
            self.interceptors.clone(),
        ));

        if self.dialer.nodelay {
            if let Err(e) = client.set_nodelay(true) {
                debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        let registration = self.registry.add(Arc::clone(&client));
        let conn_id = registration.id();
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        debug!(conn_id, peer_addr = %peer_addr, "Accepted connection");

        tokio::spawn(
            relay_connection(
                client,
                registration,
                Arc::clone(&self.dialer),
                Arc::clone(&self.stats),
            )
            .instrument(tracing::info_span!("connection", conn_id, peer = %peer_addr)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    async fn echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_new_relay_is_stopped() {
        let relay = Relay::new("127.0.0.1:0", "127.0.0.1:1");
        assert_eq!(relay.state().await, LifecycleState::Stopped);
        assert_eq!(relay.listen_addr(), "127.0.0.1:0");
        assert_eq!(relay.backend_addr(), "127.0.0.1:1");
        assert_eq!(relay.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_start_pins_bound_port() {
        let relay = Relay::new("127.0.0.1:0", "127.0.0.1:1");
        relay.start().await.unwrap();

        let addr: SocketAddr = relay.listen_addr().parse().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(relay.is_running().await);

        relay.close().await.unwrap();
        assert_eq!(relay.listen_addr(), addr.to_string());
        assert!(!relay.is_running().await);
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_relay_stopped() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap().to_string();

        let relay = Relay::new(addr, "127.0.0.1:1");
        let err = relay.start().await.unwrap_err();
        assert!(err.is_bind_error());
        assert_eq!(relay.state().await, LifecycleState::Stopped);

        // Close on a relay that never started is a no-op.
        relay.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_accept_loop_counts_as_stopped() {
        let relay = Relay::on_ephemeral_port("127.0.0.1", "127.0.0.1:1").unwrap();
        relay.start().await.unwrap();
        let addr = relay.listen_addr();

        // Stands in for the loop exiting on an accept error.
        if let Lifecycle::Running(listener) = &*relay.lifecycle.lock().await {
            listener.accept_task.abort();
        }

        let stopped = timeout(Duration::from_secs(2), async {
            while relay.is_running().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(stopped.is_ok(), "dead accept loop should report stopped");

        // start binds again on the pinned address instead of being a no-op.
        relay.start().await.unwrap();
        assert!(relay.is_running().await);
        assert_eq!(relay.listen_addr(), addr);
        TcpStream::connect(&addr).await.unwrap();

        relay.close().await.unwrap();
        assert_eq!(relay.state().await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_close_after_dead_accept_loop_is_ok() {
        let relay = Relay::new("127.0.0.1:0", "127.0.0.1:1");
        relay.start().await.unwrap();

        if let Lifecycle::Running(listener) = &*relay.lifecycle.lock().await {
            listener.accept_task.abort();
        }

        relay.close().await.unwrap();
        assert_eq!(relay.state().await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_hook_installed_while_running_applies_after_restart() {
        struct Shout;

        #[async_trait::async_trait]
        impl ReadHook for Shout {
            async fn on_read(&self, conn: &TcpConn, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = conn.read(buf).await?;
                buf[..n].make_ascii_uppercase();
                Ok(n)
            }
        }

        async fn echo_once(addr: &str) -> Vec<u8> {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"quiet").await.unwrap();
            let mut buf = [0u8; 5];
            timeout(Duration::from_secs(2), client.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            buf.to_vec()
        }

        let backend = echo_backend().await;
        let mut relay = Relay::new("127.0.0.1:0", backend.to_string());
        relay.start().await.unwrap();

        relay.set_read_hook(Arc::new(Shout));
        assert_eq!(echo_once(&relay.listen_addr()).await, b"quiet");

        relay.close().await.unwrap();
        relay.start().await.unwrap();
        assert_eq!(echo_once(&relay.listen_addr()).await, b"QUIET");

        relay.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_port() {
        let relay = Relay::on_ephemeral_port("127.0.0.1", "127.0.0.1:1").unwrap();
        relay.start().await.unwrap();
        relay.close().await.unwrap();

        let rebound = TcpListener::bind(relay.listen_addr()).await;
        assert!(rebound.is_ok(), "listen port should be free after close");
    }

    #[tokio::test]
    async fn test_relays_and_counts_bytes() {
        let backend = echo_backend().await;
        let relay = Relay::new("127.0.0.1:0", backend.to_string());
        relay.start().await.unwrap();

        let mut client = TcpStream::connect(relay.listen_addr()).await.unwrap();
        client.write_all(b"stats").await.unwrap();
        let mut buf = [0u8; 5];
        timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"stats");

        drop(client);
        relay.close().await.unwrap();

        let stats = relay.stats();
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.backend_connected.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 5);
        assert_eq!(stats.bytes_from_backend.load(Ordering::Relaxed), 5);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
    }
}
