//! Interceptor hooks and the connection wrapper that routes through them.
//!
//! Hooks are installed on the relay before it starts and are captured by
//! every accepted connection's [`WrappedConn`]. They replace the raw socket
//! read or write on the client side of the relay:
//!
//! - [`ReadHook`] runs when the relay reads from the client (the client
//!   wrote something).
//! - [`WriteHook`] runs when the relay writes to the client (the client is
//!   about to read something).
//!
//! A hook receives the raw [`TcpConn`] and is expected to perform the I/O
//! itself, so it can observe, rewrite, delay or fail it. Errors a hook
//! returns end the connection exactly like socket errors do.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::conn::TcpConn;

/// Replaces `read` on the client socket.
#[async_trait]
pub trait ReadHook: Send + Sync {
    /// Read from `conn` into `buf`, same contract as [`TcpConn::read`].
    async fn on_read(&self, conn: &TcpConn, buf: &mut [u8]) -> io::Result<usize>;
}

/// Replaces `write` on the client socket.
#[async_trait]
pub trait WriteHook: Send + Sync {
    /// Write some of `buf` to `conn`, same contract as [`TcpConn::write`].
    async fn on_write(&self, conn: &TcpConn, buf: &[u8]) -> io::Result<usize>;
}

/// The pair of optional hooks, fixed before the relay starts.
#[derive(Clone, Default)]
pub struct Interceptors {
    read: Option<Arc<dyn ReadHook>>,
    write: Option<Arc<dyn WriteHook>>,
}

impl Interceptors {
    /// No hooks: a wrapper built from this passes everything through.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn set_read(&mut self, hook: Arc<dyn ReadHook>) {
        self.read = Some(hook);
    }

    pub fn set_write(&mut self, hook: Arc<dyn WriteHook>) {
        self.write = Some(hook);
    }

    pub fn has_read(&self) -> bool {
        self.read.is_some()
    }

    pub fn has_write(&self) -> bool {
        self.write.is_some()
    }
}

impl std::fmt::Debug for Interceptors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptors")
            .field("read", &self.has_read())
            .field("write", &self.has_write())
            .finish()
    }
}

/// A connection whose reads and writes go through the installed hooks.
///
/// Every other operation is forwarded to the raw connection untouched.
#[derive(Debug)]
pub struct WrappedConn {
    conn: TcpConn,
    interceptors: Interceptors,
}

impl WrappedConn {
    pub fn new(conn: TcpConn, interceptors: Interceptors) -> Self {
        Self { conn, interceptors }
    }

    /// Wrap without hooks.
    pub fn passthrough(conn: TcpConn) -> Self {
        Self::new(conn, Interceptors::none())
    }

    /// The raw connection underneath the hooks.
    pub fn inner(&self) -> &TcpConn {
        &self.conn
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.interceptors.read {
            Some(hook) => hook.on_read(&self.conn, buf).await,
            None => self.conn.read(buf).await,
        }
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match &self.interceptors.write {
            Some(hook) => hook.on_write(&self.conn, buf).await,
            None => self.conn.write(buf).await,
        }
    }

    /// Write all of `buf`, one hook call per partial write.
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    pub fn close(&self) -> io::Result<()> {
        self.conn.close()
    }

    pub fn close_write(&self) -> io::Result<()> {
        self.conn.close_write()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub async fn closed(&self) {
        self.conn.closed().await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.conn.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.conn.set_nodelay(nodelay)
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.conn.set_deadline(deadline)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.conn.set_read_deadline(deadline)
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.conn.set_write_deadline(deadline)
    }
}
