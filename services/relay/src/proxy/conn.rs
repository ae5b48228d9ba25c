//! Closable TCP connection handle.
//!
//! A tokio socket is normally closed by dropping it, which only its owner
//! can do. The relay needs the opposite: the accept path, the registry and
//! both copy directions share one socket, and any of them must be able to
//! close it while another task is blocked reading from it.
//!
//! [`TcpConn`] keeps the stream behind a shared reference and drives all I/O
//! through readiness (`ready` + `try_read`/`try_write`). `close` shuts the
//! socket down and flips a watch flag, so every pending read or write wakes
//! up and fails with `NotConnected` instead of hanging or reporting a clean
//! end of stream. The descriptor itself is released when the last handle
//! drops.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Instant;

use socket2::SockRef;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// A TCP socket that can be closed from any task.
#[derive(Debug)]
pub struct TcpConn {
    stream: TcpStream,
    closed: watch::Sender<bool>,
    read_deadline: watch::Sender<Option<Instant>>,
    write_deadline: watch::Sender<Option<Instant>>,
}

impl TcpConn {
    /// Wrap an already connected stream.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: watch::Sender::new(false),
            read_deadline: watch::Sender::new(None),
            write_deadline: watch::Sender::new(None),
        }
    }

    /// Open a connection to `addr`.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        TcpStream::connect(addr).await.map(Self::new)
    }

    /// Read into `buf`, returning `Ok(0)` at end of stream.
    ///
    /// Fails with `NotConnected` once the connection has been closed, even if
    /// the read was already pending when `close` was called.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            self.ensure_open()?;
            return Ok(0);
        }

        let n = self
            .io(Interest::READABLE, &self.read_deadline, || {
                self.stream.try_read(&mut *buf)
            })
            .await?;

        // After shutdown the kernel reports EOF; that is not a clean end of stream.
        if n == 0 {
            self.ensure_open()?;
        }
        Ok(n)
    }

    /// Write some of `buf`, returning how many bytes were accepted.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            self.ensure_open()?;
            return Ok(0);
        }

        self.io(Interest::WRITABLE, &self.write_deadline, || {
            self.stream.try_write(buf)
        })
        .await
    }

    /// Write the whole of `buf`.
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

    /// Close the connection.
    ///
    /// Only the first call touches the socket; later calls return `Ok(())`.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        ignore_not_connected(SockRef::from(&self.stream).shutdown(Shutdown::Both))
    }

    /// Shut down the write side, sending FIN while reads stay open.
    pub fn close_write(&self) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        ignore_not_connected(SockRef::from(&self.stream).shutdown(Shutdown::Write))
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.stream.nodelay()
    }

    /// Set both the read and the write deadline.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    /// Set the instant after which reads fail with `TimedOut`.
    ///
    /// Applies to reads already pending. `None` clears the deadline.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.ensure_open()?;
        self.read_deadline.send_replace(deadline);
        Ok(())
    }

    /// Set the instant after which writes fail with `TimedOut`.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        self.ensure_open()?;
        self.write_deadline.send_replace(deadline);
        Ok(())
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_closed() {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    /// Drive one readiness-based operation until it completes, the deadline
    /// passes or the connection is closed.
    async fn io<R>(
        &self,
        interest: Interest,
        deadline: &watch::Sender<Option<Instant>>,
        mut op: impl FnMut() -> io::Result<R>,
    ) -> io::Result<R> {
        let mut closed = self.closed.subscribe();
        let mut deadline = deadline.subscribe();

        loop {
            if *closed.borrow_and_update() {
                return Err(closed_error());
            }
            let expires = *deadline.borrow_and_update();
            if expires.is_some_and(|at| at <= Instant::now()) {
                return Err(deadline_error());
            }

            tokio::select! {
                ready = wait_ready(&self.stream, interest, expires) => {
                    if !ready? {
                        return Err(deadline_error());
                    }
                }
                _ = closed.changed() => continue,
                _ = deadline.changed() => continue,
            }

            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if self.is_closed() => {
                    tracing::trace!(error = %e, "I/O error on closed connection");
                    return Err(closed_error());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Wait for readiness; `Ok(false)` means the deadline passed first.
async fn wait_ready(
    stream: &TcpStream,
    interest: Interest,
    expires: Option<Instant>,
) -> io::Result<bool> {
    match expires {
        Some(at) => match tokio::time::timeout_at(at.into(), stream.ready(interest)).await {
            Ok(ready) => ready.map(|_| true),
            Err(_) => Ok(false),
        },
        None => stream.ready(interest).await.map(|_| true),
    }
}

fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed connection")
}

fn deadline_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}
