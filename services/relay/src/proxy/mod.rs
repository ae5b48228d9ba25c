//! Restartable L4 TCP relay.
//!
//! This module provides:
//! - A closable connection handle usable from many tasks
//! - Read/write interceptor hooks on the client side
//! - A registry of live connections for forced shutdown
//! - The per-connection relay engine
//! - The start/close lifecycle around the listen socket
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> WrappedConn (hooks) -> Relay engine -> Backend
//!              |               |
//!              |        ConnectionRegistry <- close_all()
//!              |
//!       start() / close()
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tcprelay::Relay;
//!
//! let relay = Relay::on_ephemeral_port("127.0.0.1", "127.0.0.1:5432")?;
//! relay.start().await?;
//! // point the client at relay.listen_addr() ...
//! relay.close_connections(); // kill live sessions, keep listening
//! relay.close().await?;
//! ```

mod conn;
mod engine;
mod registry;
mod relay;
mod wrapper;

pub use conn::TcpConn;
pub use engine::COPY_BUFFER_SIZE;
pub use registry::{ConnId, ConnectionRegistry, Registration};
pub use relay::{LifecycleState, Relay, RelayStats};
pub use wrapper::{Interceptors, ReadHook, WrappedConn, WriteHook};
