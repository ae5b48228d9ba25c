pub mod config;
pub mod error;
pub mod proxy;

pub use async_trait::async_trait;
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use proxy::{
    ConnId, ConnectionRegistry, Interceptors, LifecycleState, ReadHook, Registration, Relay,
    RelayStats, TcpConn, WrappedConn, WriteHook, COPY_BUFFER_SIZE,
};
