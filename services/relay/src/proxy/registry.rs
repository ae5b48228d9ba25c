//! Registry of live connections.
//!
//! Every accepted connection is registered before any relay work starts and
//! removed by a [`Registration`] guard when its task finishes, whichever way
//! it finishes. `close_all` is how the relay forces connections down: it
//! snapshots the members under the lock and closes them after releasing it,
//! because a close can make the owning task finish and deregister right away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use super::wrapper::WrappedConn;

/// Identity of a registered connection, unique per registry.
pub type ConnId = u64;

/// Concurrency-safe set of active connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: Mutex<HashMap<ConnId, Arc<WrappedConn>>>,
    next_id: AtomicU64,
    drained: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` and return the guard that deregisters it on drop.
    pub fn add(self: &Arc<Self>, conn: Arc<WrappedConn>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, conn);
        Registration {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Remove a connection. Unknown ids are ignored.
    pub fn remove(&self, id: ConnId) {
        let now_empty = {
            let mut conns = self.lock();
            conns.remove(&id);
            conns.is_empty()
        };

        if now_empty {
            self.drained.notify_waiters();
        }
    }

    /// Close every registered connection.
    ///
    /// Close errors are logged and skipped. Returns how many connections
    /// were in the snapshot.
    pub fn close_all(&self) -> usize {
        let snapshot: Vec<(ConnId, Arc<WrappedConn>)> = self
            .lock()
            .iter()
            .map(|(id, conn)| (*id, Arc::clone(conn)))
            .collect();

        for (id, conn) in &snapshot {
            if let Err(e) = conn.close() {
                debug!(conn_id = id, error = %e, "Failed to close connection");
            }
        }

        snapshot.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Wait until no connection is registered.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a removal in between is not missed.
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Arc<WrappedConn>>> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.conns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a connection registered for as long as it is alive.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnId,
}

impl Registration {
    pub fn id(&self) -> ConnId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
