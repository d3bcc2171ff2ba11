//! The set of live connections, shared by every session.
//!
//! The registry only ever holds the *sending* side of a connection: a bounded
//! channel into the writer task that the owning session spawned. It can push
//! text towards a client but has no way to read from or close the socket.
//! When a client stops keeping up, the dispatcher raises the handle's
//! [`Eviction`] signal and the owning session closes the connection itself.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::sync::{Notify, mpsc};
use tracing::debug;

use crate::dispatcher::SendError;

/// Identity of one connection, unique for the lifetime of a registry.
///
/// Client identifiers are caller supplied and may collide; connection ids never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Request, raised by a broadcaster, that a connection's session end itself.
///
/// Clones share one flag. Holding an `Eviction` does not keep the outbound
/// queue open, so a session can watch it without delaying its own teardown.
#[derive(Debug, Clone, Default)]
pub struct Eviction {
    inner: Arc<EvictionState>,
}

#[derive(Debug, Default)]
struct EvictionState {
    requested: AtomicBool,
    notify: Notify,
}

impl Eviction {
    /// Returns true only for the call that actually raised the signal.
    pub fn request(&self) -> bool {
        let first = !self.inner.requested.swap(true, Ordering::AcqRel);
        if first {
            // Stores a permit, so a session that is not waiting yet still sees it.
            self.inner.notify.notify_one();
        }
        first
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::Acquire)
    }

    /// Resolves once eviction has been requested.
    pub async fn requested(&self) {
        if self.is_requested() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

/// Sending capability for one connected client.
///
/// Cloning is cheap and every clone feeds the same outbound queue.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    client_id: Arc<str>,
    outbox: mpsc::Sender<String>,
    eviction: Eviction,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        client_id: impl Into<Arc<str>>,
        outbox: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            outbox,
            eviction: Eviction::default(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queue `text` for the connection's writer.
    ///
    /// Waits while the outbound queue is full; callers bound that wait. An
    /// evicted connection refuses new text straight away.
    pub async fn send(&self, text: String) -> Result<(), SendError> {
        if self.eviction.is_requested() {
            return Err(SendError::Evicted);
        }
        self.outbox.send(text).await.map_err(|_| SendError::Closed)
    }

    /// True once the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    pub fn eviction(&self) -> Eviction {
        self.eviction.clone()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("closed", &self.outbox.is_closed())
            .field("evicted", &self.eviction.is_requested())
            .finish()
    }
}

/// Thread-safe set of active connections.
///
/// Handles are keyed by their monotonically allocated id, so iteration order
/// is registration order. The lock is only taken for map operations and is
/// never held across an await point.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<BTreeMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id for a connection that is about to be registered.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Add `handle` to the broadcast targets.
    ///
    /// Registering an id twice is a bug in the caller: it trips a debug
    /// assertion, and release builds keep the entry that was there first.
    pub fn register(&self, handle: ConnectionHandle) {
        let id = handle.id();
        let mut connections = self.lock();
        let duplicate = connections.contains_key(&id);
        debug_assert!(!duplicate, "connection {id} registered twice");
        if duplicate {
            return;
        }
        connections.insert(id, handle);
        debug!(conn_id = %id, active = connections.len(), "connection registered");
    }

    /// Remove the connection with `id`, returning its handle if it was present.
    pub fn deregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let mut connections = self.lock();
        let removed = connections.remove(&id);
        if removed.is_some() {
            debug!(conn_id = %id, active = connections.len(), "connection deregistered");
        }
        removed
    }

    /// Point-in-time copy of every registered handle, in registration order.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Every critical section leaves the map consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, ConnectionHandle>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
