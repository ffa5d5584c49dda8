//! Capped connection registry and hub-wide broadcast.
//!
//! The registry owns the set of active connections and enforces the ceiling
//! on simultaneous membership. It mediates all cross-connection visibility:
//! the transport layer reports lifecycle events into it, and `broadcast`
//! fans a payload out to every current member.

use crate::connection::{ConnectionHandle, ConnectionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Default ceiling on simultaneous connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 500;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The configured connection ceiling has been reached.
    ///
    /// This is a recoverable rejection: the accept layer should refuse the
    /// connection, not tear down the process.
    #[error("Connection limit reached ({0})")]
    CapacityExceeded(usize),
}

/// Outcome of one broadcast.
///
/// `failed` lists the members whose sink rejected the payload. The registry
/// does not evict them itself; the caller may pass each id to
/// [`BroadcastRegistry::leave`] to drop handles whose transport will never
/// report a close of its own.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Number of members whose send succeeded.
    pub delivered: usize,
    /// Members whose send failed.
    pub failed: Vec<ConnectionId>,
}

impl BroadcastReport {
    /// Check whether every recipient accepted the payload.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The connection registry.
///
/// Membership lives in a concurrent map so `broadcast` can iterate while
/// joins and leaves proceed on other tasks. The online counter is reserved
/// with a compare-and-swap loop before the map is touched, so two concurrent
/// joins can never both pass the capacity check.
///
/// Invariant: between operations, `count()` equals the number of members and
/// never exceeds the configured maximum.
pub struct BroadcastRegistry {
    /// Active connections indexed by identity.
    connections: DashMap<ConnectionId, ConnectionHandle>,
    /// Online count; only moves in step with membership.
    online: AtomicUsize,
    /// Configured ceiling.
    max_connections: usize,
}

impl BroadcastRegistry {
    /// Create a registry with the default connection ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_CONNECTIONS)
    }

    /// Create a registry with a specific connection ceiling.
    #[must_use]
    pub fn with_capacity(max_connections: usize) -> Self {
        info!(max_connections, "Creating broadcast registry");
        Self {
            connections: DashMap::new(),
            online: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Current online count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.online.load(Ordering::Acquire)
    }

    /// Configured connection ceiling.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Check whether the registry is at its ceiling.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count() >= self.max_connections
    }

    /// Add a connection to the registry.
    ///
    /// Joining a handle whose identity is already a member is a no-op and
    /// leaves the count unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityExceeded`] when the registry is at
    /// its ceiling. A rejected handle never becomes a member.
    pub fn join(&self, handle: ConnectionHandle) -> Result<(), RegistryError> {
        // Reserve a slot before touching the map; the CAS loop makes the
        // capacity check and the increment a single atomic step.
        let mut current = self.online.load(Ordering::Acquire);
        loop {
            if current >= self.max_connections {
                warn!(
                    connection = %handle.id(),
                    max_connections = self.max_connections,
                    "Join rejected: registry full"
                );
                return Err(RegistryError::CapacityExceeded(self.max_connections));
            }
            match self.online.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        match self.connections.entry(handle.id().clone()) {
            Entry::Occupied(_) => {
                // Already a member: release the reserved slot, keep the
                // original handle.
                self.online.fetch_sub(1, Ordering::AcqRel);
                debug!(connection = %handle.id(), "Join ignored: already a member");
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }

        Ok(())
    }

    /// Remove a connection from the registry.
    ///
    /// Idempotent: leaving a non-member is a no-op. Returns `true` if the
    /// connection was a member. The counter only moves when a removal
    /// actually happened, so it can never underflow.
    pub fn leave(&self, id: &ConnectionId) -> bool {
        if self.connections.remove(id).is_some() {
            self.online.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Send a payload to every current member, including the origin.
    ///
    /// Origin-echo is deliberate: the sender sees its own message come back,
    /// exactly like every other member. Membership is snapshotted up front,
    /// so no shared lock is held while sinks are written and a join or leave
    /// racing the broadcast neither crashes it nor is guaranteed to be seen
    /// by it.
    ///
    /// A failing recipient is logged and skipped; the batch always runs to
    /// completion and nothing is retried.
    pub fn broadcast(&self, payload: &str, origin: &ConnectionId) -> BroadcastReport {
        let recipients: Vec<ConnectionHandle> =
            self.connections.iter().map(|e| e.value().clone()).collect();

        trace!(
            origin = %origin,
            recipients = recipients.len(),
            bytes = payload.len(),
            "Broadcasting"
        );

        let mut report = BroadcastReport::default();
        for handle in &recipients {
            match handle.send(payload) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        connection = %handle.id(),
                        error = %e,
                        "Dropping payload for unreachable connection"
                    );
                    report.failed.push(handle.id().clone());
                }
            }
        }

        report
    }

    // Transport callback surface. The four contracts below are what the
    // transport layer drives on connect, message, close, and error.

    /// A new connection was established.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityExceeded`] when the registry is full;
    /// the transport layer must then refuse the connection rather than treat
    /// it as active.
    pub fn on_connect(&self, handle: ConnectionHandle) -> Result<(), RegistryError> {
        let id = handle.id().clone();
        self.join(handle)?;
        info!(connection = %id, online = self.count(), "Connection joined");
        Ok(())
    }

    /// A member sent a payload: relay it to everyone.
    pub fn on_message(&self, payload: &str, origin: &ConnectionId) -> BroadcastReport {
        debug!(origin = %origin, bytes = payload.len(), "Message received");
        self.broadcast(payload, origin)
    }

    /// A connection closed.
    pub fn on_close(&self, id: &ConnectionId) {
        if self.leave(id) {
            info!(connection = %id, online = self.count(), "Connection left");
        }
    }

    /// The transport reported a fatal error for a connection.
    ///
    /// The handle is evicted here as well as on close: a transport whose
    /// close callback never fires after an error must not leak a stale
    /// member.
    pub fn on_transport_error(&self, id: &ConnectionId, error: &crate::TransportError) {
        error!(connection = %id, error = %error, "Transport error");
        self.on_close(id);
    }
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MessageSink, TransportError};
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    /// Sink that records every payload and can be flipped into a failing
    /// state to simulate a broken connection.
    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<String>>,
        broken: AtomicBool,
    }

    impl RecordingSink {
        fn received(&self) -> Vec<String> {
            self.received.lock().unwrap().clone()
        }

        fn break_pipe(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    impl MessageSink for RecordingSink {
        fn send(&self, payload: &str) -> Result<(), TransportError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionClosed);
            }
            self.received.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    fn member(id: &str) -> (ConnectionHandle, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (
            ConnectionHandle::new(ConnectionId::new(id), sink.clone()),
            sink,
        )
    }

    #[test]
    fn test_count_tracks_membership() {
        let registry = BroadcastRegistry::new();
        assert_eq!(registry.count(), 0);

        let (a, _) = member("a");
        let (b, _) = member("b");
        registry.join(a).unwrap();
        registry.join(b).unwrap();
        assert_eq!(registry.count(), 2);

        assert!(registry.leave(&ConnectionId::new("a")));
        assert_eq!(registry.count(), 1);
        assert!(registry.leave(&ConnectionId::new("b")));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_join_rejected_at_capacity() {
        let registry = BroadcastRegistry::with_capacity(2);

        let (a, _) = member("a");
        let (b, _) = member("b");
        let (c, _) = member("c");
        registry.join(a).unwrap();
        registry.join(b).unwrap();

        assert!(matches!(
            registry.join(c),
            Err(RegistryError::CapacityExceeded(2))
        ));
        assert_eq!(registry.count(), 2);
        assert!(registry.is_full());

        // Rejection is recoverable: a slot freed by a leave can be taken.
        registry.leave(&ConnectionId::new("a"));
        let (c, _) = member("c");
        registry.join(c).unwrap();
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_duplicate_join_is_noop() {
        let registry = BroadcastRegistry::new();

        let (a, _) = member("a");
        let (a_again, _) = member("a");
        registry.join(a).unwrap();
        registry.join(a_again).unwrap();

        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_leave_non_member_is_noop() {
        let registry = BroadcastRegistry::new();

        let (a, _) = member("a");
        registry.join(a).unwrap();

        assert!(!registry.leave(&ConnectionId::new("ghost")));
        assert_eq!(registry.count(), 1);

        // Repeated leaves must not drive the counter negative.
        assert!(registry.leave(&ConnectionId::new("a")));
        assert!(!registry.leave(&ConnectionId::new("a")));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_broadcast_reaches_everyone_including_origin() {
        let registry = BroadcastRegistry::new();

        let (a, sink_a) = member("a");
        let (b, sink_b) = member("b");
        let (c, sink_c) = member("c");
        registry.join(a).unwrap();
        registry.join(b).unwrap();
        registry.join(c).unwrap();

        let report = registry.broadcast("hello", &ConnectionId::new("a"));
        assert_eq!(report.delivered, 3);
        assert!(report.is_complete());

        // Origin-echo: the sender receives its own message.
        assert_eq!(sink_a.received(), vec!["hello"]);
        assert_eq!(sink_b.received(), vec!["hello"]);
        assert_eq!(sink_c.received(), vec!["hello"]);
    }

    #[test]
    fn test_broadcast_survives_partial_failure() {
        let registry = BroadcastRegistry::new();

        let (a, sink_a) = member("a");
        let (b, sink_b) = member("b");
        let (c, sink_c) = member("c");
        registry.join(a).unwrap();
        registry.join(b).unwrap();
        registry.join(c).unwrap();

        sink_b.break_pipe();

        let report = registry.broadcast("hello", &ConnectionId::new("a"));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![ConnectionId::new("b")]);

        assert_eq!(sink_a.received(), vec!["hello"]);
        assert!(sink_b.received().is_empty());
        assert_eq!(sink_c.received(), vec!["hello"]);

        // Broadcast never evicts on its own; the failing member is still in.
        assert_eq!(registry.count(), 3);
    }

    #[test]
    fn test_join_broadcast_leave_scenario() {
        let registry = BroadcastRegistry::new();

        let (a, sink_a) = member("a");
        let (b, sink_b) = member("b");
        registry.join(a).unwrap();
        registry.join(b).unwrap();

        let report = registry.broadcast("hi", &ConnectionId::new("a"));
        assert_eq!(report.delivered, 2);

        registry.leave(&ConnectionId::new("b"));

        let report = registry.broadcast("bye", &ConnectionId::new("a"));
        assert_eq!(report.delivered, 1);

        assert_eq!(sink_a.received(), vec!["hi", "bye"]);
        assert_eq!(sink_b.received(), vec!["hi"]);
    }

    #[test]
    fn test_transport_error_evicts_member() {
        let registry = BroadcastRegistry::new();

        let (a, _) = member("a");
        registry.on_connect(a).unwrap();
        assert_eq!(registry.count(), 1);

        registry.on_transport_error(
            &ConnectionId::new("a"),
            &TransportError::ReceiveFailed("broken pipe".into()),
        );
        assert_eq!(registry.count(), 0);

        // A close arriving afterwards is still a safe no-op.
        registry.on_close(&ConnectionId::new("a"));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_joins_respect_capacity() {
        let registry = Arc::new(BroadcastRegistry::with_capacity(500));

        let mut tasks = Vec::with_capacity(1000);
        for i in 0..1000 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let sink = Arc::new(RecordingSink::default());
                let handle = ConnectionHandle::new(ConnectionId::new(format!("conn-{i}")), sink);
                registry.join(handle).is_ok()
            }));
        }

        let mut accepted = 0;
        let mut rejected = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }

        assert_eq!(accepted, 500);
        assert_eq!(rejected, 500);
        assert_eq!(registry.count(), 500);
    }
}
