//! Connection identity and the outbound message sink.
//!
//! A [`ConnectionHandle`] is the server-side representative of one client's
//! persistent connection: an opaque identity plus the sink that delivers
//! payloads to that client. The handle owns its sink; it does not know about
//! the registry it may be a member of.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Process-wide sequence so two handles created in the same nanosecond still
/// get distinct identities.
static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
///
/// Two connections from the same client are distinct members; identity is
/// never derived from the remote address or from payload content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{timestamp:x}_{seq:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Errors raised by the underlying transport session on send.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// The seam between the registry and a connection's transport session.
///
/// `send` must not block: implementations hand the payload off to the
/// connection's own writer (the server uses an unbounded channel into a
/// dedicated writer task) and report failure only when the session can no
/// longer accept writes. The sink performs no buffering policy or retry of
/// its own.
pub trait MessageSink: Send + Sync {
    /// Queue a payload for delivery to this connection.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the underlying session cannot accept
    /// the write (closed, broken pipe).
    fn send(&self, payload: &str) -> Result<(), TransportError>;
}

/// One live connection: identity plus outbound sink.
///
/// Handles are cheap to clone; clones share the same sink and compare equal
/// by identity.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sink: Arc<dyn MessageSink>,
}

impl ConnectionHandle {
    /// Create a handle for a live transport session.
    #[must_use]
    pub fn new(id: ConnectionId, sink: Arc<dyn MessageSink>) -> Self {
        Self { id, sink }
    }

    /// Get the connection's identity.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Send a payload to this connection.
    ///
    /// # Errors
    ///
    /// Propagates the sink's [`TransportError`] unchanged.
    pub fn send(&self, payload: &str) -> Result<(), TransportError> {
        self.sink.send(payload)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    impl MessageSink for NullSink {
        fn send(&self, _payload: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[test]
    fn test_handle_identity_survives_clone() {
        let handle = ConnectionHandle::new(ConnectionId::generate(), Arc::new(NullSink));
        let twin = handle.clone();
        assert_eq!(handle.id(), twin.id());
    }
}
