//! Connection records and the outbound socket handle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server going away (shutdown, idle eviction).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Policy violation (authentication failure, send queue overflow).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Unexpected server condition.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Process-local connection identifier.
///
/// Allocated monotonically by the registry, so ordering by id equals
/// insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A frame queued for the connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Why an outbound frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The bounded queue is full; the client is not keeping up.
    QueueFull,
    /// The writer task is gone.
    Closed,
}

/// Sending half of a connection's bounded outbound queue.
///
/// The registry holds the only long-lived copy. Dropping it ends the
/// connection's writer task, which closes the socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    sender: mpsc::Sender<OutboundFrame>,
}

impl SocketHandle {
    #[must_use]
    pub fn new(sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self { sender }
    }

    /// Create a handle together with the receiving end of its queue.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Queue a text frame without waiting.
    pub fn send_text(&self, text: String) -> Result<(), SendFailure> {
        self.try_send(OutboundFrame::Text(text))
    }

    /// Queue a close frame without waiting.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), SendFailure> {
        self.try_send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        })
    }

    /// Queue a close frame behind whatever is already queued, waiting for
    /// room if the queue is full.
    pub async fn close_queued(&self, code: u16, reason: &str) -> Result<(), SendFailure> {
        self.sender
            .send(OutboundFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| SendFailure::Closed)
    }

    fn try_send(&self, frame: OutboundFrame) -> Result<(), SendFailure> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Returns true once the writer task has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Initial identity and metadata of a new connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInit {
    pub user_id: Option<String>,
    pub user_type: Option<String>,
    pub claims: Option<Value>,
    pub metadata: HashMap<String, Value>,
}

/// A live connection attached to this worker.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    socket: SocketHandle,
    connected_at: Instant,
    last_activity_at: Instant,
    user_id: Option<String>,
    user_type: Option<String>,
    claims: Option<Value>,
    metadata: HashMap<String, Value>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, socket: SocketHandle, init: ConnectionInit) -> Self {
        let now = Instant::now();
        Self {
            id,
            socket,
            connected_at: now,
            last_activity_at: now,
            user_id: init.user_id,
            user_type: init.user_type,
            claims: init.claims,
            metadata: init.metadata,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn user_type(&self) -> Option<&str> {
        self.user_type.as_deref()
    }

    /// Verified token claims, if the connection authenticated.
    pub fn claims(&self) -> Option<&Value> {
        self.claims.as_ref()
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Queue a text frame on this connection.
    pub fn send_text(&self, text: String) -> Result<(), SendFailure> {
        self.socket.send_text(text)
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    pub(crate) fn set_user_id(&mut self, user_id: Option<String>) {
        self.user_id = user_id;
    }

    pub(crate) fn set_user_type(&mut self, user_type: Option<String>) {
        self.user_type = user_type;
    }

    pub(crate) fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub(crate) fn is_idle(&self, now: Instant, threshold: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_activity_at) >= threshold
    }
}
