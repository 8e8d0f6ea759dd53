//! Message types for worker hub communication.
//!
//! Socket tasks and the HTTP layer talk to the hub exclusively through
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use crate::auth::AuthContext;
use crate::errors::SwitchyardError;
use crate::registry::{ConnectionId, SocketHandle};
use crate::relay::BroadcastScope;
use crate::routing::WireMessage;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket or the read side failed.
    SocketClosed,
    /// The outbound queue overflowed.
    SendQueueOverflow,
    /// No inbound traffic within the idle threshold.
    IdleTimeout,
    /// Closed by the worker during shutdown.
    Shutdown,
    /// Removed by an application call.
    Requested,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::SocketClosed => "socket_closed",
            DisconnectReason::SendQueueOverflow => "send_queue_overflow",
            DisconnectReason::IdleTimeout => "idle_timeout",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Requested => "requested",
        }
    }
}

/// Messages sent to the `WorkerHub`.
#[derive(Debug)]
pub enum HubMessage {
    /// Register an authenticated (or anonymous) socket.
    Connect {
        socket: SocketHandle,
        auth: Option<AuthContext>,
        respond_to: oneshot::Sender<Result<ConnectionId, SwitchyardError>>,
    },

    /// A text frame read from a connection.
    Inbound { id: ConnectionId, text: String },

    /// Remove a connection.
    Disconnect {
        id: ConnectionId,
        reason: DisconnectReason,
    },

    /// Publish a broadcast originating on this worker.
    Publish {
        scope: BroadcastScope,
        payload: WireMessage,
        respond_to: oneshot::Sender<Result<Uuid, SwitchyardError>>,
    },

    /// Send a message to one local connection.
    SendTo {
        id: ConnectionId,
        message: WireMessage,
        respond_to: oneshot::Sender<Result<(), SwitchyardError>>,
    },

    /// Current registry counts (for health checks and tests).
    GetStats {
        respond_to: oneshot::Sender<HubStats>,
    },

    /// Local members of a room, in id order.
    RoomMembers {
        room: String,
        respond_to: oneshot::Sender<Vec<ConnectionId>>,
    },

    /// Stop accepting connections and close every open one.
    CloseAll {
        code: u16,
        reason: String,
        /// Number of connections closed.
        respond_to: oneshot::Sender<usize>,
    },
}

/// Snapshot of a hub's local state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub worker_id: String,
    pub connections: usize,
    pub rooms: usize,
    pub accepting: bool,
}
