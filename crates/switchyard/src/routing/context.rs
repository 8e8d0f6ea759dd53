//! Per-dispatch handler context.

use super::message::WireMessage;
use crate::errors::SwitchyardError;
use crate::registry::{
    Connection, ConnectionId, ConnectionRegistry, JoinOutcome, LeaveOutcome, SendFailure,
};
use crate::relay::{BroadcastRelay, BroadcastScope};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// Gives a handler access to the worker's registry, rooms and relay for the
/// duration of one dispatch.
///
/// Sends never block. Connections whose queue overflowed are collected and
/// disconnected by the hub once the dispatch has finished.
pub struct HandlerContext<'a> {
    connection_id: ConnectionId,
    registry: &'a mut ConnectionRegistry,
    relay: &'a BroadcastRelay,
    overflowed: Vec<ConnectionId>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        connection_id: ConnectionId,
        registry: &'a mut ConnectionRegistry,
        relay: &'a BroadcastRelay,
    ) -> Self {
        Self {
            connection_id,
            registry,
            relay,
            overflowed: Vec::new(),
        }
    }

    /// The connection that sent the frame.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.registry.get(self.connection_id)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.connection().and_then(Connection::user_id)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.registry
    }

    pub fn worker_id(&self) -> &str {
        self.relay.worker_id()
    }

    /// Send a message to the origin connection.
    pub fn reply(&mut self, message: WireMessage) {
        let id = self.connection_id;
        if let Err(e) = self.send_to(id, &message) {
            debug!(target: "sy.router", connection_id = %id, error = %e, "Reply not delivered");
        }
    }

    /// Send the client-safe form of `error` to the origin connection.
    pub fn reply_error(&mut self, error: &SwitchyardError) {
        self.reply(WireMessage::from_error(error));
    }

    /// Send a message to a local connection.
    ///
    /// # Errors
    ///
    /// `ConnectionNotFound` for unknown or closed connections, `SendQueueFull`
    /// when the connection's queue overflowed (it will be disconnected).
    pub fn send_to(
        &mut self,
        id: ConnectionId,
        message: &WireMessage,
    ) -> Result<(), SwitchyardError> {
        let text = message.to_json()?;
        let connection = self
            .registry
            .get(id)
            .ok_or(SwitchyardError::ConnectionNotFound(id))?;

        match connection.send_text(text) {
            Ok(()) => Ok(()),
            Err(SendFailure::QueueFull) => {
                warn!(target: "sy.router", connection_id = %id, "Send queue overflow");
                if !self.overflowed.contains(&id) {
                    self.overflowed.push(id);
                }
                Err(SwitchyardError::SendQueueFull(id))
            }
            Err(SendFailure::Closed) => Err(SwitchyardError::ConnectionNotFound(id)),
        }
    }

    /// Join the origin connection to `room`, subscribing the worker to the
    /// room channel when the room is created locally.
    ///
    /// # Errors
    ///
    /// `ConnectionNotFound` if the connection is gone. A failed bus
    /// subscription is logged, not returned: local members still see local
    /// broadcasts.
    pub async fn join(&mut self, room: &str) -> Result<JoinOutcome, SwitchyardError> {
        let outcome = self.registry.join_room(self.connection_id, room)?;
        if outcome.room_created() {
            if let Err(e) = self.relay.subscribe_room(room).await {
                warn!(target: "sy.router", room = %room, error = %e, "Room subscription failed");
            }
        }
        Ok(outcome)
    }

    /// Remove the origin connection from `room`, unsubscribing when the room
    /// is deleted locally.
    ///
    /// # Errors
    ///
    /// `ConnectionNotFound` if the connection is gone.
    pub async fn leave(&mut self, room: &str) -> Result<LeaveOutcome, SwitchyardError> {
        let outcome = self.registry.leave_room(self.connection_id, room)?;
        if outcome.room_removed() {
            if let Err(e) = self.relay.unsubscribe_room(room).await {
                warn!(target: "sy.router", room = %room, error = %e, "Room unsubscribe failed");
            }
        }
        Ok(outcome)
    }

    pub fn is_member(&self, room: &str) -> bool {
        self.registry.rooms().is_local_member(self.connection_id, room)
    }

    /// Publish a broadcast, optionally excluding the origin connection.
    ///
    /// # Errors
    ///
    /// `BroadcastDelivery` if the bus publish fails.
    pub async fn broadcast(
        &mut self,
        scope: BroadcastScope,
        payload: WireMessage,
        exclude_self: bool,
    ) -> Result<Uuid, SwitchyardError> {
        let except = exclude_self.then_some(self.connection_id);
        self.relay.broadcast(scope, payload, except).await
    }

    /// Update a field of the origin connection.
    ///
    /// # Errors
    ///
    /// See [`ConnectionRegistry::update_field`].
    pub fn set_field(&mut self, key: &str, value: Value) -> Result<(), SwitchyardError> {
        self.registry.update_field(self.connection_id, key, value)
    }

    /// Connections whose queue overflowed during this dispatch.
    pub fn take_overflowed(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.overflowed)
    }
}
