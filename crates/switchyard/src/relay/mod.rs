//! Cross-worker broadcast relay.
//!
//! A broadcast is published once on the bus channel for its scope. Every
//! worker subscribed to that channel (the origin included) receives the
//! envelope and delivers it to its own local connections; no worker ever
//! writes to another worker's sockets.
//!
//! Subscriptions follow local interest: the all-channel and every configured
//! custom channel are subscribed at start, a room channel only while the room
//! has local members.

mod bus;
mod envelope;
mod memory;
mod redis_bus;

pub use bus::{BusMessage, BusReceiver, MessageBus};
pub use envelope::{
    BroadcastEnvelope, BroadcastScope, ChannelNames, RecentEnvelopes, DEFAULT_DEDUPE_WINDOW,
};
pub use memory::{MemoryBroker, MemoryBus};
pub use redis_bus::RedisBus;

use crate::errors::SwitchyardError;
use crate::observability::metrics;
use crate::registry::{Connection, ConnectionId, ConnectionRegistry};
use crate::routing::WireMessage;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Predicate selecting the local recipients of a custom scope.
pub type ScopeFilter = Arc<dyn Fn(&Connection, &WireMessage) -> bool + Send + Sync>;

/// Named custom broadcast scopes.
#[derive(Clone, Default)]
pub struct CustomScopes {
    filters: HashMap<String, ScopeFilter>,
}

impl CustomScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the filter for `name`.
    pub fn insert<F>(&mut self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Connection, &WireMessage) -> bool + Send + Sync + 'static,
    {
        self.filters.insert(name.into(), Arc::new(filter));
    }

    pub fn get(&self, name: &str) -> Option<&ScopeFilter> {
        self.filters.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.filters.keys().map(String::as_str)
    }
}

impl fmt::Debug for CustomScopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomScopes")
            .field("names", &self.filters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Local recipients of `envelope` on `worker_id`, in registry order.
///
/// Room scopes yield local room members only; `All` yields every local
/// connection; custom scopes yield connections accepted by their filter (an
/// unknown custom scope yields nobody).
pub fn local_recipients(
    registry: &ConnectionRegistry,
    envelope: &BroadcastEnvelope,
    worker_id: &str,
    custom_scopes: &CustomScopes,
) -> Vec<ConnectionId> {
    let candidates: Vec<ConnectionId> = match &envelope.scope {
        BroadcastScope::All => registry.list().map(Connection::id).collect(),
        BroadcastScope::Room(room) => registry.rooms().local_members(room).collect(),
        BroadcastScope::Custom(name) => match custom_scopes.get(name) {
            Some(filter) => registry
                .list()
                .filter(|conn| filter(conn, &envelope.payload))
                .map(Connection::id)
                .collect(),
            None => {
                warn!(
                    target: "sy.relay",
                    scope = %name,
                    "Envelope for unknown custom scope dropped"
                );
                Vec::new()
            }
        },
    };

    candidates
        .into_iter()
        .filter(|id| !envelope.excludes(worker_id, *id))
        .collect()
}

/// Publishing side of the relay plus subscription bookkeeping.
pub struct BroadcastRelay {
    bus: Arc<dyn MessageBus>,
    channels: ChannelNames,
    worker_id: String,
}

impl BroadcastRelay {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        channels: ChannelNames,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            channels,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    pub fn is_healthy(&self) -> bool {
        self.bus.is_healthy()
    }

    /// Serialize `envelope` once and publish it on its scope's channel.
    ///
    /// # Errors
    ///
    /// `BroadcastDelivery` if the bus rejects the publish.
    pub async fn publish(&self, envelope: &BroadcastEnvelope) -> Result<(), SwitchyardError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| SwitchyardError::Internal(format!("failed to encode envelope: {e}")))?;
        let channel = self.channels.for_scope(&envelope.scope);
        let scope = envelope.scope.label();

        match self.bus.publish(&channel, &payload).await {
            Ok(()) => {
                debug!(
                    target: "sy.relay",
                    envelope_id = %envelope.id,
                    channel = %channel,
                    "Broadcast published"
                );
                metrics::record_broadcast_published(scope, true);
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "sy.relay",
                    envelope_id = %envelope.id,
                    channel = %channel,
                    error = %e,
                    "Broadcast publish failed"
                );
                metrics::record_broadcast_published(scope, false);
                Err(SwitchyardError::BroadcastDelivery(e.to_string()))
            }
        }
    }

    /// Build and publish an envelope originating on this worker.
    ///
    /// # Errors
    ///
    /// See [`BroadcastRelay::publish`].
    pub async fn broadcast(
        &self,
        scope: BroadcastScope,
        payload: WireMessage,
        except: Option<ConnectionId>,
    ) -> Result<Uuid, SwitchyardError> {
        let mut envelope = BroadcastEnvelope::new(scope, payload, &self.worker_id);
        envelope.except = except;
        self.publish(&envelope).await?;
        Ok(envelope.id)
    }

    /// Subscribe to the all-channel and every custom scope channel.
    ///
    /// # Errors
    ///
    /// Returns the first subscription failure.
    pub async fn subscribe_defaults<'a>(
        &self,
        custom_scopes: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), SwitchyardError> {
        self.bus.subscribe(&self.channels.all()).await?;
        for name in custom_scopes {
            self.bus.subscribe(&self.channels.custom(name)).await?;
        }
        Ok(())
    }

    /// Subscribe to a room's channel (the room was just created locally).
    pub async fn subscribe_room(&self, room: &str) -> Result<(), SwitchyardError> {
        self.bus.subscribe(&self.channels.room(room)).await
    }

    /// Unsubscribe from a room's channel (the room was just deleted locally).
    pub async fn unsubscribe_room(&self, room: &str) -> Result<(), SwitchyardError> {
        self.bus.unsubscribe(&self.channels.room(room)).await
    }

    /// Decode an inbound bus message.
    ///
    /// # Errors
    ///
    /// `Internal` if the payload is not a valid envelope.
    pub fn decode(&self, message: &BusMessage) -> Result<BroadcastEnvelope, SwitchyardError> {
        serde_json::from_str(&message.payload).map_err(|e| {
            SwitchyardError::Internal(format!(
                "invalid envelope on channel {}: {e}",
                message.channel
            ))
        })
    }
}

impl fmt::Debug for BroadcastRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastRelay")
            .field("worker_id", &self.worker_id)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionInit, OutboundFrame, SocketHandle};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct Fixture {
        registry: ConnectionRegistry,
        ids: Vec<ConnectionId>,
        _receivers: Vec<mpsc::Receiver<OutboundFrame>>,
    }

    fn registry_with(count: usize) -> Fixture {
        let mut registry = ConnectionRegistry::new();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..count {
            let id = registry.allocate_id();
            let (socket, rx) = SocketHandle::channel(8);
            registry.add(id, socket, ConnectionInit::default()).unwrap();
            ids.push(id);
            receivers.push(rx);
        }
        Fixture {
            registry,
            ids,
            _receivers: receivers,
        }
    }

    fn payload() -> WireMessage {
        WireMessage::new("room", "message", json!({"text": "hi"}))
    }

    #[test]
    fn test_room_scope_reaches_local_members_only() {
        let Fixture {
            mut registry,
            ids,
            _receivers,
        } = registry_with(3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        registry.join_room(a, "lobby").unwrap();
        registry.join_room(c, "lobby").unwrap();
        registry.join_room(b, "other").unwrap();

        let envelope =
            BroadcastEnvelope::new(BroadcastScope::Room("lobby".to_string()), payload(), "w1");
        let recipients = local_recipients(&registry, &envelope, "w1", &CustomScopes::new());

        assert_eq!(recipients, vec![a, c]);
    }

    #[test]
    fn test_all_scope_in_registry_order_with_exclusion() {
        let Fixture {
            registry,
            ids,
            _receivers,
        } = registry_with(3);
        let envelope =
            BroadcastEnvelope::new(BroadcastScope::All, payload(), "w1").excluding(ids[1]);

        let on_origin = local_recipients(&registry, &envelope, "w1", &CustomScopes::new());
        assert_eq!(on_origin, vec![ids[0], ids[2]]);

        let elsewhere = local_recipients(&registry, &envelope, "w2", &CustomScopes::new());
        assert_eq!(elsewhere, ids);
    }

    #[test]
    fn test_custom_scope_uses_filter() {
        let Fixture {
            mut registry,
            ids,
            _receivers,
        } = registry_with(2);
        registry.update_field(ids[1], "user_type", json!("admin")).unwrap();

        let mut scopes = CustomScopes::new();
        scopes.insert("admins", |conn: &Connection, _: &WireMessage| {
            conn.user_type() == Some("admin")
        });

        let envelope =
            BroadcastEnvelope::new(BroadcastScope::Custom("admins".to_string()), payload(), "w1");
        assert_eq!(local_recipients(&registry, &envelope, "w1", &scopes), vec![ids[1]]);

        let unknown =
            BroadcastEnvelope::new(BroadcastScope::Custom("nobody".to_string()), payload(), "w1");
        assert!(local_recipients(&registry, &unknown, "w1", &scopes).is_empty());
    }

    #[tokio::test]
    async fn test_publish_uses_scope_channel() {
        let broker = MemoryBroker::new();
        let (bus, _own_rx) = broker.connect();
        let (listener, mut listener_rx) = broker.connect();
        listener.subscribe("sy:room:lobby").await.unwrap();

        let relay = BroadcastRelay::new(Arc::new(bus), ChannelNames::new("sy:"), "w1");
        let id = relay
            .broadcast(BroadcastScope::Room("lobby".to_string()), payload(), None)
            .await
            .unwrap();

        let message = listener_rx.recv().await.unwrap();
        assert_eq!(message.channel, "sy:room:lobby");
        let envelope = relay.decode(&message).unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!(envelope.origin_worker_id, "w1");
    }

    #[tokio::test]
    async fn test_room_subscription_follows_local_interest() {
        let broker = MemoryBroker::new();
        let (bus, _rx) = broker.connect();
        let relay = BroadcastRelay::new(Arc::new(bus), ChannelNames::new("sy:"), "w1");

        relay.subscribe_defaults(["admins"]).await.unwrap();
        assert_eq!(broker.subscriber_count("sy:broadcast-all"), 1);
        assert_eq!(broker.subscriber_count("sy:custom:admins"), 1);

        relay.subscribe_room("lobby").await.unwrap();
        assert_eq!(broker.subscriber_count("sy:room:lobby"), 1);
        relay.unsubscribe_room("lobby").await.unwrap();
        assert_eq!(broker.subscriber_count("sy:room:lobby"), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_broadcast_delivery_error() {
        let broker = MemoryBroker::new();
        let (bus, _rx) = broker.connect();
        let relay = BroadcastRelay::new(Arc::new(bus), ChannelNames::new("sy:"), "w1");

        broker.set_unavailable(true);
        let result = relay.broadcast(BroadcastScope::All, payload(), None).await;
        assert!(matches!(result, Err(SwitchyardError::BroadcastDelivery(_))));
        assert!(!relay.is_healthy());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let broker = MemoryBroker::new();
        let (bus, _rx) = broker.connect();
        let relay = BroadcastRelay::new(Arc::new(bus), ChannelNames::new("sy:"), "w1");

        let message = BusMessage {
            channel: "sy:broadcast-all".to_string(),
            payload: Value::Null.to_string(),
        };
        assert!(relay.decode(&message).is_err());
    }
}
