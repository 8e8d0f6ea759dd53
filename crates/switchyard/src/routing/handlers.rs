//! Built-in routes: heartbeat, room membership and broadcasts.

use super::context::HandlerContext;
use super::message::WireMessage;
use super::middleware::ValidationMiddleware;
use super::router::{Matcher, MessageHandler, RouterBuilder};
use crate::errors::SwitchyardError;
use crate::relay::BroadcastScope;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Longest accepted room name, in bytes.
pub const MAX_ROOM_NAME_BYTES: usize = 128;

/// Register every built-in route.
#[must_use]
pub fn register_builtin_routes(builder: RouterBuilder) -> RouterBuilder {
    builder
        .route(Matcher::exact("system", "ping"), PingHandler)
        .route(Matcher::exact("room", "join"), JoinRoomHandler)
        .route(Matcher::exact("room", "leave"), LeaveRoomHandler)
        .route(Matcher::exact("room", "broadcast"), RoomBroadcastHandler)
        .route(Matcher::exact("broadcast", "all"), BroadcastAllHandler)
}

/// Validation rules for the built-in routes.
#[must_use]
pub fn builtin_validation(validation: ValidationMiddleware) -> ValidationMiddleware {
    validation
        .require("room", "join", &["room"])
        .require("room", "leave", &["room"])
        .require("room", "broadcast", &["room", "payload"])
        .require("broadcast", "all", &["payload"])
}

fn room_name(message: &WireMessage) -> Result<&str, SwitchyardError> {
    let room = message
        .data_str("room")
        .ok_or_else(|| SwitchyardError::Validation("room must be a string".to_string()))?;
    if room.is_empty() || room.len() > MAX_ROOM_NAME_BYTES {
        return Err(SwitchyardError::Validation(format!(
            "room must be 1 to {MAX_ROOM_NAME_BYTES} bytes"
        )));
    }
    Ok(room)
}

fn sender(ctx: &HandlerContext<'_>) -> Value {
    match ctx.user_id() {
        Some(user_id) => json!({"connection_id": ctx.connection_id(), "user_id": user_id}),
        None => json!({"connection_id": ctx.connection_id()}),
    }
}

/// `system/ping` → `system/pong`.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        _message: &WireMessage,
    ) -> Result<(), SwitchyardError> {
        ctx.reply(WireMessage::new(
            "system",
            "pong",
            json!({"ts": chrono::Utc::now().timestamp_millis()}),
        ));
        Ok(())
    }
}

/// `room/join {room}` → `room/joined {room}`.
pub struct JoinRoomHandler;

#[async_trait]
impl MessageHandler for JoinRoomHandler {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        message: &WireMessage,
    ) -> Result<(), SwitchyardError> {
        let room = room_name(message)?;
        ctx.join(room).await?;
        ctx.reply(WireMessage::new("room", "joined", json!({"room": room})));
        Ok(())
    }
}

/// `room/leave {room}` → `room/left {room}`.
pub struct LeaveRoomHandler;

#[async_trait]
impl MessageHandler for LeaveRoomHandler {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        message: &WireMessage,
    ) -> Result<(), SwitchyardError> {
        let room = room_name(message)?;
        ctx.leave(room).await?;
        ctx.reply(WireMessage::new("room", "left", json!({"room": room})));
        Ok(())
    }
}

/// `room/broadcast {room, payload}`: every other member of the room, on every
/// worker, receives `room/message {room, from, payload}`.
pub struct RoomBroadcastHandler;

#[async_trait]
impl MessageHandler for RoomBroadcastHandler {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        message: &WireMessage,
    ) -> Result<(), SwitchyardError> {
        let room = room_name(message)?;
        if !ctx.is_member(room) {
            return Err(SwitchyardError::Validation(format!("not a member of {room}")));
        }

        let payload = message.data.get("payload").cloned().unwrap_or(Value::Null);
        let outbound = WireMessage::new(
            "room",
            "message",
            json!({"room": room, "from": sender(ctx), "payload": payload}),
        );
        ctx.broadcast(BroadcastScope::Room(room.to_string()), outbound, true)
            .await?;
        Ok(())
    }
}

/// `broadcast/all {payload}`: every connection on every worker, the sender
/// included, receives `broadcast/message {from, payload}`.
pub struct BroadcastAllHandler;

#[async_trait]
impl MessageHandler for BroadcastAllHandler {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        message: &WireMessage,
    ) -> Result<(), SwitchyardError> {
        let payload = message.data.get("payload").cloned().unwrap_or(Value::Null);
        let outbound = WireMessage::new(
            "broadcast",
            "message",
            json!({"from": sender(ctx), "payload": payload}),
        );
        ctx.broadcast(BroadcastScope::All, outbound, false).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::registry::{
        ConnectionId, ConnectionInit, ConnectionRegistry, OutboundFrame, SocketHandle,
    };
    use crate::relay::{BroadcastRelay, BusReceiver, ChannelNames, MemoryBroker};
    use crate::routing::{MessageRouter, RecoveryMiddleware};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Worker {
        broker: MemoryBroker,
        registry: ConnectionRegistry,
        relay: BroadcastRelay,
        bus_rx: BusReceiver,
        router: MessageRouter,
    }

    impl Worker {
        fn new() -> Self {
            let broker = MemoryBroker::new();
            let (bus, bus_rx) = broker.connect();
            let relay = BroadcastRelay::new(Arc::new(bus), ChannelNames::new("t:"), "w1");
            let router = register_builtin_routes(RouterBuilder::new())
                .middleware(builtin_validation(ValidationMiddleware::new()))
                .middleware(RecoveryMiddleware)
                .build();
            Self {
                broker,
                registry: ConnectionRegistry::new(),
                relay,
                bus_rx,
                router,
            }
        }

        fn connect(&mut self) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
            let id = self.registry.allocate_id();
            let (socket, rx) = SocketHandle::channel(16);
            self.registry.add(id, socket, ConnectionInit::default()).unwrap();
            (id, rx)
        }

        async fn send(&mut self, id: ConnectionId, raw: &str) {
            let mut ctx = HandlerContext::new(id, &mut self.registry, &self.relay);
            self.router.dispatch(&mut ctx, raw).await;
        }
    }

    fn next_message(rx: &mut mpsc::Receiver<OutboundFrame>) -> WireMessage {
        match rx.try_recv().unwrap() {
            OutboundFrame::Text(text) => WireMessage::parse(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_replies_pong() {
        let mut worker = Worker::new();
        let (id, mut rx) = worker.connect();

        worker.send(id, r#"{"type":"system","action":"ping"}"#).await;

        let reply = next_message(&mut rx);
        assert_eq!((reply.kind.as_str(), reply.action.as_str()), ("system", "pong"));
        assert!(reply.data.get("ts").is_some());
    }

    #[tokio::test]
    async fn test_join_subscribes_room_channel_and_leave_unsubscribes() {
        let mut worker = Worker::new();
        let (id, mut rx) = worker.connect();

        worker
            .send(id, r#"{"type":"room","action":"join","data":{"room":"lobby"}}"#)
            .await;
        assert_eq!(next_message(&mut rx).action, "joined");
        assert!(worker.registry.rooms().is_local_member(id, "lobby"));
        assert_eq!(worker.broker.subscriber_count("t:room:lobby"), 1);

        worker
            .send(id, r#"{"type":"room","action":"leave","data":{"room":"lobby"}}"#)
            .await;
        assert_eq!(next_message(&mut rx).action, "left");
        assert_eq!(worker.registry.rooms().room_count(), 0);
        assert_eq!(worker.broker.subscriber_count("t:room:lobby"), 0);
    }

    #[tokio::test]
    async fn test_join_without_room_is_rejected() {
        let mut worker = Worker::new();
        let (id, mut rx) = worker.connect();

        worker.send(id, r#"{"type":"room","action":"join","data":{}}"#).await;

        let reply = next_message(&mut rx);
        assert_eq!(reply.kind, "error");
        assert_eq!(reply.action, "invalid_message");
        assert_eq!(worker.registry.rooms().room_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_room_name_is_rejected_by_recovery() {
        let mut worker = Worker::new();
        let (id, mut rx) = worker.connect();
        let long = "r".repeat(MAX_ROOM_NAME_BYTES + 1);

        worker
            .send(
                id,
                &format!(r#"{{"type":"room","action":"join","data":{{"room":"{long}"}}}}"#),
            )
            .await;

        let reply = next_message(&mut rx);
        assert_eq!(reply.action, "invalid_message");
    }

    #[tokio::test]
    async fn test_room_broadcast_publishes_envelope_excluding_sender() {
        let mut worker = Worker::new();
        let (id, mut rx) = worker.connect();
        worker
            .send(id, r#"{"type":"room","action":"join","data":{"room":"lobby"}}"#)
            .await;
        let _joined = next_message(&mut rx);

        worker
            .send(
                id,
                &json!({
                    "type": "room",
                    "action": "broadcast",
                    "data": {"room": "lobby", "payload": {"text": "hi"}}
                })
                .to_string(),
            )
            .await;

        let bus_message = worker.bus_rx.recv().await.unwrap();
        assert_eq!(bus_message.channel, "t:room:lobby");
        let envelope = worker.relay.decode(&bus_message).unwrap();
        assert_eq!(envelope.except, Some(id));
        assert_eq!(envelope.payload.action, "message");
        assert_eq!(envelope.payload.data["payload"], json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn test_room_broadcast_requires_membership() {
        let mut worker = Worker::new();
        let (id, mut rx) = worker.connect();

        worker
            .send(
                id,
                r#"{"type":"room","action":"broadcast","data":{"room":"lobby","payload":1}}"#,
            )
            .await;

        let reply = next_message(&mut rx);
        assert_eq!(reply.action, "invalid_message");
        assert_eq!(reply.data["message"], "not a member of lobby");
    }
}
