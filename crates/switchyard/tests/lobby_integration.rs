//! Cross-worker rooms and broadcasts.
//!
//! Two worker hubs share one in-memory bus, standing in for two worker
//! processes on one Redis.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;

use serde_json::json;
use switchyard::actors::{HubConfig, WorkerHub, WorkerHubHandle};
use switchyard::auth::AuthContext;
use switchyard::registry::ConnectionId;
use switchyard::relay::{BroadcastScope, CustomScopes, MemoryBroker};
use switchyard::routing::{
    builtin_validation, register_builtin_routes, MessageRouter, RecoveryMiddleware,
    ValidationMiddleware, WireMessage,
};
use switchyard_test_utils::{TestSocket, TestTokenBuilder};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestWorker {
    hub: WorkerHubHandle,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl TestWorker {
    fn spawn(broker: &MemoryBroker, worker_id: &str, custom_scopes: CustomScopes) -> Self {
        let (bus, bus_receiver) = broker.connect();
        let router = register_builtin_routes(
            MessageRouter::builder()
                .middleware(builtin_validation(ValidationMiddleware::new()))
                .middleware(RecoveryMiddleware),
        )
        .build();
        let cancel = CancellationToken::new();
        let (hub, task) = WorkerHub::spawn(
            HubConfig::new(worker_id),
            router,
            Arc::new(bus),
            bus_receiver,
            custom_scopes,
            cancel.clone(),
        );
        Self { hub, task, cancel }
    }

    async fn connect(&self, user: &str, user_type: &str) -> (ConnectionId, TestSocket) {
        let claims = TestTokenBuilder::new()
            .for_user(user)
            .with_user_type(user_type)
            .claims();
        let auth = AuthContext {
            user_id: user.to_string(),
            user_type: Some(user_type.to_string()),
            claims,
        };
        let mut socket = TestSocket::new(32);
        let id = self.hub.connect(socket.take_handle(), Some(auth)).await.unwrap();
        (id, socket)
    }

    async fn send(&self, id: ConnectionId, kind: &str, action: &str, data: serde_json::Value) {
        let text = serde_json::to_string(&WireMessage::new(kind, action, data)).unwrap();
        self.hub.inbound(id, text).await.unwrap();
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.task.await.unwrap();
    }
}

async fn join(worker: &TestWorker, id: ConnectionId, socket: &mut TestSocket, room: &str) {
    worker.send(id, "room", "join", json!({"room": room})).await;
    let reply = socket.next_message().await;
    assert_eq!((reply.kind.as_str(), reply.action.as_str()), ("room", "joined"));
}

fn marker() -> WireMessage {
    WireMessage::new("test", "marker", json!({}))
}

#[tokio::test]
async fn test_lobby_broadcast_reaches_members_on_other_worker() {
    let broker = MemoryBroker::new();
    let w1 = TestWorker::spawn(&broker, "node-w1", CustomScopes::new());
    let w2 = TestWorker::spawn(&broker, "node-w2", CustomScopes::new());

    let (alice, mut alice_socket) = w1.connect("alice", "member").await;
    let (bob, mut bob_socket) = w2.connect("bob", "member").await;
    let (_carol, mut carol_socket) = w2.connect("carol", "member").await;

    join(&w1, alice, &mut alice_socket, "lobby").await;
    join(&w2, bob, &mut bob_socket, "lobby").await;

    w1.send(
        alice,
        "room",
        "broadcast",
        json!({"room": "lobby", "payload": "hello"}),
    )
    .await;

    let received = bob_socket.next_message().await;
    assert_eq!(received.kind, "room");
    assert_eq!(received.action, "message");
    assert_eq!(received.data["room"], "lobby");
    assert_eq!(received.data["payload"], "hello");
    assert_eq!(received.data["from"]["user_id"], "alice");

    // A broadcast to everyone, published after the room message, is the next
    // thing every connection sees: the sender and non-members got nothing.
    w2.hub.publish(BroadcastScope::All, marker()).await.unwrap();
    assert_eq!(alice_socket.next_message().await, marker());
    assert_eq!(carol_socket.next_message().await, marker());
    assert_eq!(bob_socket.next_message().await, marker());

    assert_eq!(w1.hub.room_members("lobby").await.unwrap(), vec![alice]);
    assert_eq!(w2.hub.room_members("lobby").await.unwrap(), vec![bob]);

    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
async fn test_lobby_broadcast_reaches_members_on_both_workers() {
    let broker = MemoryBroker::new();
    let w1 = TestWorker::spawn(&broker, "node-w1", CustomScopes::new());
    let w2 = TestWorker::spawn(&broker, "node-w2", CustomScopes::new());

    let (alice, mut alice_socket) = w1.connect("alice", "member").await;
    let (dave, mut dave_socket) = w1.connect("dave", "member").await;
    let (_eve, mut eve_socket) = w1.connect("eve", "member").await;
    let (bob, mut bob_socket) = w2.connect("bob", "member").await;

    join(&w1, alice, &mut alice_socket, "lobby").await;
    join(&w1, dave, &mut dave_socket, "lobby").await;
    join(&w2, bob, &mut bob_socket, "lobby").await;

    w1.send(
        alice,
        "room",
        "broadcast",
        json!({"room": "lobby", "payload": "hello lobby"}),
    )
    .await;

    // Members on the sending worker are delivered through the same bus
    // subscription as members elsewhere.
    for socket in [&mut dave_socket, &mut bob_socket] {
        let received = socket.next_message().await;
        assert_eq!(received.action, "message");
        assert_eq!(received.data["payload"], "hello lobby");
        assert_eq!(received.data["from"]["user_id"], "alice");
    }

    w2.hub.publish(BroadcastScope::All, marker()).await.unwrap();
    assert_eq!(alice_socket.next_message().await, marker());
    assert_eq!(eve_socket.next_message().await, marker());
    assert_eq!(dave_socket.next_message().await, marker());
    assert_eq!(bob_socket.next_message().await, marker());

    let mut w1_members = w1.hub.room_members("lobby").await.unwrap();
    w1_members.sort();
    let mut expected = vec![alice, dave];
    expected.sort();
    assert_eq!(w1_members, expected);

    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
async fn test_room_channel_follows_local_membership() {
    let broker = MemoryBroker::new();
    let w1 = TestWorker::spawn(&broker, "node-w1", CustomScopes::new());
    let w2 = TestWorker::spawn(&broker, "node-w2", CustomScopes::new());
    let channel = "switchyard:room:lobby";

    let (alice, mut alice_socket) = w1.connect("alice", "member").await;
    let (bob, mut bob_socket) = w2.connect("bob", "member").await;
    assert_eq!(broker.subscriber_count(channel), 0);

    join(&w1, alice, &mut alice_socket, "lobby").await;
    join(&w2, bob, &mut bob_socket, "lobby").await;
    assert_eq!(broker.subscriber_count(channel), 2);

    // Disconnect cascades to the room; the emptied room drops its channel.
    w2.hub
        .disconnect(bob, switchyard::actors::DisconnectReason::Requested)
        .await
        .unwrap();
    assert!(w2.hub.room_members("lobby").await.unwrap().is_empty());
    assert_eq!(broker.subscriber_count(channel), 1);
    assert!(bob_socket.is_closed().await);

    w1.send(alice, "room", "leave", json!({"room": "lobby"})).await;
    let reply = alice_socket.next_message().await;
    assert_eq!(reply.action, "left");
    assert_eq!(broker.subscriber_count(channel), 0);

    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
async fn test_custom_scope_filters_recipients_on_every_worker() {
    let broker = MemoryBroker::new();
    let scopes = || {
        let mut scopes = CustomScopes::new();
        scopes.insert("members", |conn, _| conn.user_type() == Some("member"));
        scopes
    };
    let w1 = TestWorker::spawn(&broker, "node-w1", scopes());
    let w2 = TestWorker::spawn(&broker, "node-w2", scopes());

    let (_alice, mut alice_socket) = w1.connect("alice", "member").await;
    let (_guest, mut guest_socket) = w1.connect("gus", "guest").await;
    let (_bob, mut bob_socket) = w2.connect("bob", "member").await;

    let notice = WireMessage::new("notice", "members", json!({"text": "members only"}));
    w1.hub
        .publish(BroadcastScope::Custom("members".to_string()), notice.clone())
        .await
        .unwrap();
    w1.hub.publish(BroadcastScope::All, marker()).await.unwrap();

    assert_eq!(alice_socket.next_message().await, notice);
    assert_eq!(bob_socket.next_message().await, notice);
    assert_eq!(guest_socket.next_message().await, marker());

    w1.stop().await;
    w2.stop().await;
}

#[tokio::test]
async fn test_bus_outage_reports_error_to_sender() {
    let broker = MemoryBroker::new();
    let w1 = TestWorker::spawn(&broker, "node-w1", CustomScopes::new());

    let (alice, mut alice_socket) = w1.connect("alice", "member").await;
    join(&w1, alice, &mut alice_socket, "lobby").await;

    broker.set_unavailable(true);
    w1.send(
        alice,
        "room",
        "broadcast",
        json!({"room": "lobby", "payload": "lost"}),
    )
    .await;

    let reply = alice_socket.next_message().await;
    assert_eq!(reply.kind, "error");

    // The worker keeps serving the connection.
    broker.set_unavailable(false);
    w1.send(alice, "system", "ping", json!({})).await;
    assert_eq!(alice_socket.next_message().await.action, "pong");

    w1.stop().await;
}

#[tokio::test]
async fn test_stopping_hub_closes_connections_with_going_away() {
    let broker = MemoryBroker::new();
    let w1 = TestWorker::spawn(&broker, "node-w1", CustomScopes::new());
    let (_alice, mut alice_socket) = w1.connect("alice", "member").await;

    w1.stop().await;

    let (code, _reason) = alice_socket.next_close().await;
    assert_eq!(code, 1001);
}
