//! End-to-end tests: real workers, real sockets.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use switchyard::config::Config;
use switchyard::lifecycle::LifecyclePhase;
use switchyard::relay::MemoryBroker;
use switchyard::routing::{Matcher, WireMessage};
use switchyard::worker::{RunningWorker, WorkerBuilder};
use switchyard_test_utils::{RecordingHandler, TestTokenBuilder, WsTestClient, TEST_JWT_SECRET};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn config(worker_id: usize) -> Config {
    let vars = HashMap::from([
        ("SWITCHYARD_JWT_SECRET".to_string(), TEST_JWT_SECRET.to_string()),
        ("SWITCHYARD_WORKER_COUNT".to_string(), "1".to_string()),
        ("SWITCHYARD_WORKER_ID".to_string(), worker_id.to_string()),
        ("SWITCHYARD_NODE_ID".to_string(), "e2e".to_string()),
        ("SWITCHYARD_SHUTDOWN_TIMEOUT_MS".to_string(), "2000".to_string()),
    ]);
    Config::from_vars(&vars).unwrap()
}

async fn start_worker(builder: WorkerBuilder) -> RunningWorker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    builder.listener(listener).start().await.unwrap()
}

fn ws_url(worker: &RunningWorker, user: &str) -> String {
    let token = TestTokenBuilder::new().for_user(user).sign(TEST_JWT_SECRET);
    format!("ws://{}/ws?token={token}", worker.local_addr())
}

async fn http_get(worker: &RunningWorker, path: &str) -> String {
    let mut stream = TcpStream::connect(worker.local_addr()).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_missing_token_closes_with_policy_violation() {
    let worker = start_worker(WorkerBuilder::new(config(0))).await;

    let mut client = WsTestClient::connect(&format!("ws://{}/ws", worker.local_addr())).await;
    let (code, reason) = client.recv_close().await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "authentication failed");

    assert_eq!(worker.hub().stats().await.unwrap().connections, 0);
    worker.shutdown().await;
}

#[tokio::test]
async fn test_invalid_token_closes_with_policy_violation() {
    let worker = start_worker(WorkerBuilder::new(config(0))).await;

    let forged = TestTokenBuilder::new()
        .for_user("mallory")
        .sign("not-the-server-secret-not-the-server-secret");
    let url = format!("ws://{}/ws?token={forged}", worker.local_addr());
    let mut client = WsTestClient::connect(&url).await;
    let (code, _) = client.recv_close().await;
    assert_eq!(code, 1008);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_ping_and_room_join() {
    let worker = start_worker(WorkerBuilder::new(config(0))).await;
    let mut client = WsTestClient::connect(&ws_url(&worker, "alice")).await;

    client.send("system", "ping", json!({})).await;
    let pong = client.recv().await;
    assert_eq!((pong.kind.as_str(), pong.action.as_str()), ("system", "pong"));

    client.send("room", "join", json!({"room": "lobby"})).await;
    let joined = client.recv().await;
    assert_eq!(joined.action, "joined");
    assert_eq!(joined.data["room"], "lobby");

    client.send("nope", "nothing", json!({})).await;
    let error = client.recv().await;
    assert_eq!(error.kind, "error");
    assert_eq!(error.action, "handler_not_found");

    client.close().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_application_routes_receive_user_identity() {
    let recorder = RecordingHandler::new().replying(WireMessage::new("chat", "ack", json!({})));
    let routes_recorder = recorder.clone();
    let worker = start_worker(
        WorkerBuilder::new(config(0))
            .routes(move |builder| builder.route(Matcher::exact("chat", "send"), routes_recorder)),
    )
    .await;
    let mut client = WsTestClient::connect(&ws_url(&worker, "alice")).await;

    client.send("chat", "send", json!({"text": "hi"})).await;
    assert_eq!(client.recv().await.action, "ack");

    let calls = recorder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.data["text"], "hi");

    worker.shutdown().await;
}

#[tokio::test]
async fn test_lobby_across_two_workers() {
    let broker = MemoryBroker::new();
    let (bus_a, rx_a) = broker.connect();
    let (bus_b, rx_b) = broker.connect();
    let worker_a = start_worker(WorkerBuilder::new(config(0)).bus(Arc::new(bus_a), rx_a)).await;
    let worker_b = start_worker(WorkerBuilder::new(config(1)).bus(Arc::new(bus_b), rx_b)).await;

    let mut alice = WsTestClient::connect(&ws_url(&worker_a, "alice")).await;
    let mut bob = WsTestClient::connect(&ws_url(&worker_b, "bob")).await;
    let mut dave = WsTestClient::connect(&ws_url(&worker_a, "dave")).await;

    alice.send("room", "join", json!({"room": "lobby"})).await;
    assert_eq!(alice.recv().await.action, "joined");
    dave.send("room", "join", json!({"room": "lobby"})).await;
    assert_eq!(dave.recv().await.action, "joined");
    bob.send("room", "join", json!({"room": "lobby"})).await;
    assert_eq!(bob.recv().await.action, "joined");

    alice
        .send("room", "broadcast", json!({"room": "lobby", "payload": {"text": "hi bob"}}))
        .await;

    let message = bob.recv().await;
    assert_eq!(message.action, "message");
    assert_eq!(message.data["payload"]["text"], "hi bob");
    assert_eq!(message.data["from"]["user_id"], "alice");
    assert_eq!(dave.recv().await.data["payload"]["text"], "hi bob");
    alice.expect_silence(Duration::from_millis(100)).await;

    bob.send("broadcast", "all", json!({"payload": "everyone"})).await;
    assert_eq!(alice.recv().await.data["payload"], "everyone");
    assert_eq!(dave.recv().await.data["payload"], "everyone");
    assert_eq!(bob.recv().await.data["payload"], "everyone");

    worker_a.shutdown().await;
    worker_b.shutdown().await;
}

#[tokio::test]
async fn test_readiness_follows_lifecycle() {
    let worker = start_worker(WorkerBuilder::new(config(0))).await;

    let ready = http_get(&worker, "/ready").await;
    assert!(ready.starts_with("HTTP/1.1 200"), "{ready}");
    assert!(ready.contains("RUNNING"));

    let health = http_get(&worker, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");

    worker.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_clients_and_runs_hooks_in_order() {
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let builder = WorkerBuilder::new(config(0));
    for (kind, entry) in [("before", "before_shutdown"), ("shutdown", "shutdown")] {
        let log = Arc::clone(&log);
        let hook = move || {
            log.lock().unwrap().push(entry);
            async { Ok(()) }
        };
        if kind == "before" {
            builder.lifecycle().on_before_shutdown(hook);
        } else {
            builder.lifecycle().on_shutdown(hook);
        }
    }
    let worker = start_worker(builder).await;
    let lifecycle = worker.lifecycle().clone();

    let mut client = WsTestClient::connect(&ws_url(&worker, "alice")).await;
    client.send("system", "ping", json!({})).await;
    client.recv().await;

    let report = worker.shutdown().await;
    assert!(!report.timed_out);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(lifecycle.phase(), LifecyclePhase::Stopped);

    let (code, reason) = client.recv_close().await;
    assert_eq!(code, 1001);
    assert_eq!(reason, "server shutting down");
    assert_eq!(*log.lock().unwrap(), vec!["before_shutdown", "shutdown"]);
}

#[tokio::test]
async fn test_slow_shutdown_hook_is_abandoned_after_timeout() {
    let vars = HashMap::from([
        ("SWITCHYARD_AUTH_ENABLED".to_string(), "false".to_string()),
        ("SWITCHYARD_WORKER_COUNT".to_string(), "1".to_string()),
        ("SWITCHYARD_WORKER_ID".to_string(), "0".to_string()),
        ("SWITCHYARD_NODE_ID".to_string(), "e2e".to_string()),
        ("SWITCHYARD_SHUTDOWN_TIMEOUT_MS".to_string(), "50".to_string()),
    ]);
    let builder = WorkerBuilder::new(Config::from_vars(&vars).unwrap());
    builder.lifecycle().on_shutdown(|| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    });
    let worker = start_worker(builder).await;
    let lifecycle = worker.lifecycle().clone();

    let report = worker.shutdown().await;
    assert!(report.timed_out);
    assert!(report.elapsed < Duration::from_secs(5));
    assert_eq!(lifecycle.phase(), LifecyclePhase::Stopped);
}

#[tokio::test]
async fn test_rate_limit_applies_before_validation() {
    let vars = HashMap::from([
        ("SWITCHYARD_JWT_SECRET".to_string(), TEST_JWT_SECRET.to_string()),
        ("SWITCHYARD_WORKER_COUNT".to_string(), "1".to_string()),
        ("SWITCHYARD_WORKER_ID".to_string(), "0".to_string()),
        ("SWITCHYARD_NODE_ID".to_string(), "e2e".to_string()),
        ("SWITCHYARD_RATE_LIMIT_MAX_MESSAGES".to_string(), "2".to_string()),
        ("SWITCHYARD_RATE_LIMIT_WINDOW_MS".to_string(), "60000".to_string()),
    ]);
    let worker = start_worker(WorkerBuilder::new(Config::from_vars(&vars).unwrap())).await;
    let mut client = WsTestClient::connect(&ws_url(&worker, "alice")).await;

    client.send("room", "join", json!({})).await;
    assert_eq!(client.recv().await.action, "invalid_message");
    client.send("nope", "nothing", json!({})).await;
    assert_eq!(client.recv().await.action, "handler_not_found");

    // Over the limit, neither validation nor lookup runs.
    client.send("room", "join", json!({})).await;
    assert_eq!(client.recv().await.action, "rate_limited");
    client.send("nope", "nothing", json!({})).await;
    assert_eq!(client.recv().await.action, "rate_limited");

    worker.shutdown().await;
}
