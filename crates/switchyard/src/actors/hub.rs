//! `WorkerHub` - the single owner of a worker's connection state.
//!
//! The hub is the worker's event loop:
//!
//! - Owns the `ConnectionRegistry` (and its rooms), the `MessageRouter` and
//!   the `BroadcastRelay`
//! - Receives frames from socket reader tasks and dispatches them one at a
//!   time, so handlers and middleware never run concurrently
//! - Receives broadcast envelopes from the bus and delivers them to local
//!   connections only
//! - Sweeps idle connections on a fixed interval
//!
//! # Shutdown
//!
//! On cancellation the hub closes every connection with `1001` and exits.
//! `CloseAll` does the same without exiting and stops accepting new
//! connections.

use super::messages::{DisconnectReason, HubMessage, HubStats};
use crate::auth::AuthContext;
use crate::errors::SwitchyardError;
use crate::lifecycle::Disposable;
use crate::observability::metrics;
use crate::registry::{
    ConnectionId, ConnectionInit, ConnectionRegistry, RemovedConnection, SendFailure,
    SocketHandle, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION,
};
use crate::relay::{
    local_recipients, BroadcastRelay, BroadcastScope, BusMessage, BusReceiver, ChannelNames,
    CustomScopes, MessageBus, RecentEnvelopes, DEFAULT_DEDUPE_WINDOW,
};
use crate::routing::{HandlerContext, MessageRouter, WireMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the hub mailbox.
const HUB_CHANNEL_BUFFER: usize = 1024;

/// How long an overflowing connection gets to take its close frame.
const OVERFLOW_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Hub settings.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub worker_id: String,
    pub channel_prefix: String,
    pub idle_timeout: Duration,
    pub idle_sweep_interval: Duration,
    pub dedupe_window: usize,
}

impl HubConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            channel_prefix: "switchyard:".to_string(),
            idle_timeout: Duration::from_secs(300),
            idle_sweep_interval: Duration::from_secs(30),
            dedupe_window: DEFAULT_DEDUPE_WINDOW,
        }
    }
}

/// Handle to the `WorkerHub`.
///
/// All methods are async and return results via oneshot channels.
#[derive(Clone, Debug)]
pub struct WorkerHubHandle {
    sender: mpsc::Sender<HubMessage>,
    cancel_token: CancellationToken,
    worker_id: Arc<str>,
    running: Arc<AtomicBool>,
}

impl WorkerHubHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Register a socket. Returns the new connection id.
    pub async fn connect(
        &self,
        socket: SocketHandle,
        auth: Option<AuthContext>,
    ) -> Result<ConnectionId, SwitchyardError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::Connect {
            socket,
            auth,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SwitchyardError::Internal(format!("response receive failed: {e}")))?
    }

    /// Hand an inbound text frame to the router.
    ///
    /// Waits for mailbox capacity, which applies backpressure to the reader.
    pub async fn inbound(&self, id: ConnectionId, text: String) -> Result<(), SwitchyardError> {
        self.send(HubMessage::Inbound { id, text }).await
    }

    pub async fn disconnect(
        &self,
        id: ConnectionId,
        reason: DisconnectReason,
    ) -> Result<(), SwitchyardError> {
        self.send(HubMessage::Disconnect { id, reason }).await
    }

    /// Publish a broadcast from this worker.
    pub async fn publish(
        &self,
        scope: BroadcastScope,
        payload: WireMessage,
    ) -> Result<Uuid, SwitchyardError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::Publish {
            scope,
            payload,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SwitchyardError::Internal(format!("response receive failed: {e}")))?
    }

    /// Send a message to one local connection.
    pub async fn send_to(
        &self,
        id: ConnectionId,
        message: WireMessage,
    ) -> Result<(), SwitchyardError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::SendTo {
            id,
            message,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SwitchyardError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn stats(&self) -> Result<HubStats, SwitchyardError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::GetStats { respond_to: tx }).await?;

        rx.await
            .map_err(|e| SwitchyardError::Internal(format!("response receive failed: {e}")))
    }

    /// Local members of `room`.
    pub async fn room_members(&self, room: &str) -> Result<Vec<ConnectionId>, SwitchyardError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::RoomMembers {
            room: room.to_string(),
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SwitchyardError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting connections and close the open ones.
    pub async fn close_all(&self, code: u16, reason: &str) -> Result<usize, SwitchyardError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubMessage::CloseAll {
            code,
            reason: reason.to_string(),
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SwitchyardError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the hub (closes every connection, then exits).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// False once the hub loop has exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn send(&self, message: HubMessage) -> Result<(), SwitchyardError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| SwitchyardError::Internal(format!("channel send failed: {e}")))
    }
}

/// Releases the hub during lifecycle shutdown: cancels it, then waits for
/// its loop to finish closing connections.
pub struct HubTask {
    handle: WorkerHubHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HubTask {
    pub fn new(handle: WorkerHubHandle, task: JoinHandle<()>) -> Self {
        Self {
            handle,
            task: Mutex::new(Some(task)),
        }
    }
}

#[async_trait]
impl Disposable for HubTask {
    fn name(&self) -> &str {
        "worker_hub"
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.handle.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.await?;
        }
        Ok(())
    }
}

/// The `WorkerHub` implementation.
pub struct WorkerHub {
    config: HubConfig,
    receiver: mpsc::Receiver<HubMessage>,
    bus_receiver: BusReceiver,
    cancel_token: CancellationToken,
    registry: ConnectionRegistry,
    router: MessageRouter,
    relay: BroadcastRelay,
    custom_scopes: CustomScopes,
    recent: RecentEnvelopes,
    accepting: bool,
    running: Arc<AtomicBool>,
}

impl WorkerHub {
    /// Spawn a hub on `bus`.
    ///
    /// `bus_receiver` must be the inbound side of `bus`.
    pub fn spawn(
        config: HubConfig,
        router: MessageRouter,
        bus: Arc<dyn MessageBus>,
        bus_receiver: BusReceiver,
        custom_scopes: CustomScopes,
        cancel_token: CancellationToken,
    ) -> (WorkerHubHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(HUB_CHANNEL_BUFFER);
        let running = Arc::new(AtomicBool::new(true));
        let relay = BroadcastRelay::new(
            bus,
            ChannelNames::new(config.channel_prefix.clone()),
            config.worker_id.clone(),
        );

        let handle = WorkerHubHandle {
            sender,
            cancel_token: cancel_token.clone(),
            worker_id: Arc::from(config.worker_id.as_str()),
            running: Arc::clone(&running),
        };

        let hub = Self {
            recent: RecentEnvelopes::new(config.dedupe_window),
            config,
            receiver,
            bus_receiver,
            cancel_token,
            registry: ConnectionRegistry::new(),
            router,
            relay,
            custom_scopes,
            accepting: true,
            running,
        };

        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Run the hub loop.
    #[instrument(skip_all, name = "sy.hub", fields(worker_id = %self.config.worker_id))]
    async fn run(mut self) {
        info!(target: "sy.hub", worker_id = %self.config.worker_id, "WorkerHub started");

        let custom: Vec<String> = self.custom_scopes.names().map(str::to_string).collect();
        if let Err(e) = self
            .relay
            .subscribe_defaults(custom.iter().map(String::as_str))
            .await
        {
            error!(
                target: "sy.hub",
                worker_id = %self.config.worker_id,
                error = %e,
                "Default bus subscriptions failed"
            );
        }

        let mut sweep = tokio::time::interval(self.config.idle_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut bus_open = true;

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sy.hub",
                        worker_id = %self.config.worker_id,
                        "WorkerHub received cancellation signal"
                    );
                    self.close_all(CLOSE_GOING_AWAY, "server shutting down").await;
                    break;
                }

                _ = sweep.tick() => {
                    self.sweep_idle().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            metrics::set_hub_mailbox_depth(self.receiver.len());
                        }
                        None => {
                            info!(
                                target: "sy.hub",
                                worker_id = %self.config.worker_id,
                                "WorkerHub channel closed, exiting"
                            );
                            self.close_all(CLOSE_GOING_AWAY, "server shutting down").await;
                            break;
                        }
                    }
                }

                bus_msg = self.bus_receiver.recv(), if bus_open => {
                    match bus_msg {
                        Some(message) => self.handle_bus_message(message).await,
                        None => {
                            warn!(
                                target: "sy.hub",
                                worker_id = %self.config.worker_id,
                                "Bus receiver closed, cross-worker broadcasts stopped"
                            );
                            bus_open = false;
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            target: "sy.hub",
            worker_id = %self.config.worker_id,
            "WorkerHub stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: HubMessage) {
        match message {
            HubMessage::Connect {
                socket,
                auth,
                respond_to,
            } => {
                let result = self.connect(socket, auth);
                let _ = respond_to.send(result);
            }

            HubMessage::Inbound { id, text } => {
                self.dispatch(id, &text).await;
            }

            HubMessage::Disconnect { id, reason } => {
                self.remove_connection(id, reason).await;
            }

            HubMessage::Publish {
                scope,
                payload,
                respond_to,
            } => {
                let result = self.relay.broadcast(scope, payload, None).await;
                let _ = respond_to.send(result);
            }

            HubMessage::SendTo {
                id,
                message,
                respond_to,
            } => {
                let result = self.send_to(id, &message).await;
                let _ = respond_to.send(result);
            }

            HubMessage::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }

            HubMessage::RoomMembers { room, respond_to } => {
                let members = self.registry.rooms().local_members(&room).collect();
                let _ = respond_to.send(members);
            }

            HubMessage::CloseAll {
                code,
                reason,
                respond_to,
            } => {
                self.accepting = false;
                let closed = self.close_all(code, &reason).await;
                let _ = respond_to.send(closed);
            }
        }
    }

    fn connect(
        &mut self,
        socket: SocketHandle,
        auth: Option<AuthContext>,
    ) -> Result<ConnectionId, SwitchyardError> {
        if !self.accepting {
            return Err(SwitchyardError::Draining);
        }

        let init = match auth {
            Some(auth) => ConnectionInit {
                user_id: Some(auth.user_id),
                user_type: auth.user_type,
                claims: serde_json::to_value(&auth.claims).ok(),
                ..ConnectionInit::default()
            },
            None => ConnectionInit::default(),
        };

        let id = self.registry.allocate_id();
        self.registry.add(id, socket, init)?;
        self.update_gauges();

        debug!(
            target: "sy.hub",
            worker_id = %self.config.worker_id,
            connection_id = %id,
            total_connections = self.registry.len(),
            "Connection accepted"
        );
        Ok(id)
    }

    async fn dispatch(&mut self, id: ConnectionId, text: &str) {
        if !self.registry.touch(id, Instant::now()) {
            debug!(target: "sy.hub", connection_id = %id, "Frame for unknown connection dropped");
            return;
        }

        let mut ctx = HandlerContext::new(id, &mut self.registry, &self.relay);
        self.router.dispatch(&mut ctx, text).await;
        let overflowed = ctx.take_overflowed();

        for id in overflowed {
            self.remove_connection(id, DisconnectReason::SendQueueOverflow)
                .await;
        }
        self.update_gauges();
    }

    async fn send_to(
        &mut self,
        id: ConnectionId,
        message: &WireMessage,
    ) -> Result<(), SwitchyardError> {
        let mut ctx = HandlerContext::new(id, &mut self.registry, &self.relay);
        let result = ctx.send_to(id, message);
        let overflowed = ctx.take_overflowed();

        for id in overflowed {
            self.remove_connection(id, DisconnectReason::SendQueueOverflow)
                .await;
        }
        result
    }

    /// Deliver an envelope to the local recipients of its scope.
    async fn handle_bus_message(&mut self, message: BusMessage) {
        let envelope = match self.relay.decode(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "sy.hub", error = %e, "Dropping undecodable bus message");
                return;
            }
        };

        if !self.recent.first_sighting(envelope.id) {
            debug!(target: "sy.hub", envelope_id = %envelope.id, "Duplicate envelope ignored");
            metrics::record_broadcast_duplicate();
            return;
        }

        let text = match envelope.payload.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "sy.hub",
                    envelope_id = %envelope.id,
                    error = %e,
                    "Unencodable payload"
                );
                return;
            }
        };

        let recipients = local_recipients(
            &self.registry,
            &envelope,
            &self.config.worker_id,
            &self.custom_scopes,
        );

        let mut delivered = 0;
        let mut failed = Vec::new();
        for id in recipients {
            let Some(connection) = self.registry.get(id) else {
                continue;
            };
            match connection.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(SendFailure::QueueFull) => {
                    failed.push((id, DisconnectReason::SendQueueOverflow));
                }
                Err(SendFailure::Closed) => failed.push((id, DisconnectReason::SocketClosed)),
            }
        }

        debug!(
            target: "sy.hub",
            envelope_id = %envelope.id,
            scope = envelope.scope.label(),
            origin = %envelope.origin_worker_id,
            delivered,
            "Envelope delivered"
        );
        metrics::record_broadcast_delivered(envelope.scope.label(), delivered);

        for (id, reason) in failed {
            self.remove_connection(id, reason).await;
        }
    }

    async fn sweep_idle(&mut self) {
        let evicted = self
            .registry
            .evict_idle(Instant::now(), self.config.idle_timeout);
        if evicted.is_empty() {
            return;
        }

        info!(
            target: "sy.hub",
            worker_id = %self.config.worker_id,
            evicted = evicted.len(),
            "Idle connections evicted"
        );
        for removed in evicted {
            self.after_removal(removed, DisconnectReason::IdleTimeout)
                .await;
        }
    }

    async fn close_all(&mut self, code: u16, reason: &str) -> usize {
        let removed = self.registry.close_all(code, reason);
        let closed = removed.len();
        for removed in removed {
            self.after_removal(removed, DisconnectReason::Shutdown).await;
        }

        info!(
            target: "sy.hub",
            worker_id = %self.config.worker_id,
            closed,
            "All connections closed"
        );
        closed
    }

    /// Remove one connection. Returns false if it was already gone.
    async fn remove_connection(&mut self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let Some(removed) = self.registry.remove(id) else {
            return false;
        };

        if reason == DisconnectReason::SendQueueOverflow {
            // The queue is full, so the close frame waits behind it.
            let socket = removed.connection.socket().clone();
            tokio::spawn(async move {
                let _ = tokio::time::timeout(
                    OVERFLOW_CLOSE_GRACE,
                    socket.close_queued(CLOSE_POLICY_VIOLATION, "send queue overflow"),
                )
                .await;
            });
        }

        self.after_removal(removed, reason).await;
        true
    }

    async fn after_removal(&mut self, removed: RemovedConnection, reason: DisconnectReason) {
        let id = removed.connection.id();
        for room in &removed.emptied_rooms {
            if let Err(e) = self.relay.unsubscribe_room(room).await {
                warn!(target: "sy.hub", room = %room, error = %e, "Room unsubscribe failed");
            }
        }
        self.router.connection_closed(id);
        metrics::record_connection_closed(reason.as_str());
        self.update_gauges();

        debug!(
            target: "sy.hub",
            worker_id = %self.config.worker_id,
            connection_id = %id,
            reason = reason.as_str(),
            remaining = self.registry.len(),
            "Connection removed"
        );
    }

    fn stats(&self) -> HubStats {
        HubStats {
            worker_id: self.config.worker_id.clone(),
            connections: self.registry.len(),
            rooms: self.registry.rooms().room_count(),
            accepting: self.accepting,
        }
    }

    fn update_gauges(&self) {
        metrics::set_connections_active(self.registry.len());
        metrics::set_rooms_active(self.registry.rooms().room_count());
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
    use crate::registry::{OutboundFrame, CLOSE_NORMAL};
    use crate::relay::{BroadcastEnvelope, MemoryBroker};
    use crate::routing::register_builtin_routes;
    use serde_json::json;

    struct Worker {
        handle: WorkerHubHandle,
        task: JoinHandle<()>,
    }

    fn spawn_worker(broker: &MemoryBroker, worker_id: &str, config: Option<HubConfig>) -> Worker {
        let (bus, bus_rx) = broker.connect();
        let router = register_builtin_routes(MessageRouter::builder()).build();
        let (handle, task) = WorkerHub::spawn(
            config.unwrap_or_else(|| HubConfig::new(worker_id)),
            router,
            Arc::new(bus),
            bus_rx,
            CustomScopes::new(),
            CancellationToken::new(),
        );
        Worker { handle, task }
    }

    async fn connect(
        handle: &WorkerHubHandle,
        capacity: usize,
    ) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let (socket, rx) = SocketHandle::channel(capacity);
        let id = handle.connect(socket, None).await.unwrap();
        (id, rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<OutboundFrame>) -> WireMessage {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed");
        match frame {
            OutboundFrame::Text(text) => WireMessage::parse(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    async fn send(
        handle: &WorkerHubHandle,
        id: ConnectionId,
        kind: &str,
        action: &str,
        data: serde_json::Value,
    ) {
        let text = WireMessage::new(kind, action, data).to_json().unwrap();
        handle.inbound(id, text).await.unwrap();
    }

    #[tokio::test]
    async fn test_join_and_leave_room() {
        let broker = MemoryBroker::new();
        let worker = spawn_worker(&broker, "w1", None);
        let (id, mut rx) = connect(&worker.handle, 16).await;

        send(&worker.handle, id, "room", "join", json!({"room": "lobby"})).await;
        let reply = next_message(&mut rx).await;
        assert_eq!(reply.action, "joined");
        assert_eq!(worker.handle.room_members("lobby").await.unwrap(), vec![id]);
        assert_eq!(broker.subscriber_count("switchyard:room:lobby"), 1);

        send(&worker.handle, id, "room", "leave", json!({"room": "lobby"})).await;
        let reply = next_message(&mut rx).await;
        assert_eq!(reply.action, "left");
        assert!(worker.handle.room_members("lobby").await.unwrap().is_empty());
        assert_eq!(worker.handle.stats().await.unwrap().rooms, 0);
        assert_eq!(broker.subscriber_count("switchyard:room:lobby"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_cascades_to_rooms() {
        let broker = MemoryBroker::new();
        let worker = spawn_worker(&broker, "w1", None);
        let (a, mut rx_a) = connect(&worker.handle, 16).await;
        let (b, mut rx_b) = connect(&worker.handle, 16).await;

        for room in ["lobby", "games"] {
            send(&worker.handle, a, "room", "join", json!({"room": room})).await;
            next_message(&mut rx_a).await;
        }
        send(&worker.handle, b, "room", "join", json!({"room": "lobby"})).await;
        next_message(&mut rx_b).await;

        worker
            .handle
            .disconnect(a, DisconnectReason::SocketClosed)
            .await
            .unwrap();

        assert_eq!(worker.handle.room_members("lobby").await.unwrap(), vec![b]);
        assert!(worker.handle.room_members("games").await.unwrap().is_empty());
        let stats = worker.handle.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.rooms, 1);
        assert_eq!(broker.subscriber_count("switchyard:room:games"), 0);
    }

    #[tokio::test]
    async fn test_room_broadcast_reaches_members_only() {
        let broker = MemoryBroker::new();
        let worker = spawn_worker(&broker, "w1", None);
        let (sender, mut rx_sender) = connect(&worker.handle, 16).await;
        let (member, mut rx_member) = connect(&worker.handle, 16).await;
        let (_outsider, mut rx_outsider) = connect(&worker.handle, 16).await;

        for (id, rx) in [(sender, &mut rx_sender), (member, &mut rx_member)] {
            send(&worker.handle, id, "room", "join", json!({"room": "lobby"})).await;
            next_message(rx).await;
        }

        send(
            &worker.handle,
            sender,
            "room",
            "broadcast",
            json!({"room": "lobby", "payload": {"text": "hi"}}),
        )
        .await;

        let delivered = next_message(&mut rx_member).await;
        assert_eq!(delivered.kind, "room");
        assert_eq!(delivered.action, "message");
        assert_eq!(delivered.data["payload"], json!({"text": "hi"}));

        // Round trip through the hub so the envelope has certainly been handled.
        worker.handle.stats().await.unwrap();
        assert!(rx_sender.try_recv().is_err(), "sender is excluded");
        assert!(rx_outsider.try_recv().is_err(), "non-member must not receive");
    }

    #[tokio::test]
    async fn test_duplicate_envelope_delivered_once() {
        let broker = MemoryBroker::new();
        let worker = spawn_worker(&broker, "w1", None);
        let (_id, mut rx) = connect(&worker.handle, 16).await;
        worker.handle.stats().await.unwrap();

        let (publisher, _publisher_rx) = broker.connect();
        let envelope = BroadcastEnvelope::new(
            BroadcastScope::All,
            WireMessage::new("news", "flash", json!({})),
            "w9",
        );
        let payload = serde_json::to_string(&envelope).unwrap();
        publisher.publish("switchyard:broadcast-all", &payload).await.unwrap();
        publisher.publish("switchyard:broadcast-all", &payload).await.unwrap();

        let marker = BroadcastEnvelope::new(
            BroadcastScope::All,
            WireMessage::new("news", "marker", json!({})),
            "w9",
        );
        publisher
            .publish(
                "switchyard:broadcast-all",
                &serde_json::to_string(&marker).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(next_message(&mut rx).await.action, "flash");
        assert_eq!(next_message(&mut rx).await.action, "marker");
    }

    #[tokio::test]
    async fn test_send_queue_overflow_disconnects() {
        let broker = MemoryBroker::new();
        let worker = spawn_worker(&broker, "w1", None);
        let (id, _rx) = connect(&worker.handle, 1).await;

        let message = WireMessage::new("news", "flash", json!({}));
        worker.handle.send_to(id, message.clone()).await.unwrap();
        let err = worker.handle.send_to(id, message).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::SendQueueFull(_)));

        assert_eq!(worker.handle.stats().await.unwrap().connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connections_are_evicted() {
        let broker = MemoryBroker::new();
        let mut config = HubConfig::new("w1");
        config.idle_timeout = Duration::from_secs(60);
        config.idle_sweep_interval = Duration::from_secs(10);
        let worker = spawn_worker(&broker, "w1", Some(config));
        let (_idle, mut rx_idle) = connect(&worker.handle, 16).await;
        let (active, mut rx_active) = connect(&worker.handle, 16).await;

        for _ in 0..7 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            send(&worker.handle, active, "system", "ping", json!({})).await;
            next_message(&mut rx_active).await;
        }

        let stats = worker.handle.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(
            rx_idle.recv().await,
            Some(OutboundFrame::Close {
                code: CLOSE_GOING_AWAY,
                reason: "idle timeout".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_close_all_stops_accepting() {
        let broker = MemoryBroker::new();
        let worker = spawn_worker(&broker, "w1", None);
        let (_id, mut rx) = connect(&worker.handle, 16).await;

        let closed = worker.handle.close_all(CLOSE_NORMAL, "bye").await.unwrap();
        assert_eq!(closed, 1);
        assert_eq!(
            rx.recv().await,
            Some(OutboundFrame::Close {
                code: CLOSE_NORMAL,
                reason: "bye".to_string()
            })
        );

        let (socket, _rx) = SocketHandle::channel(4);
        let err = worker.handle.connect(socket, None).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Draining));
        assert!(!worker.handle.stats().await.unwrap().accepting);
    }

    #[tokio::test]
    async fn test_dispose_closes_connections_and_stops_hub() {
        let broker = MemoryBroker::new();
        let worker = spawn_worker(&broker, "w1", None);
        let (_id, mut rx) = connect(&worker.handle, 16).await;

        let hub_task = HubTask::new(worker.handle.clone(), worker.task);
        hub_task.dispose().await.unwrap();

        assert!(!worker.handle.is_running());
        assert_eq!(
            rx.recv().await,
            Some(OutboundFrame::Close {
                code: CLOSE_GOING_AWAY,
                reason: "server shutting down".to_string()
            })
        );
        assert!(worker.handle.stats().await.is_err());
    }
}
