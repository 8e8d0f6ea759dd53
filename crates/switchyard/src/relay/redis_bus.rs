//! Redis pub/sub bus.
//!
//! # Connection Pattern
//!
//! Publishing goes through a `ConnectionManager`, cloned per call; it
//! reconnects on its own after a dropped connection. Subscriptions need a
//! dedicated connection in subscriber mode; a background task owns it and
//! applies subscribe/unsubscribe commands between reads, forwarding every
//! message to the hub's bus receiver.
//!
//! The subscriber task keeps the set of channels the hub asked for. When the
//! pub/sub connection drops it marks the bus unhealthy, reconnects with
//! exponential backoff and re-subscribes that set.

use super::bus::{BusMessage, BusReceiver, MessageBus};
use crate::errors::SwitchyardError;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client, RedisError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// First delay before re-opening a dropped pub/sub connection.
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on the reconnect delay.
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

enum SubscriptionCommand {
    Subscribe {
        channel: String,
        respond_to: oneshot::Sender<Result<(), SwitchyardError>>,
    },
    Unsubscribe {
        channel: String,
        respond_to: oneshot::Sender<Result<(), SwitchyardError>>,
    },
}

pub struct RedisBus {
    publisher: ConnectionManager,
    commands: mpsc::UnboundedSender<SubscriptionCommand>,
    healthy: Arc<AtomicBool>,
}

impl RedisBus {
    /// Connect both the publishing and the subscribing connection.
    ///
    /// The subscriber task stops when `cancel_token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `SwitchyardError::Redis` if either connection fails.
    pub async fn connect(
        redis_url: &str,
        cancel_token: CancellationToken,
    ) -> Result<(Self, BusReceiver), SwitchyardError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url, it may contain credentials.
            error!(target: "sy.relay.redis", error = %e, "Failed to open Redis client");
            SwitchyardError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let publisher = client.get_connection_manager().await.map_err(|e| {
            error!(target: "sy.relay.redis", error = %e, "Failed to connect to Redis");
            SwitchyardError::Redis(format!("Failed to connect to Redis: {e}"))
        })?;

        let pubsub = client.get_async_pubsub().await.map_err(|e| {
            error!(target: "sy.relay.redis", error = %e, "Failed to open pub/sub connection");
            SwitchyardError::Redis(format!("Failed to open pub/sub connection: {e}"))
        })?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let healthy = Arc::new(AtomicBool::new(true));

        let subscriber = Subscriber {
            client,
            commands: command_rx,
            inbound: inbound_tx,
            healthy: Arc::clone(&healthy),
            cancel_token,
            channels: BTreeSet::new(),
            backoff: Backoff::new(),
        };
        tokio::spawn(subscriber.run(pubsub));

        info!(target: "sy.relay.redis", "Connected to Redis bus");

        Ok((
            Self {
                publisher,
                commands: command_tx,
                healthy,
            },
            inbound_rx,
        ))
    }

    async fn send_command(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), SwitchyardError>>) -> SubscriptionCommand,
    ) -> Result<(), SwitchyardError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SwitchyardError::Redis("pub/sub task stopped".to_string()))?;
        rx.await
            .map_err(|_| SwitchyardError::Redis("pub/sub task dropped command".to_string()))?
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SwitchyardError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(channel, payload).await.map_err(|e| {
            warn!(target: "sy.relay.redis", channel = %channel, error = %e, "PUBLISH failed");
            SwitchyardError::Redis(format!("PUBLISH failed: {e}"))
        })?;
        debug!(target: "sy.relay.redis", channel = %channel, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), SwitchyardError> {
        let channel = channel.to_string();
        self.send_command(|respond_to| SubscriptionCommand::Subscribe {
            channel,
            respond_to,
        })
        .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SwitchyardError> {
        let channel = channel.to_string();
        self.send_command(|respond_to| SubscriptionCommand::Unsubscribe {
            channel,
            respond_to,
        })
        .await
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Exponential reconnect delay, doubling up to [`RECONNECT_MAX_DELAY`].
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: RECONNECT_BASE_DELAY,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.next = RECONNECT_BASE_DELAY;
    }
}

/// Apply a command while no pub/sub connection is open.
///
/// The channel set is updated and the caller gets `Ok`; the set is
/// re-subscribed as a whole once the connection is back.
fn record_offline(channels: &mut BTreeSet<String>, command: SubscriptionCommand) {
    match command {
        SubscriptionCommand::Subscribe {
            channel,
            respond_to,
        } => {
            debug!(target: "sy.relay.redis", channel = %channel, "SUBSCRIBE deferred");
            channels.insert(channel);
            let _ = respond_to.send(Ok(()));
        }
        SubscriptionCommand::Unsubscribe {
            channel,
            respond_to,
        } => {
            debug!(target: "sy.relay.redis", channel = %channel, "UNSUBSCRIBE deferred");
            channels.remove(&channel);
            let _ = respond_to.send(Ok(()));
        }
    }
}

/// Why a pub/sub session ended.
enum SessionEnd {
    Stopped,
    ConnectionLost,
}

struct Subscriber {
    client: Client,
    commands: mpsc::UnboundedReceiver<SubscriptionCommand>,
    inbound: mpsc::UnboundedSender<BusMessage>,
    healthy: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    channels: BTreeSet<String>,
    backoff: Backoff,
}

impl Subscriber {
    #[instrument(skip_all, name = "redis_subscriber")]
    async fn run(mut self, mut pubsub: PubSub) {
        loop {
            match self.serve(&mut pubsub).await {
                SessionEnd::Stopped => return,
                SessionEnd::ConnectionLost => {
                    self.healthy.store(false, Ordering::SeqCst);
                    match self.reconnect().await {
                        Some(reopened) => pubsub = reopened,
                        None => return,
                    }
                }
            }
        }
    }

    async fn serve(&mut self, pubsub: &mut PubSub) -> SessionEnd {
        loop {
            // The message stream borrows the connection, so it is dropped
            // before a command is applied.
            let command = {
                let mut messages = pubsub.on_message();
                tokio::select! {
                    () = self.cancel_token.cancelled() => {
                        debug!(target: "sy.relay.redis", "Subscriber cancelled");
                        return SessionEnd::Stopped;
                    }
                    message = messages.next() => {
                        let Some(message) = message else {
                            error!(target: "sy.relay.redis", "Pub/sub connection closed");
                            return SessionEnd::ConnectionLost;
                        };
                        match message.get_payload::<String>() {
                            Ok(payload) => {
                                let forwarded = self.inbound.send(BusMessage {
                                    channel: message.get_channel_name().to_string(),
                                    payload,
                                });
                                if forwarded.is_err() {
                                    debug!(target: "sy.relay.redis", "Bus receiver dropped");
                                    return SessionEnd::Stopped;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    target: "sy.relay.redis",
                                    error = %e,
                                    "Non-text pub/sub payload dropped"
                                );
                            }
                        }
                        continue;
                    }
                    command = self.commands.recv() => command,
                }
            };

            match command {
                Some(SubscriptionCommand::Subscribe {
                    channel,
                    respond_to,
                }) => {
                    let result = pubsub.subscribe(&channel).await.map_err(SwitchyardError::from);
                    debug!(
                        target: "sy.relay.redis",
                        channel = %channel,
                        ok = result.is_ok(),
                        "SUBSCRIBE"
                    );
                    self.channels.insert(channel);
                    let _ = respond_to.send(result);
                }
                Some(SubscriptionCommand::Unsubscribe {
                    channel,
                    respond_to,
                }) => {
                    let result = pubsub
                        .unsubscribe(&channel)
                        .await
                        .map_err(SwitchyardError::from);
                    debug!(
                        target: "sy.relay.redis",
                        channel = %channel,
                        ok = result.is_ok(),
                        "UNSUBSCRIBE"
                    );
                    self.channels.remove(&channel);
                    let _ = respond_to.send(result);
                }
                None => {
                    debug!(target: "sy.relay.redis", "Bus handle dropped");
                    return SessionEnd::Stopped;
                }
            }
        }
    }

    /// Re-open the pub/sub connection, answering commands in the meantime.
    ///
    /// Returns `None` if the task should stop instead.
    async fn reconnect(&mut self) -> Option<PubSub> {
        loop {
            let delay = self.backoff.next_delay();
            warn!(
                target: "sy.relay.redis",
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                channels = self.channels.len(),
                "Reconnecting pub/sub"
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => return None,
                    () = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(command) => record_offline(&mut self.channels, command),
                        None => return None,
                    },
                }
            }

            match self.open().await {
                Ok(pubsub) => {
                    self.backoff.reset();
                    self.healthy.store(true, Ordering::SeqCst);
                    info!(
                        target: "sy.relay.redis",
                        channels = self.channels.len(),
                        "Pub/sub reconnected"
                    );
                    return Some(pubsub);
                }
                Err(e) => {
                    warn!(target: "sy.relay.redis", error = %e, "Pub/sub reconnect failed");
                }
            }
        }
    }

    async fn open(&self) -> Result<PubSub, RedisError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in &self.channels {
            pubsub.subscribe(channel).await?;
        }
        Ok(pubsub)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));

        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), RECONNECT_MAX_DELAY);

        backoff.reset();
        assert_eq!(backoff.next_delay(), RECONNECT_BASE_DELAY);
    }

    #[tokio::test]
    async fn test_offline_commands_update_channel_set() {
        let mut channels = BTreeSet::from(["sy:broadcast-all".to_string()]);

        let (tx, rx) = oneshot::channel();
        record_offline(
            &mut channels,
            SubscriptionCommand::Subscribe {
                channel: "sy:room:lobby".to_string(),
                respond_to: tx,
            },
        );
        assert!(rx.await.unwrap().is_ok());

        let (tx, rx) = oneshot::channel();
        record_offline(
            &mut channels,
            SubscriptionCommand::Unsubscribe {
                channel: "sy:broadcast-all".to_string(),
                respond_to: tx,
            },
        );
        assert!(rx.await.unwrap().is_ok());

        assert_eq!(
            channels.into_iter().collect::<Vec<_>>(),
            vec!["sy:room:lobby".to_string()]
        );
    }
}
