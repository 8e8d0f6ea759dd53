//! In-process pub/sub broker.
//!
//! Used when a node runs a single worker without Redis, and by tests to put
//! several worker hubs on one bus.

use super::bus::{BusMessage, BusReceiver, MessageBus};
use crate::errors::SwitchyardError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct BrokerState {
    next_client: u64,
    clients: HashMap<u64, mpsc::UnboundedSender<BusMessage>>,
    channels: HashMap<String, HashSet<u64>>,
}

/// Shared broker. Clone to share.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client connection to the broker.
    pub fn connect(&self) -> (MemoryBus, BusReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_client += 1;
        let client_id = state.next_client;
        state.clients.insert(client_id, tx);
        drop(state);

        (
            MemoryBus {
                client_id,
                broker: self.clone(),
            },
            rx,
        )
    }

    /// Number of clients subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock().channels.get(channel).map_or(0, HashSet::len)
    }

    /// Simulate a broker outage: publishes fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<usize, SwitchyardError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SwitchyardError::BroadcastDelivery(
                "memory broker unavailable".to_string(),
            ));
        }

        let state = self.lock();
        let Some(subscribers) = state.channels.get(channel) else {
            return Ok(0);
        };

        // Deterministic fan-out order.
        let ordered: BTreeMap<u64, &mpsc::UnboundedSender<BusMessage>> = subscribers
            .iter()
            .filter_map(|id| state.clients.get(id).map(|tx| (*id, tx)))
            .collect();

        let mut delivered = 0;
        for tx in ordered.values() {
            let message = BusMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            if tx.send(message).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn subscribe(&self, client_id: u64, channel: &str) {
        self.lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(client_id);
    }

    fn unsubscribe(&self, client_id: u64, channel: &str) {
        let mut state = self.lock();
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.remove(&client_id);
            if subscribers.is_empty() {
                state.channels.remove(channel);
            }
        }
    }

    fn disconnect(&self, client_id: u64) {
        let mut state = self.lock();
        state.clients.remove(&client_id);
        state.channels.retain(|_, subscribers| {
            subscribers.remove(&client_id);
            !subscribers.is_empty()
        });
    }
}

/// One client's view of a [`MemoryBroker`]. Dropping it unsubscribes
/// everything.
#[derive(Debug)]
pub struct MemoryBus {
    client_id: u64,
    broker: MemoryBroker,
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SwitchyardError> {
        self.broker.publish(channel, payload).map(|_| ())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), SwitchyardError> {
        self.broker.subscribe(self.client_id, channel);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SwitchyardError> {
        self.broker.unsubscribe(self.client_id, channel);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !self.broker.unavailable.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        self.broker.disconnect(self.client_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_only() {
        let broker = MemoryBroker::new();
        let (a, mut a_rx) = broker.connect();
        let (b, mut b_rx) = broker.connect();

        a.subscribe("news").await.unwrap();
        b.publish("news", "hello").await.unwrap();

        assert_eq!(
            a_rx.recv().await.unwrap(),
            BusMessage {
                channel: "news".to_string(),
                payload: "hello".to_string()
            }
        );
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publisher_receives_own_message_when_subscribed() {
        let broker = MemoryBroker::new();
        let (a, mut a_rx) = broker.connect();

        a.subscribe("news").await.unwrap();
        a.publish("news", "echo").await.unwrap();

        assert_eq!(a_rx.recv().await.unwrap().payload, "echo");
    }

    #[tokio::test]
    async fn test_unsubscribe_and_drop() {
        let broker = MemoryBroker::new();
        let (a, _a_rx) = broker.connect();
        let (b, _b_rx) = broker.connect();

        a.subscribe("news").await.unwrap();
        b.subscribe("news").await.unwrap();
        assert_eq!(broker.subscriber_count("news"), 2);

        a.unsubscribe("news").await.unwrap();
        assert_eq!(broker.subscriber_count("news"), 1);

        drop(b);
        assert_eq!(broker.subscriber_count("news"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_publish() {
        let broker = MemoryBroker::new();
        let (a, _a_rx) = broker.connect();

        broker.set_unavailable(true);
        assert!(!a.is_healthy());
        let result = a.publish("news", "x").await;
        assert!(matches!(result, Err(SwitchyardError::BroadcastDelivery(_))));

        broker.set_unavailable(false);
        assert!(a.publish("news", "x").await.is_ok());
    }
}
