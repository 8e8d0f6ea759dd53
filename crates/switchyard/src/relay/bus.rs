//! Pub/sub bus abstraction.

use crate::errors::SwitchyardError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Inbound side of a bus connection.
///
/// Unbounded so a slow hub never causes the bus task to drop messages.
pub type BusReceiver = mpsc::UnboundedReceiver<BusMessage>;

/// Publish/subscribe transport shared by all workers.
///
/// Implementations deliver messages for subscribed channels on the
/// [`BusReceiver`] returned when the bus was created.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SwitchyardError>;

    async fn subscribe(&self, channel: &str) -> Result<(), SwitchyardError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), SwitchyardError>;

    /// False once the bus has lost its connection for good.
    fn is_healthy(&self) -> bool {
        true
    }
}
