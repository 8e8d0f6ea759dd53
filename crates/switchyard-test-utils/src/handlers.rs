//! Message handlers for router and hub tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use switchyard::errors::SwitchyardError;
use switchyard::registry::ConnectionId;
use switchyard::routing::{HandlerContext, MessageHandler, WireMessage};

/// Records every message it handles. Clone to keep a view of the records
/// after handing the handler to a router.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    calls: Arc<Mutex<Vec<(ConnectionId, WireMessage)>>>,
    reply: Option<WireMessage>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also send `reply` back to the sender.
    pub fn replying(mut self, reply: WireMessage) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn calls(&self) -> Vec<(ConnectionId, WireMessage)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        message: &WireMessage,
    ) -> Result<(), SwitchyardError> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.connection_id(), message.clone()));
        if let Some(reply) = &self.reply {
            ctx.reply(reply.clone());
        }
        Ok(())
    }
}

/// Fails its first `failures` calls, then succeeds.
#[derive(Clone)]
pub struct FailingHandler {
    failures: u32,
    attempts: Arc<AtomicU32>,
    make_error: Arc<dyn Fn() -> SwitchyardError + Send + Sync>,
}

impl FailingHandler {
    /// Fails `failures` times with a retryable (Redis) error.
    pub fn transient(failures: u32) -> Self {
        Self::with_error(failures, || SwitchyardError::Redis("connection reset".to_string()))
    }

    /// Always fails with an internal error.
    pub fn always() -> Self {
        Self::with_error(u32::MAX, || {
            SwitchyardError::Handler("handler exploded".to_string())
        })
    }

    pub fn with_error<F>(failures: u32, make_error: F) -> Self
    where
        F: Fn() -> SwitchyardError + Send + Sync + 'static,
    {
        Self {
            failures,
            attempts: Arc::new(AtomicU32::new(0)),
            make_error: Arc::new(make_error),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        message: &WireMessage,
    ) -> Result<(), SwitchyardError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err((self.make_error)());
        }
        ctx.reply(WireMessage::new(
            message.kind.clone(),
            format!("{}_ok", message.action),
            serde_json::json!({ "attempts": attempt }),
        ));
        Ok(())
    }
}
