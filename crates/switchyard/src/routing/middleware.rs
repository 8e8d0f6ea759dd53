//! Middleware chain stages and the built-in middleware.
//!
//! Stages run in the order middleware was added to the router:
//! - `before` for every middleware; `false` stops the frame
//! - the handler
//! - `after` for every middleware on success, or `on_error` until one
//!   middleware returns something other than [`ErrorAction::Propagate`]

use super::context::HandlerContext;
use super::message::WireMessage;
use crate::errors::SwitchyardError;
use crate::registry::ConnectionId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the router does with a handler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Hand the error to the next middleware (or the router's fallback).
    Propagate,
    /// The error was dealt with; nothing more is sent.
    Suppress,
    /// Run the handler again.
    Retry,
}

#[async_trait]
pub trait Middleware: Send {
    fn name(&self) -> &'static str;

    async fn before(&mut self, _ctx: &mut HandlerContext<'_>, _message: &WireMessage) -> bool {
        true
    }

    async fn after(&mut self, _ctx: &mut HandlerContext<'_>, _message: &WireMessage) {}

    async fn on_error(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        _message: &WireMessage,
        _error: &SwitchyardError,
        _attempt: u32,
    ) -> ErrorAction {
        ErrorAction::Propagate
    }

    /// Drop any state kept for a closed connection.
    fn on_disconnect(&mut self, _connection_id: ConnectionId) {}
}

// =============================================================================
// Validation
// =============================================================================

/// Per-route required data keys.
///
/// A frame for a route with rules must carry an object `data` containing
/// every required key; otherwise an `invalid_message` error is sent and the
/// frame is stopped.
#[derive(Debug, Default)]
pub struct ValidationMiddleware {
    rules: HashMap<(String, String), Vec<String>>,
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn require(mut self, kind: &str, action: &str, keys: &[&str]) -> Self {
        self.rules
            .entry((kind.to_string(), action.to_string()))
            .or_default()
            .extend(keys.iter().map(|k| (*k).to_string()));
        self
    }

    fn check(&self, message: &WireMessage) -> Result<(), SwitchyardError> {
        let Some(required) = self
            .rules
            .get(&(message.kind.clone(), message.action.clone()))
        else {
            return Ok(());
        };

        let Some(data) = message.data.as_object() else {
            return Err(SwitchyardError::Validation("data must be an object".to_string()));
        };
        match required.iter().find(|key| !data.contains_key(key.as_str())) {
            Some(missing) => Err(SwitchyardError::Validation(format!("{missing} is required"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn before(&mut self, ctx: &mut HandlerContext<'_>, message: &WireMessage) -> bool {
        match self.check(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    target: "sy.router.validation",
                    connection_id = %ctx.connection_id(),
                    error = %e,
                    "Frame failed validation"
                );
                ctx.reply_error(&e);
                false
            }
        }
    }
}

// =============================================================================
// Rate limiting
// =============================================================================

/// Fixed-window rate limit per connection.
#[derive(Debug)]
pub struct RateLimitMiddleware {
    max_messages: u32,
    window: Duration,
    windows: HashMap<ConnectionId, (Instant, u32)>,
}

impl RateLimitMiddleware {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            windows: HashMap::new(),
        }
    }

    fn admit(&mut self, id: ConnectionId, now: Instant) -> bool {
        let entry = self.windows.entry(id).or_insert((now, 0));
        if now.saturating_duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.max_messages {
            return false;
        }
        entry.1 += 1;
        true
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn before(&mut self, ctx: &mut HandlerContext<'_>, _message: &WireMessage) -> bool {
        let id = ctx.connection_id();
        if self.admit(id, Instant::now()) {
            return true;
        }
        warn!(target: "sy.router.rate_limit", connection_id = %id, "Rate limit exceeded");
        ctx.reply_error(&SwitchyardError::RateLimited);
        false
    }

    fn on_disconnect(&mut self, connection_id: ConnectionId) {
        self.windows.remove(&connection_id);
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Logs every handled frame with its latency.
#[derive(Debug, Default)]
pub struct LoggingMiddleware {
    started: Option<Instant>,
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time since `before`. Left in place so retried attempts keep
    /// measuring from the first one.
    fn elapsed_ms(&self) -> u128 {
        self.started.map_or(0, |started| started.elapsed().as_millis())
    }

    fn finish_ms(&mut self) -> u128 {
        let elapsed = self.elapsed_ms();
        self.started = None;
        elapsed
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn before(&mut self, ctx: &mut HandlerContext<'_>, message: &WireMessage) -> bool {
        // Dispatch is sequential per worker, so one start time is enough.
        self.started = Some(Instant::now());
        debug!(
            target: "sy.router",
            connection_id = %ctx.connection_id(),
            kind = %message.kind,
            action = %message.action,
            "Dispatching"
        );
        true
    }

    async fn after(&mut self, ctx: &mut HandlerContext<'_>, message: &WireMessage) {
        info!(
            target: "sy.router",
            connection_id = %ctx.connection_id(),
            kind = %message.kind,
            action = %message.action,
            elapsed_ms = self.finish_ms(),
            "Handled"
        );
    }

    async fn on_error(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        message: &WireMessage,
        error: &SwitchyardError,
        attempt: u32,
    ) -> ErrorAction {
        warn!(
            target: "sy.router",
            connection_id = %ctx.connection_id(),
            kind = %message.kind,
            action = %message.action,
            attempt,
            elapsed_ms = self.elapsed_ms(),
            error = %error,
            "Handler error"
        );
        ErrorAction::Propagate
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Re-runs handlers that failed with a retryable error.
#[derive(Debug)]
pub struct RetryMiddleware {
    max_attempts: u32,
}

impl RetryMiddleware {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn on_error(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        _message: &WireMessage,
        error: &SwitchyardError,
        attempt: u32,
    ) -> ErrorAction {
        if error.is_retryable() && attempt < self.max_attempts {
            ErrorAction::Retry
        } else {
            ErrorAction::Propagate
        }
    }
}

// =============================================================================
// Recovery
// =============================================================================

/// Answers client errors with their client-safe message.
///
/// Anything else propagates to the router's generic `internal_error` reply.
#[derive(Debug, Default)]
pub struct RecoveryMiddleware;

#[async_trait]
impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn on_error(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        _message: &WireMessage,
        error: &SwitchyardError,
        _attempt: u32,
    ) -> ErrorAction {
        if error.is_client_error() {
            ctx.reply_error(error);
            ErrorAction::Suppress
        } else {
            ErrorAction::Propagate
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionInit, ConnectionRegistry, SocketHandle};
    use crate::relay::{BroadcastRelay, ChannelNames, MemoryBroker};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_validation_rules() {
        let validation = ValidationMiddleware::new().require("room", "join", &["room"]);

        let ok = WireMessage::new("room", "join", json!({"room": "lobby"}));
        assert!(validation.check(&ok).is_ok());

        let missing = WireMessage::new("room", "join", json!({"other": 1}));
        assert!(matches!(
            validation.check(&missing),
            Err(SwitchyardError::Validation(msg)) if msg == "room is required"
        ));

        let not_object = WireMessage::new("room", "join", json!("lobby"));
        assert!(validation.check(&not_object).is_err());

        let unruled = WireMessage::new("system", "ping", serde_json::Value::Null);
        assert!(validation.check(&unruled).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_fixed_window() {
        let mut limiter = RateLimitMiddleware::new(2, Duration::from_secs(1));
        let id = ConnectionId::new(1);
        let other = ConnectionId::new(2);

        assert!(limiter.admit(id, Instant::now()));
        assert!(limiter.admit(id, Instant::now()));
        assert!(!limiter.admit(id, Instant::now()));
        assert!(limiter.admit(other, Instant::now()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.admit(id, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_forgets_closed_connections() {
        let mut limiter = RateLimitMiddleware::new(1, Duration::from_secs(60));
        let id = ConnectionId::new(1);

        assert!(limiter.admit(id, Instant::now()));
        assert!(!limiter.admit(id, Instant::now()));

        limiter.on_disconnect(id);
        assert!(limiter.admit(id, Instant::now()));
    }

    fn with_context<T>(f: impl FnOnce(&mut HandlerContext<'_>) -> T) -> T {
        let broker = MemoryBroker::new();
        let (bus, _bus_rx) = broker.connect();
        let relay = BroadcastRelay::new(Arc::new(bus), ChannelNames::new("t:"), "w1");
        let mut registry = ConnectionRegistry::new();
        let id = registry.allocate_id();
        let (socket, _rx) = SocketHandle::channel(8);
        registry.add(id, socket, ConnectionInit::default()).unwrap();
        let mut ctx = HandlerContext::new(id, &mut registry, &relay);
        f(&mut ctx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_logging_latency_spans_retried_attempts() {
        let mut logging = LoggingMiddleware::new();
        logging.started = Some(Instant::now());

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(logging.elapsed_ms(), 5);

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(logging.elapsed_ms(), 10);

        assert_eq!(logging.finish_ms(), 10);
        assert!(logging.started.is_none());
        assert_eq!(logging.elapsed_ms(), 0);
    }

    #[test]
    fn test_retry_budget() {
        let message = WireMessage::new("a", "b", serde_json::Value::Null);
        let transient = SwitchyardError::Redis("io".to_string());
        let permanent = SwitchyardError::Validation("bad".to_string());

        let decisions = with_context(|ctx| {
            futures::executor::block_on(async {
                let mut retry = RetryMiddleware::new(3);
                vec![
                    retry.on_error(ctx, &message, &transient, 1).await,
                    retry.on_error(ctx, &message, &transient, 2).await,
                    retry.on_error(ctx, &message, &transient, 3).await,
                    retry.on_error(ctx, &message, &permanent, 1).await,
                ]
            })
        });

        assert_eq!(
            decisions,
            vec![
                ErrorAction::Retry,
                ErrorAction::Retry,
                ErrorAction::Propagate,
                ErrorAction::Propagate
            ]
        );
    }

    #[test]
    fn test_recovery_suppresses_client_errors_only() {
        let message = WireMessage::new("a", "b", serde_json::Value::Null);

        let (client, internal) = with_context(|ctx| {
            futures::executor::block_on(async {
                let mut recovery = RecoveryMiddleware;
                let client = recovery
                    .on_error(ctx, &message, &SwitchyardError::Validation("bad".to_string()), 1)
                    .await;
                let internal = recovery
                    .on_error(ctx, &message, &SwitchyardError::Internal("x".to_string()), 1)
                    .await;
                (client, internal)
            })
        });

        assert_eq!(client, ErrorAction::Suppress);
        assert_eq!(internal, ErrorAction::Propagate);
    }
}
