//! Switchyard error types.
//!
//! Every error maps to a wire error action (sent to clients in an
//! `{type: "error", action}` envelope) and a client-safe message. Internal
//! details are logged server-side but never exposed to clients.

use crate::auth::AuthenticationError;
use crate::registry::ConnectionId;
use crate::routing::MessageParseError;
use std::time::Duration;
use thiserror::Error;

/// Switchyard error type.
///
/// Maps to wire error actions:
/// - `Authentication`: `unauthorized`
/// - `MessageParse`, `Validation`: `invalid_message`
/// - `HandlerNotFound`: `handler_not_found`
/// - `ConnectionNotFound`: `not_found`
/// - `Conflict`: `conflict`
/// - `RateLimited`: `rate_limited`
/// - `Draining`: `unavailable`
/// - everything else: `internal_error`
#[derive(Debug, Error)]
pub enum SwitchyardError {
    /// Connection bearer credential was missing or invalid.
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Inbound frame could not be parsed into a wire message.
    #[error("Message parse error: {0}")]
    MessageParse(#[from] MessageParseError),

    /// No route matched the message.
    #[error("No handler registered for {kind}/{action}")]
    HandlerNotFound { kind: String, action: String },

    /// Publishing a broadcast envelope on the bus failed.
    #[error("Broadcast delivery failed: {0}")]
    BroadcastDelivery(String),

    /// A worker process exited outside of shutdown.
    #[error("Worker {worker_id} crashed (exit code {code:?})")]
    WorkerCrash { worker_id: usize, code: Option<i32> },

    /// Graceful shutdown did not finish within its deadline.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Connection is not registered on this worker.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Conflict error (e.g., connection id already registered).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Outbound queue of a connection is full.
    #[error("Send queue full for {0}")]
    SendQueueFull(ConnectionId),

    /// Connection exceeded its message rate.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Worker is shutting down and no longer accepts connections.
    #[error("Worker is draining")]
    Draining,

    /// Message data failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Application handler failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Worker process could not be spawned or signalled.
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwitchyardError {
    /// Returns the wire error action for this error.
    pub fn error_action(&self) -> &'static str {
        match self {
            SwitchyardError::Authentication(_) => "unauthorized",
            SwitchyardError::MessageParse(_) | SwitchyardError::Validation(_) => "invalid_message",
            SwitchyardError::HandlerNotFound { .. } => "handler_not_found",
            SwitchyardError::ConnectionNotFound(_) => "not_found",
            SwitchyardError::Conflict(_) => "conflict",
            SwitchyardError::RateLimited => "rate_limited",
            SwitchyardError::Draining => "unavailable",
            SwitchyardError::BroadcastDelivery(_)
            | SwitchyardError::WorkerCrash { .. }
            | SwitchyardError::ShutdownTimeout(_)
            | SwitchyardError::SendQueueFull(_)
            | SwitchyardError::Handler(_)
            | SwitchyardError::Redis(_)
            | SwitchyardError::Spawn(_)
            | SwitchyardError::Config(_)
            | SwitchyardError::Internal(_) => "internal_error",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SwitchyardError::Authentication(_) => "Authentication failed".to_string(),
            SwitchyardError::MessageParse(e) => e.to_string(),
            SwitchyardError::HandlerNotFound { kind, action } => {
                format!("No handler for {kind}/{action}")
            }
            SwitchyardError::ConnectionNotFound(_) => "Connection not found".to_string(),
            SwitchyardError::RateLimited => "Too many messages, slow down".to_string(),
            SwitchyardError::Draining => "Server is shutting down".to_string(),
            SwitchyardError::Conflict(msg) | SwitchyardError::Validation(msg) => msg.clone(),
            SwitchyardError::BroadcastDelivery(_)
            | SwitchyardError::WorkerCrash { .. }
            | SwitchyardError::ShutdownTimeout(_)
            | SwitchyardError::SendQueueFull(_)
            | SwitchyardError::Handler(_)
            | SwitchyardError::Redis(_)
            | SwitchyardError::Spawn(_)
            | SwitchyardError::Config(_)
            | SwitchyardError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Errors caused by the client's own input.
    ///
    /// These are safe to report back verbatim and are never worth retrying.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SwitchyardError::Authentication(_)
                | SwitchyardError::MessageParse(_)
                | SwitchyardError::HandlerNotFound { .. }
                | SwitchyardError::ConnectionNotFound(_)
                | SwitchyardError::Conflict(_)
                | SwitchyardError::RateLimited
                | SwitchyardError::Validation(_)
        )
    }

    /// Transient infrastructure failures a handler may succeed on if re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SwitchyardError::BroadcastDelivery(_) | SwitchyardError::Redis(_)
        )
    }
}

impl From<redis::RedisError> for SwitchyardError {
    fn from(err: redis::RedisError) -> Self {
        SwitchyardError::Redis(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        assert_eq!(
            SwitchyardError::HandlerNotFound {
                kind: "chat".to_string(),
                action: "send".to_string()
            }
            .error_action(),
            "handler_not_found"
        );
        assert_eq!(SwitchyardError::RateLimited.error_action(), "rate_limited");
        assert_eq!(
            SwitchyardError::Validation("room is required".to_string()).error_action(),
            "invalid_message"
        );
        assert_eq!(
            SwitchyardError::Redis("connection refused".to_string()).error_action(),
            "internal_error"
        );
        assert_eq!(
            SwitchyardError::ConnectionNotFound(ConnectionId::new(3)).error_action(),
            "not_found"
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let redis = SwitchyardError::Redis("auth failed for redis://:pw@cache".to_string());
        assert_eq!(redis.client_message(), "An internal error occurred");

        let handler = SwitchyardError::Handler("db row 42 missing".to_string());
        assert_eq!(handler.client_message(), "An internal error occurred");

        let auth = SwitchyardError::Authentication(AuthenticationError::MissingToken);
        assert_eq!(auth.client_message(), "Authentication failed");
    }

    #[test]
    fn test_client_messages_for_client_errors() {
        let validation = SwitchyardError::Validation("room is required".to_string());
        assert_eq!(validation.client_message(), "room is required");

        let not_found = SwitchyardError::HandlerNotFound {
            kind: "chat".to_string(),
            action: "send".to_string(),
        };
        assert_eq!(not_found.client_message(), "No handler for chat/send");
    }

    #[test]
    fn test_retryable_and_client_classification() {
        assert!(SwitchyardError::BroadcastDelivery("timeout".to_string()).is_retryable());
        assert!(SwitchyardError::Redis("io".to_string()).is_retryable());
        assert!(!SwitchyardError::Validation("x".to_string()).is_retryable());

        assert!(SwitchyardError::RateLimited.is_client_error());
        assert!(!SwitchyardError::Internal("boom".to_string()).is_client_error());
        assert!(!SwitchyardError::Handler("boom".to_string()).is_client_error());
    }

    #[test]
    fn test_display() {
        let err = SwitchyardError::WorkerCrash {
            worker_id: 2,
            code: Some(1),
        };
        assert_eq!(format!("{err}"), "Worker 2 crashed (exit code Some(1))");

        let err = SwitchyardError::ShutdownTimeout(Duration::from_millis(50));
        assert_eq!(format!("{err}"), "Shutdown timed out after 50ms");
    }
}
