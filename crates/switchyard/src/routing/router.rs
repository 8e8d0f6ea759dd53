//! Route table and dispatch.
//!
//! The table is built once through [`RouterBuilder`]. Routes are ordered by
//! priority (higher first) with ties kept in registration order; lookup is
//! first-match-wins over that order.

use super::context::HandlerContext;
use super::message::WireMessage;
use super::middleware::{ErrorAction, Middleware};
use crate::errors::SwitchyardError;
use crate::observability::metrics;
use crate::registry::ConnectionId;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Upper bound on handler attempts for one frame, whatever the middleware asks.
pub const MAX_DISPATCH_ATTEMPTS: u32 = 5;

/// Application message handler.
///
/// Handlers run inside the worker hub; no two handlers of one worker run
/// concurrently.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_>,
        message: &WireMessage,
    ) -> Result<(), SwitchyardError>;
}

pub type MessagePredicate = Arc<dyn Fn(&WireMessage) -> bool + Send + Sync>;

/// Selects the messages a route handles.
#[derive(Clone)]
pub enum Matcher {
    Exact { kind: String, action: String },
    Predicate(MessagePredicate),
}

impl Matcher {
    pub fn exact(kind: impl Into<String>, action: impl Into<String>) -> Self {
        Matcher::Exact {
            kind: kind.into(),
            action: action.into(),
        }
    }

    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&WireMessage) -> bool + Send + Sync + 'static,
    {
        Matcher::Predicate(Arc::new(predicate))
    }

    pub fn matches(&self, message: &WireMessage) -> bool {
        match self {
            Matcher::Exact { kind, action } => *kind == message.kind && *action == message.action,
            Matcher::Predicate(predicate) => predicate(message),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Exact { kind, action } => write!(f, "Exact({kind}/{action})"),
            Matcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

struct Route {
    matcher: Matcher,
    priority: i32,
    handler: Arc<dyn MessageHandler>,
}

/// What happened to one inbound frame.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Handler completed (possibly after retries).
    Handled,
    /// Frame was not a valid wire message; dropped.
    ParseFailed,
    /// No route matched; an error envelope was sent.
    NotFound,
    /// A middleware `before` stage stopped the frame.
    ShortCircuited,
    /// Handler failed and a middleware suppressed the error.
    Suppressed,
    /// Handler failed; an error envelope was sent.
    Failed(SwitchyardError),
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Handled => "handled",
            DispatchOutcome::ParseFailed => "parse_failed",
            DispatchOutcome::NotFound => "not_found",
            DispatchOutcome::ShortCircuited => "short_circuited",
            DispatchOutcome::Suppressed => "suppressed",
            DispatchOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Default)]
pub struct RouterBuilder {
    routes: Vec<Route>,
    middleware: Vec<Box<dyn Middleware>>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler at priority 0.
    #[must_use]
    pub fn route<H>(self, matcher: Matcher, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.route_with_priority(matcher, 0, handler)
    }

    /// Register a handler; higher priorities are matched first.
    #[must_use]
    pub fn route_with_priority<H>(mut self, matcher: Matcher, priority: i32, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.routes.push(Route {
            matcher,
            priority,
            handler: Arc::new(handler),
        });
        self
    }

    /// Append a middleware; stages run in the order middleware was added.
    #[must_use]
    pub fn middleware<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middleware.push(Box::new(middleware));
        self
    }

    pub fn build(mut self) -> MessageRouter {
        // Stable: equal priorities keep registration order.
        self.routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        MessageRouter {
            routes: self.routes,
            middleware: self.middleware,
        }
    }
}

pub struct MessageRouter {
    routes: Vec<Route>,
    middleware: Vec<Box<dyn Middleware>>,
}

impl MessageRouter {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// First matching handler.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound` if no route matches.
    pub fn resolve(
        &self,
        message: &WireMessage,
    ) -> Result<Arc<dyn MessageHandler>, SwitchyardError> {
        self.routes
            .iter()
            .find(|route| route.matcher.matches(message))
            .map(|route| Arc::clone(&route.handler))
            .ok_or_else(|| SwitchyardError::HandlerNotFound {
                kind: message.kind.clone(),
                action: message.action.clone(),
            })
    }

    /// Parse one inbound frame, run the `before` stages, then resolve and run
    /// its handler.
    ///
    /// Per-connection failures are reported to the connection and logged;
    /// they never propagate out of dispatch.
    pub async fn dispatch(&mut self, ctx: &mut HandlerContext<'_>, raw: &str) -> DispatchOutcome {
        let started = Instant::now();
        let outcome = self.dispatch_inner(ctx, raw).await;
        metrics::record_dispatch(outcome.label(), started.elapsed());
        outcome
    }

    async fn dispatch_inner(&mut self, ctx: &mut HandlerContext<'_>, raw: &str) -> DispatchOutcome {
        let connection_id = ctx.connection_id();

        let message = match WireMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    target: "sy.router",
                    connection_id = %connection_id,
                    error = %e,
                    "Dropping unparseable frame"
                );
                return DispatchOutcome::ParseFailed;
            }
        };

        // `before` runs for every parsed frame, routed or not.
        for middleware in &mut self.middleware {
            if !middleware.before(ctx, &message).await {
                debug!(
                    target: "sy.router",
                    connection_id = %connection_id,
                    middleware = middleware.name(),
                    "Frame stopped by middleware"
                );
                return DispatchOutcome::ShortCircuited;
            }
        }

        let handler = match self.resolve(&message) {
            Ok(handler) => handler,
            Err(e) => {
                debug!(
                    target: "sy.router",
                    connection_id = %connection_id,
                    kind = %message.kind,
                    action = %message.action,
                    "No handler"
                );
                ctx.reply_error(&e);
                return DispatchOutcome::NotFound;
            }
        };

        let mut attempt: u32 = 1;
        loop {
            let error = match handler.handle(ctx, &message).await {
                Ok(()) => {
                    for middleware in &mut self.middleware {
                        middleware.after(ctx, &message).await;
                    }
                    return DispatchOutcome::Handled;
                }
                Err(e) => e,
            };

            let mut retry = false;
            for middleware in &mut self.middleware {
                match middleware.on_error(ctx, &message, &error, attempt).await {
                    ErrorAction::Propagate => {}
                    ErrorAction::Suppress => return DispatchOutcome::Suppressed,
                    ErrorAction::Retry => {
                        retry = true;
                        break;
                    }
                }
            }

            if retry && attempt < MAX_DISPATCH_ATTEMPTS {
                attempt += 1;
                debug!(
                    target: "sy.router",
                    connection_id = %connection_id,
                    attempt,
                    "Retrying handler"
                );
                continue;
            }

            error!(
                target: "sy.router",
                connection_id = %connection_id,
                kind = %message.kind,
                action = %message.action,
                attempts = attempt,
                error = %error,
                "Handler failed"
            );
            ctx.reply(WireMessage::error("internal_error", error.client_message()));
            return DispatchOutcome::Failed(error);
        }
    }

    /// Let middleware drop per-connection state.
    pub fn connection_closed(&mut self, connection_id: ConnectionId) {
        for middleware in &mut self.middleware {
            middleware.on_disconnect(connection_id);
        }
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field(
                "routes",
                &self.routes.iter().map(|r| (&r.matcher, r.priority)).collect::<Vec<_>>(),
            )
            .field(
                "middleware",
                &self.middleware.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
