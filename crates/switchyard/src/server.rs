//! HTTP surface of a worker.
//!
//! - `GET /ws` - WebSocket upgrade; the connection passes the [`AuthGate`]
//!   after the upgrade and is then handed to the worker hub
//! - `GET /health`, `GET /ready` - liveness and readiness
//! - `GET /metrics` - Prometheus text (when a recorder is installed)
//!
//! Every worker binds the same address with `SO_REUSEPORT`; the kernel
//! spreads incoming connections across them.

use crate::actors::{spawn_writer, DisconnectReason, WorkerHubHandle};
use crate::auth::{AuthContext, AuthGate, AuthenticationError};
use crate::errors::SwitchyardError;
use crate::observability::{health_router, metrics, HealthState};
use crate::registry::{SocketHandle, CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{OriginalUri, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use socket2::{Domain, Protocol, Socket, Type};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Listen backlog for the shared listener.
const LISTEN_BACKLOG: i32 = 1024;

/// Close reason sent to connections rejected by the auth gate.
pub const AUTH_FAILED_REASON: &str = "authentication failed";

/// State shared by the WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: WorkerHubHandle,
    pub auth: Arc<AuthGate>,
    /// Outbound frames queued per connection before it is disconnected.
    pub send_queue_capacity: usize,
}

/// Build the worker's router.
///
/// `/metrics` is only mounted when a Prometheus handle is given.
pub fn app_router(
    state: AppState,
    health_state: Arc<HealthState>,
    prometheus: Option<PrometheusHandle>,
) -> Router {
    let mut router = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .merge(health_router(health_state));

    if let Some(handle) = prometheus {
        router = router.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    router.layer(TraceLayer::new_for_http())
}

/// Bind `addr` so several worker processes can accept on it.
///
/// # Errors
///
/// Any socket option, bind or listen failure.
pub fn bind_shared_listener(addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener: std::net::TcpListener = socket.into();
    tokio::net::TcpListener::from_std(listener)
}

async fn ws_upgrade(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    ws: WebSocketUpgrade,
) -> Response {
    // Validate before the upgrade completes; the result travels with the
    // socket so a rejected client still receives a proper close frame.
    let admitted = state.auth.admit(&uri.to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, admitted))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    admitted: Result<Option<AuthContext>, AuthenticationError>,
) {
    let auth = match admitted {
        Ok(auth) => auth,
        Err(e) => {
            metrics::record_auth_failure(auth_failure_label(&e));
            info!(target: "sy.server", error = %e, "Connection rejected by auth gate");
            close_socket(&mut socket, CLOSE_POLICY_VIOLATION, AUTH_FAILED_REASON).await;
            return;
        }
    };

    let (handle, outbound) = SocketHandle::channel(state.send_queue_capacity);
    let connection_id = match state.hub.connect(handle, auth).await {
        Ok(id) => id,
        Err(SwitchyardError::Draining) => {
            close_socket(&mut socket, CLOSE_GOING_AWAY, "server shutting down").await;
            return;
        }
        Err(e) => {
            warn!(target: "sy.server", error = %e, "Hub rejected connection");
            close_socket(&mut socket, CLOSE_INTERNAL_ERROR, "internal error").await;
            return;
        }
    };

    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, outbound, connection_id);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if state.hub.inbound(connection_id, text).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(
                    target: "sy.server",
                    connection_id = %connection_id,
                    "Ignoring binary frame"
                );
            }
            // Ping/pong are answered by the protocol layer.
            Ok(_) => {}
            Err(e) => {
                debug!(
                    target: "sy.server",
                    connection_id = %connection_id,
                    error = %e,
                    "Socket read failed"
                );
                break;
            }
        }
    }

    // Removal drops the socket handle, which ends the writer.
    if let Err(e) = state
        .hub
        .disconnect(connection_id, DisconnectReason::SocketClosed)
        .await
    {
        debug!(target: "sy.server", error = %e, "Hub gone before disconnect");
    }
    if let Err(e) = writer.await {
        warn!(target: "sy.server", error = %e, "Connection writer task failed");
    }
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    // The client may already be gone.
    let _ = socket.send(Message::Close(Some(frame))).await;
    let _ = socket.close().await;
}

fn auth_failure_label(error: &AuthenticationError) -> &'static str {
    match error {
        AuthenticationError::MissingToken => "missing_token",
        AuthenticationError::InvalidToken(_) => "invalid_token",
        AuthenticationError::MalformedUrl => "malformed_url",
    }
}
