//! Per-connection writer task.
//!
//! Each WebSocket is split: the reader half feeds the hub, the writer half is
//! owned by this task and drained from the connection's bounded outbound
//! queue. The task ends on the first close frame, on a write error, or when
//! the registry drops the queue's sender (which sends `1000`).

use crate::registry::{ConnectionId, OutboundFrame, CLOSE_NORMAL};
use axum::extract::ws::{CloseFrame, Message};
use futures::{Sink, SinkExt};
use std::borrow::Cow;
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

/// Spawn the writer for one connection.
pub fn spawn_writer<S>(
    sink: S,
    outbound: mpsc::Receiver<OutboundFrame>,
    connection_id: ConnectionId,
) -> JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    tokio::spawn(run_writer(sink, outbound, connection_id))
}

#[instrument(skip_all, name = "sy.connection.writer", fields(connection_id = %connection_id))]
async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    connection_id: ConnectionId,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    while let Some(frame) = outbound.recv().await {
        match frame {
            OutboundFrame::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(
                        target: "sy.connection",
                        connection_id = %connection_id,
                        error = %e,
                        "Socket write failed"
                    );
                    return;
                }
            }
            OutboundFrame::Close { code, reason } => {
                send_close(&mut sink, code, reason).await;
                debug!(
                    target: "sy.connection",
                    connection_id = %connection_id,
                    code,
                    "Close frame sent"
                );
                return;
            }
        }
    }

    send_close(&mut sink, CLOSE_NORMAL, String::new()).await;
    debug!(target: "sy.connection", connection_id = %connection_id, "Writer finished");
}

async fn send_close<S>(sink: &mut S, code: u16, reason: String)
where
    S: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: Cow::Owned(reason),
    };
    // The peer may already be gone.
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}
