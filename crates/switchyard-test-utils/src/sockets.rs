//! Socket fixtures.
//!
//! - [`TestSocket`]: a registry-side [`SocketHandle`] whose outbound queue the
//!   test reads directly, for hub tests that need no network
//! - [`WsTestClient`]: a real WebSocket client for server tests

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use switchyard::registry::{OutboundFrame, SocketHandle};
use switchyard::routing::WireMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long helpers wait for a frame before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// The read side of an in-process connection.
pub struct TestSocket {
    handle: Option<SocketHandle>,
    outbound: mpsc::Receiver<OutboundFrame>,
}

impl TestSocket {
    pub fn new(capacity: usize) -> Self {
        let (handle, outbound) = SocketHandle::channel(capacity);
        Self {
            handle: Some(handle),
            outbound,
        }
    }

    /// The handle to register with the hub. Can be taken once.
    pub fn take_handle(&mut self) -> SocketHandle {
        self.handle.take().expect("socket handle already taken")
    }

    /// Next queued frame, failing the test after [`RECV_TIMEOUT`].
    pub async fn next_frame(&mut self) -> OutboundFrame {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("socket queue closed")
    }

    /// Next frame, which must be a text frame holding a wire message.
    pub async fn next_message(&mut self) -> WireMessage {
        match self.next_frame().await {
            OutboundFrame::Text(text) => {
                serde_json::from_str(&text).expect("frame is not a wire message")
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Next frame, which must be a close frame. Returns `(code, reason)`.
    pub async fn next_close(&mut self) -> (u16, String) {
        match self.next_frame().await {
            OutboundFrame::Close { code, reason } => (code, reason),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    /// Frames queued right now, without waiting.
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// True once every sender (the registry's copy included) is gone and the
    /// queue is empty.
    pub async fn is_closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_millis(50), self.outbound.recv()).await,
            Ok(None)
        )
    }
}

/// WebSocket client speaking the `{type, action, data}` envelope.
pub struct WsTestClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTestClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:1234/ws?token=...`).
    pub async fn connect(url: &str) -> Self {
        let (stream, _response) = connect_async(url).await.expect("websocket connect failed");
        Self { stream }
    }

    pub async fn send(&mut self, kind: &str, action: &str, data: Value) {
        let message = WireMessage::new(kind, action, data);
        let text = serde_json::to_string(&message).expect("serialize wire message");
        self.send_raw(text).await;
    }

    pub async fn send_raw(&mut self, text: String) {
        self.stream
            .send(Message::Text(text))
            .await
            .expect("websocket send failed");
    }

    /// Next wire message; ping/pong frames are skipped.
    pub async fn recv(&mut self) -> WireMessage {
        loop {
            match self.next().await {
                Message::Text(text) => {
                    return serde_json::from_str(&text).expect("frame is not a wire message")
                }
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Wait for the server's close frame. Returns `(code, reason)`.
    pub async fn recv_close(&mut self) -> (u16, String) {
        loop {
            match self.next().await {
                Message::Close(Some(frame)) => {
                    return (u16::from(frame.code), frame.reason.into_owned())
                }
                Message::Close(None) => panic!("close frame without a code"),
                Message::Text(_) | Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

    /// Fail if a text frame arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(Ok(Message::Text(text)))) =
            tokio::time::timeout(wait, self.stream.next()).await
        {
            panic!("expected no message, got {text}");
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }

    async fn next(&mut self) -> Message {
        tokio::time::timeout(RECV_TIMEOUT, self.stream.next())
            .await
            .expect("timed out waiting for websocket frame")
            .expect("websocket stream ended")
            .expect("websocket read failed")
    }
}
