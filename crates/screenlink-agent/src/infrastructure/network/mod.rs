//! Network infrastructure for the agent.
//!
//! Architecture:
//! - [`RelayTransport`] / [`RelayStream`] — the seam between the connection
//!   manager and the actual WebSocket library. The production implementation
//!   is [`WsRelayTransport`] (tokio-tungstenite); tests use the scripted
//!   mock in [`mock`].
//! - [`observer`] — turns raw OS network events into the debounced status
//!   and stability signals.
//! - [`connection_manager`] — the single-writer lifecycle actor.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message as WsMessage,
    MaybeTlsStream, WebSocketStream,
};

pub mod connection_manager;
pub mod mock;
pub mod observer;

/// Errors that can occur on the relay wire.
#[derive(Debug, Error)]
pub enum WireError {
    /// The TCP/TLS/WebSocket handshake did not complete in time.
    #[error("connect to relay timed out")]
    ConnectTimeout,

    /// The WebSocket handshake failed.
    #[error("relay handshake failed: {0}")]
    Handshake(String),

    /// A send on the established connection failed.
    #[error("send failed: {0}")]
    Send(String),

    /// A receive on the established connection failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}

/// One application-level message off the wire. WebSocket control frames
/// (ping/pong/close) are handled below this seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Factory for relay connections.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Opens a connection to `url`, completing the WebSocket handshake
    /// within `timeout`.
    async fn connect(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Box<dyn RelayStream>, WireError>;
}

/// One established, bidirectional relay connection.
#[async_trait]
pub trait RelayStream: Send {
    async fn send_text(&mut self, text: String) -> Result<(), WireError>;
    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), WireError>;

    /// Next inbound message; `None` once the peer closes.
    async fn next_message(&mut self) -> Option<Result<WireMessage, WireError>>;

    /// Initiates a clean close. Best effort; errors are ignored.
    async fn close(&mut self);
}

// ── tokio-tungstenite implementation ──────────────────────────────────────────

/// Production transport over tokio-tungstenite.
#[derive(Debug, Default)]
pub struct WsRelayTransport;

#[async_trait]
impl RelayTransport for WsRelayTransport {
    async fn connect(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Box<dyn RelayStream>, WireError> {
        let (stream, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| WireError::ConnectTimeout)?
            .map_err(|e| WireError::Handshake(e.to_string()))?;
        Ok(Box::new(WsRelayStream { inner: stream }))
    }
}

struct WsRelayStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RelayStream for WsRelayStream {
    async fn send_text(&mut self, text: String) -> Result<(), WireError> {
        self.inner
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| WireError::Send(e.to_string()))
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), WireError> {
        self.inner
            .send(WsMessage::Binary(bytes))
            .await
            .map_err(|e| WireError::Send(e.to_string()))
    }

    async fn next_message(&mut self) -> Option<Result<WireMessage, WireError>> {
        loop {
            match self.inner.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(WireMessage::Text(text))),
                Ok(WsMessage::Binary(bytes)) => {
                    return Some(Ok(WireMessage::Binary(bytes.to_vec())))
                }
                // tokio-tungstenite answers pings automatically; both
                // directions of the protocol-level keepalive are noise here.
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
                Ok(WsMessage::Close(_)) => return None,
                Ok(WsMessage::Frame(_)) => continue,
                Err(e) => return Some(Err(WireError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
