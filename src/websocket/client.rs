//! WebSocket transport
//!
//! Handles connection, message reception and keepalive frames. The recovery
//! manager only sees the [`Connector`] / [`Transport`] traits so tests can
//! script a vendor without a network.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens transports to a URL
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

/// One open, ordered message connection
#[async_trait]
pub trait Transport: Send {
    /// Send a text message
    async fn send(&mut self, text: String) -> Result<()>;

    /// Receive the next message.
    ///
    /// `Ok(None)` for control frames (ping/pong) that carry no payload; an
    /// error once the connection is gone.
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Send a transport-level ping
    async fn ping(&mut self) -> Result<()>;

    /// Close the connection
    async fn close(&mut self);
}

/// Connects with tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        info!(url = %url, "Connecting to WebSocket");

        let (ws_stream, response) = connect_async(url).await.map_err(|e| {
            FeedError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");
        Ok(Box::new(WsTransport {
            stream: Some(ws_stream),
        }))
    }
}

/// WebSocket client for a single connection
pub struct WsTransport {
    stream: Option<WsStream>,
}

impl WsTransport {
    fn stream(&mut self) -> Result<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| FeedError::WebSocketConnection("Not connected".to_string()))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        debug!(msg = %text, "Sending text message");
        self.stream()?
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::WebSocketMessage(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self.stream()?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text message");
                Ok(Some(text))
            }
            Some(Ok(Message::Binary(data))) => match binary_text(data) {
                Ok(text) => Ok(Some(text)),
                Err(e) => {
                    warn!(error = %e, "Dropping binary frame");
                    Ok(None)
                }
            },
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Err(e) = stream.send(Message::Pong(data)).await {
                    warn!(error = %e, "Failed to answer ping");
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => {
                debug!("Received pong");
                Ok(None)
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(FeedError::WebSocketConnection(
                    "Connection closed".to_string(),
                ))
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(FeedError::WebSocketMessage(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(FeedError::WebSocketConnection(
                    "Stream ended".to_string(),
                ))
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.stream()?
            .send(Message::Ping(vec![]))
            .await
            .map_err(|e| FeedError::WebSocketMessage(e.to_string()))
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

/// Binary frames carry the same JSON as text frames; corrupted bytes are rejected
fn binary_text(data: Vec<u8>) -> Result<String> {
    String::from_utf8(data)
        .map_err(|e| FeedError::WebSocketMessage(format!("binary frame is not valid UTF-8: {e}")))
}
