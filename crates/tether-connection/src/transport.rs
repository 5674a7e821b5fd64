//! Wire transport seam.
//!
//! A [`Transport`] turns a connect call into a [`TransportLink`]: an
//! outbound text channel and an inbound event stream. The manager never
//! touches sockets directly, which keeps the reconnect state machine
//! testable against [`crate::testing::MockTransport`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::errors::ConnectionError;

/// Channel capacity for each direction of a link.
const LINK_CAPACITY: usize = 64;

/// Events surfaced by a live link.
#[derive(Debug)]
pub enum TransportEvent {
    /// A raw text frame arrived.
    Frame(String),
    /// The link ended. `abnormal` is `false` only for a clean,
    /// server-initiated close handshake.
    Closed {
        /// Whether the close was abnormal (error, EOF without handshake).
        abnormal: bool,
    },
}

/// One established connection: an outbound sender and an inbound stream.
pub struct TransportLink {
    /// Raw text frames to write to the wire.
    pub outbound: mpsc::Sender<String>,
    /// Frames and lifecycle events read from the wire.
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// A connectable wire transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish one connection.
    async fn connect(&self) -> Result<TransportLink, ConnectionError>;
}

/// WebSocket transport over `tokio-tungstenite`.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// Create a transport for the given WebSocket URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<TransportLink, ConnectionError> {
        let (ws, _response) = connect_async(&self.url)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        debug!(url = %self.url, "websocket connected");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(LINK_CAPACITY);

        // Writer: drains the outbound channel onto the socket. Dropping
        // the outbound sender closes the socket.
        let _writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: forwards text frames and reports the close.
        let _reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx
                            .send(TransportEvent::Frame(text.to_string()))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        let _ = in_tx.send(TransportEvent::Closed { abnormal: false }).await;
                        return;
                    }
                    // Ping/pong at the websocket layer is handled by
                    // tungstenite; the protocol heartbeat rides in text
                    // frames.
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket read failed");
                        let _ = in_tx.send(TransportEvent::Closed { abnormal: true }).await;
                        return;
                    }
                }
            }
            let _ = in_tx.send(TransportEvent::Closed { abnormal: true }).await;
        });

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_event_debug() {
        let event = TransportEvent::Closed { abnormal: true };
        assert!(format!("{event:?}").contains("abnormal: true"));
    }

    #[tokio::test]
    async fn ws_transport_connect_refused() {
        // Nothing listens on this port; connect must fail cleanly.
        let transport = WsTransport::new("ws://127.0.0.1:9/ws");
        let result = transport.connect().await;
        assert!(result.is_err());
    }
}
