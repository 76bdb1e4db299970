// libs/call-session-cell/src/services/websocket.rs
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::models::{SignalEnvelope, SignalMessage};
use crate::services::signaling::{SignalingTransport, TransportLink};

const OUTBOUND_CAPACITY: usize = 32;
const INBOUND_CAPACITY: usize = 64;

/// JSON-over-WebSocket transport. The rendezvous service authenticates the
/// bearer credential at upgrade time and stamps a `sender` on every message
/// it relays.
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn unavailable(message: impl std::fmt::Display) -> CallError {
    CallError::SignalingUnavailable {
        message: message.to_string(),
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self, credential: &str) -> Result<TransportLink, CallError> {
        let mut request = self.url.as_str().into_client_request().map_err(unavailable)?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", credential)).map_err(unavailable)?,
        );

        let (stream, _) = connect_async(request).await.map_err(unavailable)?;
        info!("WebSocket connected to {}", self.url);

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SignalMessage>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<SignalEnvelope>(INBOUND_CAPACITY);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode '{}' signal: {}", message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("WebSocket writer stopped");
        });

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalEnvelope>(text.as_str()) {
                        Ok(envelope) => {
                            if inbound_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Skipping malformed signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
