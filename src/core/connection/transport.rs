//! Transport channel abstraction and the WebSocket implementation.
//!
//! The orchestrator assumes an ordered, reliable, bidirectional channel
//! carrying JSON protocol events. `RealtimeTransport` hides how that
//! channel is established so tests can substitute a scripted transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::credentials::EphemeralCredential;
use super::media::MediaHandle;
use super::{ConnectionError, ConnectionResult};
use crate::core::protocol::{ClientEvent, ServerEvent};

/// Channel capacity for protocol events in each direction.
const CHANNEL_CAPACITY: usize = 256;

/// An open transport channel.
///
/// `inbound` yields protocol events until the channel closes; the receiver
/// returning `None` is the close signal. Dropping or cancelling `shutdown`
/// tears the channel down.
pub struct ChannelPair {
    /// Outbound protocol events
    pub outbound: mpsc::Sender<ClientEvent>,
    /// Inbound protocol events
    pub inbound: mpsc::Receiver<ServerEvent>,
    /// Cancels the underlying pump task
    pub shutdown: CancellationToken,
}

/// Factory for transport channels.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Negotiate a session and open the event channel.
    async fn open(
        &self,
        credential: &EphemeralCredential,
        media: &MediaHandle,
    ) -> ConnectionResult<ChannelPair>;
}

/// WebSocket transport to the upstream realtime endpoint.
pub struct WsTransport {
    endpoint: Url,
}

impl WsTransport {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }

    fn build_request(&self, credential: &EphemeralCredential) -> ConnectionResult<http::Request<()>> {
        let host = self
            .endpoint
            .host_str()
            .ok_or_else(|| ConnectionError::Transport("endpoint has no host".to_string()))?
            .to_string();

        http::Request::builder()
            .uri(self.endpoint.as_str())
            .header("Authorization", format!("Bearer {}", credential.value))
            .header("Sec-WebSocket-Protocol", "realtime")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", host)
            .body(())
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn open(
        &self,
        credential: &EphemeralCredential,
        media: &MediaHandle,
    ) -> ConnectionResult<ChannelPair> {
        let request = self.build_request(credential)?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        tracing::info!(
            endpoint = %self.endpoint,
            sample_rate = media.sample_rate,
            "Transport channel negotiated"
        );

        let (mut ws_sink, mut ws_source) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEvent>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ServerEvent>(CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let pump_token = shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_token.cancelled() => {
                        let _ = ws_sink.close().await;
                        break;
                    }

                    Some(event) = outbound_rx.recv() => {
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(e) => {
                                tracing::error!("Failed to serialize client event: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            tracing::error!("Failed to send on transport channel: {}", e);
                            break;
                        }
                    }

                    msg = ws_source.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(event) => {
                                        if inbound_tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Failed to parse server event: {} - {}", e, text);
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    tracing::error!("Failed to send pong: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(_))) => {
                                tracing::info!("Transport channel closed by server");
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::error!("Transport channel error: {}", e);
                                break;
                            }
                            None => break,
                            _ => {}
                        }
                    }
                }
            }
            // Dropping inbound_tx here ends the consumer's stream, which is
            // the close signal the connection manager reacts to.
        });

        Ok(ChannelPair {
            outbound: outbound_tx,
            inbound: inbound_rx,
            shutdown,
        })
    }
}
