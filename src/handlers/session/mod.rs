//! Session WebSocket handler.
//!
//! Upgrades the browser connection and bridges it onto a dedicated
//! session orchestrator: JSON text frames drive the session API, binary
//! frames feed the upstream input audio buffer, and orchestrator events
//! stream back as JSON.

pub mod messages;

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::{select, time::Duration};
use tracing::{debug, error, info, warn};

use crate::core::connection::{FixedMediaSource, HttpCredentialProvider, WsTransport};
use crate::core::orchestrator::SessionOrchestrator;
use crate::core::SessionEvent;
use crate::state::AppState;

use messages::{ClientMessage, MessageRoute};

/// Client-bound channel depth.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// How often the idle check runs.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum idle time before the connection is closed as stale.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Session WebSocket handler.
///
/// `GET /session` upgrades to a WebSocket carrying the session protocol
/// defined in [`messages`].
pub async fn session_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("Session WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_session_socket(socket, state))
}

async fn handle_session_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Session WebSocket established");

    let (mut sender, mut receiver) = socket.split();
    let (route_tx, mut route_rx) = mpsc::channel::<MessageRoute>(CHANNEL_BUFFER_SIZE);

    // Sender task for client-bound traffic.
    let sender_task = tokio::spawn(async move {
        while let Some(route) = route_rx.recv().await {
            let result = match route {
                MessageRoute::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => sender.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!("Failed to serialize session event: {}", e);
                        continue;
                    }
                },
                MessageRoute::Close => {
                    info!("Closing session WebSocket");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = result {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    // One orchestrator per connection.
    let credentials = Arc::new(HttpCredentialProvider::new(
        state.config.credential_endpoint.clone(),
    ));
    let transport = Arc::new(WsTransport::new(state.config.realtime_endpoint.clone()));
    let media = Arc::new(FixedMediaSource::default());
    let mut orchestrator = match SessionOrchestrator::new(
        state.config.orchestrator_config(),
        credentials,
        media,
        transport,
    ) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to assemble session: {}", e);
            let _ = route_tx
                .send(MessageRoute::Event(SessionEvent::Error {
                    message: format!("Session setup failed: {e}"),
                }))
                .await;
            let _ = route_tx.send(MessageRoute::Close).await;
            sender_task.abort();
            return;
        }
    };

    // Forward orchestrator events to the client.
    let mut events = orchestrator
        .take_events()
        .expect("events taken once per session");
    let forward_tx = route_tx.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if forward_tx.send(MessageRoute::Event(event)).await.is_err() {
                break;
            }
        }
    });

    let mut last_activity = std::time::Instant::now();
    loop {
        select! {
            frame = receiver.next() => {
                last_activity = std::time::Instant::now();
                match frame {
                    Some(Ok(message)) => {
                        if !process_frame(message, &orchestrator, &route_tx).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Session WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!("Session WebSocket closed by client");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(IDLE_CHECK_INTERVAL) => {
                if last_activity.elapsed() > IDLE_TIMEOUT {
                    warn!(
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Closing stale session connection"
                    );
                    break;
                }
                debug!("Session idle check - still active");
            }
        }
    }

    // Cleanup
    forward_task.abort();
    sender_task.abort();
    orchestrator.disconnect().await;
    info!("Session WebSocket terminated");
}

/// Process one incoming frame; returns false to end the connection.
async fn process_frame(
    message: Message,
    orchestrator: &SessionOrchestrator,
    route_tx: &mpsc::Sender<MessageRoute>,
) -> bool {
    match message {
        Message::Text(text) => {
            let parsed: ClientMessage = match serde_json::from_str(&text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Unparseable client message: {}", e);
                    send_error(route_tx, format!("Invalid message format: {e}")).await;
                    return true;
                }
            };
            if let Err(e) = parsed.validate_size() {
                warn!("Client message rejected: {}", e);
                send_error(route_tx, e.to_string()).await;
                return true;
            }
            handle_client_message(parsed, orchestrator, route_tx).await
        }
        Message::Binary(data) => {
            if let Err(e) = orchestrator.append_audio(&data).await {
                debug!("Dropping audio frame: {}", e);
            }
            true
        }
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => {
            info!("Session close frame received");
            false
        }
    }
}

async fn handle_client_message(
    message: ClientMessage,
    orchestrator: &SessionOrchestrator,
    route_tx: &mpsc::Sender<MessageRoute>,
) -> bool {
    match message {
        ClientMessage::Preload => {
            if let Err(e) = orchestrator.preload().await {
                // Preload is opportunistic; connect will retry from scratch.
                debug!("Preload failed: {}", e);
            }
        }

        ClientMessage::Start {
            agent,
            push_to_talk,
        } => {
            orchestrator.set_push_to_talk(push_to_talk).await;
            if let Err(e) = orchestrator.connect().await {
                send_error(route_tx, format!("Failed to connect: {e}")).await;
                return true;
            }
            if let Some(agent) = agent
                && orchestrator.agents().active().map(|r| r.name) != Some(agent.clone())
                && let Err(e) = orchestrator.transfer(&agent, "client selected agent").await
            {
                send_error(route_tx, format!("Failed to activate agent: {e}")).await;
            }
        }

        ClientMessage::Text { text } => {
            if let Err(e) = orchestrator.send_text(&text).await {
                send_error(route_tx, format!("Failed to send text: {e}")).await;
            }
        }

        ClientMessage::SetPushToTalk { enabled } => {
            orchestrator.set_push_to_talk(enabled).await;
        }

        ClientMessage::PttPressed => orchestrator.push_to_talk_pressed().await,

        ClientMessage::PttReleased => orchestrator.push_to_talk_released().await,

        ClientMessage::CancelResponse => orchestrator.cancel_response().await,

        ClientMessage::Transfer {
            destination,
            rationale,
        } => {
            let rationale = rationale.as_deref().unwrap_or("client requested transfer");
            if let Err(e) = orchestrator.transfer(&destination, rationale).await {
                send_error(route_tx, format!("Transfer failed: {e}")).await;
            }
        }

        ClientMessage::Disconnect => {
            orchestrator.disconnect().await;
            let _ = route_tx.send(MessageRoute::Close).await;
            return false;
        }
    }
    true
}

async fn send_error(route_tx: &mpsc::Sender<MessageRoute>, message: String) {
    let _ = route_tx
        .send(MessageRoute::Event(SessionEvent::Error { message }))
        .await;
}
