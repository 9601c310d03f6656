//! Browser-facing session message types.
//!
//! Text frames carry a tagged JSON protocol; binary frames carry input
//! audio passed straight through to the upstream input buffer.
//! Server-bound messages are validated for size before handling.

use serde::{Deserialize, Serialize};

use crate::core::SessionEvent;

/// Maximum allowed size for text messages (50 KB)
pub const MAX_TEXT_SIZE: usize = 50 * 1024;

/// Maximum allowed size for transfer context/rationale fields (8 KB)
pub const MAX_TRANSFER_FIELD_SIZE: usize = 8 * 1024;

// =============================================================================
// Incoming Messages (Browser -> Gateway)
// =============================================================================

/// Incoming WebSocket messages from the browser client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Warm credential and media caches ahead of `start`
    Preload,

    /// Open the upstream session and activate the starting agent
    Start {
        /// Agent to hand off to after the default activates
        #[serde(default)]
        agent: Option<String>,
        /// Start in push-to-talk mode (no server turn detection)
        #[serde(default)]
        push_to_talk: bool,
    },

    /// Typed user message
    Text {
        /// Text content
        text: String,
    },

    /// Toggle push-to-talk input mode mid-session
    SetPushToTalk {
        /// New mode
        enabled: bool,
    },

    /// Talk control pressed
    PttPressed,

    /// Talk control released
    PttReleased,

    /// Cancel the in-flight assistant reply
    CancelResponse,

    /// Hand the session to a different agent
    Transfer {
        /// Destination agent name
        destination: String,
        /// Why the client asked for the handoff
        #[serde(default)]
        rationale: Option<String>,
    },

    /// Tear the upstream session down and close
    Disconnect,
}

/// Error type for message validation failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Text too large: {size} bytes (max: {max} bytes)")]
    TextTooLarge { size: usize, max: usize },

    #[error("Transfer field too large: {size} bytes (max: {max} bytes)")]
    TransferFieldTooLarge { size: usize, max: usize },
}

impl ClientMessage {
    /// Validates field sizes to prevent resource exhaustion.
    pub fn validate_size(&self) -> Result<(), ValidationError> {
        match self {
            ClientMessage::Text { text } => {
                if text.len() > MAX_TEXT_SIZE {
                    return Err(ValidationError::TextTooLarge {
                        size: text.len(),
                        max: MAX_TEXT_SIZE,
                    });
                }
            }
            ClientMessage::Transfer {
                destination,
                rationale,
            } => {
                let size = destination.len()
                    + rationale.as_ref().map(String::len).unwrap_or_default();
                if size > MAX_TRANSFER_FIELD_SIZE {
                    return Err(ValidationError::TransferFieldTooLarge {
                        size,
                        max: MAX_TRANSFER_FIELD_SIZE,
                    });
                }
            }
            ClientMessage::Preload
            | ClientMessage::Start { .. }
            | ClientMessage::SetPushToTalk { .. }
            | ClientMessage::PttPressed
            | ClientMessage::PttReleased
            | ClientMessage::CancelResponse
            | ClientMessage::Disconnect => {}
        }
        Ok(())
    }
}

// =============================================================================
// Message Routing
// =============================================================================

/// Routing for client-bound traffic.
pub enum MessageRoute {
    /// JSON-encoded session event
    Event(SessionEvent),
    /// Close the connection
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_message_deserialization() {
        let json = r#"{"type": "start", "agent": "placeGuide", "push_to_talk": true}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("Should deserialize");
        match msg {
            ClientMessage::Start {
                agent,
                push_to_talk,
            } => {
                assert_eq!(agent.as_deref(), Some("placeGuide"));
                assert!(push_to_talk);
            }
            _ => panic!("Expected Start variant"),
        }
    }

    #[test]
    fn test_start_defaults() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "start"}"#).unwrap();
        match msg {
            ClientMessage::Start {
                agent,
                push_to_talk,
            } => {
                assert!(agent.is_none());
                assert!(!push_to_talk);
            }
            _ => panic!("Expected Start variant"),
        }
    }

    #[test]
    fn test_transfer_message_deserialization() {
        let json = r#"{"type": "transfer", "destination": "placeGuide"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Transfer {
                destination,
                rationale,
            } => {
                assert_eq!(destination, "placeGuide");
                assert!(rationale.is_none());
            }
            _ => panic!("Expected Transfer variant"),
        }
    }

    #[test]
    fn test_text_within_limit() {
        let msg = ClientMessage::Text {
            text: "a".repeat(MAX_TEXT_SIZE),
        };
        assert!(msg.validate_size().is_ok());
    }

    #[test]
    fn test_text_exceeds_limit() {
        let msg = ClientMessage::Text {
            text: "a".repeat(MAX_TEXT_SIZE + 1),
        };
        assert!(matches!(
            msg.validate_size(),
            Err(ValidationError::TextTooLarge { .. })
        ));
    }

    #[test]
    fn test_session_event_serialization_shape() {
        let event = SessionEvent::AgentChanged {
            agent: "placeGuide".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"agent_changed""#));
        assert!(json.contains(r#""agent":"placeGuide""#));
    }
}
