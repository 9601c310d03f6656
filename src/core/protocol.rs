//! Wire protocol for the upstream realtime session.
//!
//! All events are JSON objects tagged by a `type` field and travel over the
//! ordered, reliable transport channel owned by the connection manager.
//!
//! # Protocol Overview
//!
//! Client events (sent upstream):
//! - session.update - Replace session configuration
//! - input_audio_buffer.append - Append audio to the input buffer
//! - input_audio_buffer.commit - Commit the input buffer as a user turn
//! - input_audio_buffer.clear - Drop buffered input audio
//! - output_audio_buffer.clear - Drop buffered output audio
//! - conversation.item.create - Add an item to the conversation
//! - response.create - Ask the model to generate a reply
//! - response.cancel - Cancel the in-flight reply
//!
//! Server events (received from upstream):
//! - session.created
//! - output_audio_buffer.started | stopped
//! - conversation.item.created
//! - conversation.item.input_audio_transcription.completed
//! - response.audio_transcript.delta
//! - response.output_item.done
//! - response.done
//! - error

use base64::prelude::*;
use serde::{Deserialize, Serialize};

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration payload for `session.update`.
///
/// `turn_detection` is always serialized, even when `None`: a `null` value
/// is how push-to-talk disables server-side turn detection, which is not
/// the same as omitting the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionUpdate {
    /// Composed system instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Voice for audio output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Response modalities (text, audio)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// Input audio transcription configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    /// Turn detection policy; `null` disables it (push-to-talk)
    pub turn_detection: Option<TurnDetection>,

    /// Model-facing tool definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    /// Tool choice strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
}

/// Turn detection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Server-side voice activity detection
    #[serde(rename = "server_vad")]
    ServerVad {
        /// Activation threshold (0.0 to 1.0)
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        /// Audio prefix padding in ms
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        /// Silence duration before end of turn in ms
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
        /// Whether to create a response on turn end
        #[serde(skip_serializing_if = "Option::is_none")]
        create_response: Option<bool>,
        /// Whether speech interrupts model output
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupt_response: Option<bool>,
    },
}

impl TurnDetection {
    /// Voice-activity configuration used when push-to-talk is off.
    pub fn server_vad_default() -> Self {
        TurnDetection::ServerVad {
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
            create_response: Some(true),
            interrupt_response: Some(true),
        }
    }
}

/// Model-facing tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    /// Tool type (always "function")
    #[serde(rename = "type")]
    pub tool_type: String,
    /// Function name the model calls
    pub name: String,
    /// Function description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

// =============================================================================
// Conversation Items
// =============================================================================

/// Conversation item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationItem {
    /// Item ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item type (message, function_call, function_call_output)
    #[serde(rename = "type")]
    pub item_type: String,
    /// Item status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Item role (user, assistant, system)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
    /// Call ID for function calls and their outputs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Function name for function calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Serialized function arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Serialized function output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ConversationItem {
    /// Build a text message item for the given role.
    pub fn message(role: &str, text: &str) -> Self {
        let content_type = if role == "assistant" {
            "text"
        } else {
            "input_text"
        };
        Self {
            id: None,
            item_type: "message".to_string(),
            status: None,
            role: Some(role.to_string()),
            content: Some(vec![ContentPart {
                content_type: content_type.to_string(),
                text: Some(text.to_string()),
                transcript: None,
            }]),
            call_id: None,
            name: None,
            arguments: None,
            output: None,
        }
    }

    /// Build a function call output item echoing `call_id`.
    pub fn function_call_output(call_id: &str, output: &str) -> Self {
        Self {
            id: None,
            item_type: "function_call_output".to_string(),
            status: None,
            role: None,
            content: None,
            call_id: Some(call_id.to_string()),
            name: None,
            arguments: None,
            output: Some(output.to_string()),
        }
    }

    /// Concatenated text of all textual content parts.
    pub fn text(&self) -> String {
        let Some(parts) = &self.content else {
            return String::new();
        };
        parts
            .iter()
            .filter_map(|p| p.text.as_deref().or(p.transcript.as_deref()))
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Content part within a conversation item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type (input_text, input_audio, text, audio)
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Transcript of audio content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

// =============================================================================
// Client Events (sent upstream)
// =============================================================================

/// Client events sent over the transport channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Replace session configuration
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration
        session: SessionUpdate,
    },

    /// Append audio to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio data
        audio: String,
    },

    /// Commit the input audio buffer as a user turn
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Clear the input audio buffer
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Clear the output audio buffer (stops playback server-side)
    #[serde(rename = "output_audio_buffer.clear")]
    OutputAudioBufferClear,

    /// Create a conversation item
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// Item to create
        item: ConversationItem,
    },

    /// Ask the model to generate a reply
    #[serde(rename = "response.create")]
    ResponseCreate {
        /// Response options
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseOptions>,
    },

    /// Cancel the in-flight reply
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Create an audio append event from raw bytes.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }
}

/// Options attached to a `response.create` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseOptions {
    /// Opaque metadata echoed back in the matching `response.done`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// =============================================================================
// Server Events (received from upstream)
// =============================================================================

/// Server events received over the transport channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Error occurred
    #[serde(rename = "error")]
    Error {
        /// Error details
        error: ApiError,
    },

    /// Session created
    #[serde(rename = "session.created")]
    SessionCreated {
        /// Session information
        session: SessionInfo,
    },

    /// Assistant audio playback started
    #[serde(rename = "output_audio_buffer.started")]
    OutputAudioStarted {
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Assistant audio playback stopped
    #[serde(rename = "output_audio_buffer.stopped")]
    OutputAudioStopped {
        /// Response ID
        #[serde(default)]
        response_id: Option<String>,
    },

    /// Conversation item created
    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        /// Created item
        item: ConversationItem,
    },

    /// Input audio transcription completed
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        /// Item ID
        item_id: String,
        /// Transcript text
        transcript: String,
        /// Audio duration when the provider reports it
        #[serde(default)]
        audio_duration_ms: Option<u64>,
    },

    /// Assistant audio transcript delta
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        /// Item ID
        item_id: String,
        /// Transcript delta
        delta: String,
    },

    /// Output item finished streaming
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        /// Item
        item: ConversationItem,
    },

    /// Response complete
    #[serde(rename = "response.done")]
    ResponseDone {
        /// Response envelope
        response: ResponseEnvelope,
    },

    /// Any event type this gateway does not act on
    #[serde(other)]
    Unhandled,
}

// =============================================================================
// Supporting Types
// =============================================================================

/// API error information.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiError {
    /// Error type
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message
    pub message: String,
}

/// Session information from `session.created`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Session ID
    pub id: String,
    /// Model in use
    #[serde(default)]
    pub model: Option<String>,
}

/// Response envelope from `response.done`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    /// Response ID
    pub id: String,
    /// Response status
    #[serde(default)]
    pub status: Option<String>,
    /// Output items
    #[serde(default)]
    pub output: Vec<ConversationItem>,
    /// Metadata echoed from `response.create`
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Token usage
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Token usage reported per response.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    /// Total tokens
    #[serde(default)]
    pub total_tokens: u32,
    /// Input tokens
    #[serde(default)]
    pub input_tokens: u32,
    /// Output tokens
    #[serde(default)]
    pub output_tokens: u32,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_serialization() {
        let event = ClientEvent::InputAudioBufferClear;
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("input_audio_buffer.clear"));
    }

    #[test]
    fn test_audio_append_round_trip() {
        let data = vec![0u8, 1, 2, 3];
        let event = ClientEvent::audio_append(&data);
        match event {
            ClientEvent::InputAudioBufferAppend { audio } => {
                assert_eq!(BASE64_STANDARD.decode(&audio).unwrap(), data);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_session_update_always_carries_turn_detection() {
        let event = ClientEvent::SessionUpdate {
            session: SessionUpdate {
                instructions: Some("Be helpful".to_string()),
                turn_detection: None,
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""turn_detection":null"#));

        let event = ClientEvent::SessionUpdate {
            session: SessionUpdate {
                turn_detection: Some(TurnDetection::server_vad_default()),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"server_vad""#));
    }

    #[test]
    fn test_function_call_output_item() {
        let item = ConversationItem::function_call_output("call_7", r#"{"success":true}"#);
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains(r#""call_id":"call_7""#));
        assert!(json.contains("function_call_output"));
    }

    #[test]
    fn test_item_text_joins_parts() {
        let item = ConversationItem {
            content: Some(vec![
                ContentPart {
                    content_type: "input_text".to_string(),
                    text: Some("boat to ".to_string()),
                    transcript: None,
                },
                ContentPart {
                    content_type: "input_audio".to_string(),
                    text: None,
                    transcript: Some("Phuket".to_string()),
                },
            ]),
            ..ConversationItem::message("user", "")
        };
        assert_eq!(item.text(), "boat to Phuket");
    }

    #[test]
    fn test_server_event_deserialization() {
        let json = r#"{
            "type": "session.created",
            "session": {"id": "sess_42", "model": "realtime-preview"}
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::SessionCreated { session } => assert_eq!(session.id, "sess_42"),
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_unknown_server_event_is_unhandled() {
        let json = r#"{"type": "rate_limits.updated", "rate_limits": []}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ServerEvent::Unhandled));
    }

    #[test]
    fn test_response_done_deserialization() {
        let json = r#"{
            "type": "response.done",
            "response": {
                "id": "resp_1",
                "status": "completed",
                "output": [
                    {"type": "function_call", "call_id": "call_1", "name": "lookup", "arguments": "{}"}
                ],
                "usage": {"total_tokens": 12, "input_tokens": 7, "output_tokens": 5}
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::ResponseDone { response } => {
                assert_eq!(response.id, "resp_1");
                assert_eq!(response.output.len(), 1);
                assert_eq!(response.usage.unwrap().total_tokens, 12);
            }
            _ => panic!("Wrong event type"),
        }
    }
}
