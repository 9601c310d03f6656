//! Core realtime session orchestration.
//!
//! Leaves first: `protocol` (wire events), `connection` (lifecycle and the
//! guarded send path), `dispatch` (inbound event loop and transcript
//! state), `agents` (context registry and transfer control), `response`
//! (single-flight scheduling), `tools` (function-call routing), `audit`
//! (conversation trail). `orchestrator` assembles them into one session.

pub mod agents;
pub mod audit;
pub mod connection;
pub mod dispatch;
pub mod orchestrator;
pub mod protocol;
pub mod response;
pub mod tools;

use serde::Serialize;
use tokio::sync::mpsc;

use dispatch::{ItemStatus, Role};

// Re-export the types most callers need.
pub use agents::{AgentProfile, AgentRegistry, SessionController, TransferError};
pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionResult, CredentialProvider,
    EphemeralCredential, HttpCredentialProvider, LinkStatus, MediaHandle, MediaSource,
    RealtimeTransport, WsTransport,
};
pub use dispatch::{EventDispatcher, GuardrailClassifier, TranscriptItem, TranscriptStore};
pub use orchestrator::{OrchestratorConfig, SessionError, SessionOrchestrator};
pub use response::{ResponseScheduler, SchedulerConfig, SingleFlight};
pub use tools::{
    FunctionCallRequest, SkillEndpoints, SkillError, SkillHandler, SkillKind, SkillRegistry,
    ToolDescriptor, ToolRouter,
};

/// Client-bound session notifications, consumed by the transcript/UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Link status changed
    Status {
        /// Disconnected, Connecting, or Connected
        status: String,
    },

    /// Transcript item created or updated
    TranscriptUpsert {
        item_id: String,
        role: Role,
        text: String,
        status: ItemStatus,
        /// Present once a guardrail verdict exists
        #[serde(skip_serializing_if = "Option::is_none")]
        guardrail_flagged: Option<bool>,
    },

    /// A different agent is now active
    AgentChanged { agent: String },

    /// Operational marker (session start and similar)
    Breadcrumb {
        label: String,
        data: serde_json::Value,
    },

    /// Upstream or session error surfaced to the client
    Error { message: String },
}

/// Sender half of the client-bound notification stream.
pub type SessionEventSink = mpsc::UnboundedSender<SessionEvent>;
