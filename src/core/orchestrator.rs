//! Session assembly.
//!
//! Builds the component graph for one logical session (connection manager,
//! dispatcher, transcript store, scheduler, router, transfer controller),
//! owns the dispatcher task, and exposes the session-level API the
//! serving layer drives.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::agents::{
    AgentProfile, AgentRegistry, SessionController, TransferError, TransferOutcome, TransferSkill,
};
use crate::core::audit::{ConversationAudit, TracingAudit};
use crate::core::connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, ConnectionResult, CredentialProvider,
    LinkStatus, MediaSource, RealtimeTransport,
};
use crate::core::dispatch::{
    DenyListClassifier, EventDispatcher, GuardrailClassifier, TRANSCRIPT_THROTTLE, TranscriptStore,
};
use crate::core::protocol::{ClientEvent, ConversationItem, TurnDetection};
use crate::core::response::{ResponseScheduler, SchedulerConfig};
use crate::core::tools::{DescriptorError, SkillEndpoints, SkillRegistry, ToolRouter};
use crate::core::{SessionEvent, SessionEventSink};

/// Queue depth between the connection manager and the dispatcher.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Errors surfaced by the session API.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
}

/// Configuration for one session orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub connection: ConnectionConfig,
    pub scheduler: SchedulerConfig,
    pub skills: SkillEndpoints,
    /// Agent activated on an explicit connect
    pub default_agent: String,
    pub profiles: Vec<AgentProfile>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            scheduler: SchedulerConfig::default(),
            skills: SkillEndpoints::default(),
            default_agent: "default".to_string(),
            profiles: vec![AgentProfile {
                name: "default".to_string(),
                instructions: "You are a helpful, concise voice assistant.".to_string(),
                system_prompt: None,
                voice: None,
                tools: Vec::new(),
            }],
        }
    }
}

/// One logical user session.
pub struct SessionOrchestrator {
    manager: ConnectionManager,
    scheduler: ResponseScheduler,
    controller: Arc<SessionController>,
    transcript: TranscriptStore,
    agents: AgentRegistry,
    sink: SessionEventSink,
    /// Input mode; true while the client holds the talk control
    ptt_mode: Arc<AtomicBool>,
    /// Mirrors upstream output_audio_buffer.started/stopped
    output_active: Arc<AtomicBool>,
    default_agent: String,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    dispatcher_task: JoinHandle<()>,
}

impl SessionOrchestrator {
    /// Assemble a session with the default guardrail and audit sinks.
    pub fn new(
        config: OrchestratorConfig,
        credentials: Arc<dyn CredentialProvider>,
        media: Arc<dyn MediaSource>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Result<Self, SessionError> {
        Self::with_collaborators(
            config,
            credentials,
            media,
            transport,
            Arc::new(DenyListClassifier::default()),
            Arc::new(TracingAudit),
        )
    }

    /// Assemble a session with explicit guardrail and audit collaborators.
    pub fn with_collaborators(
        config: OrchestratorConfig,
        credentials: Arc<dyn CredentialProvider>,
        media: Arc<dyn MediaSource>,
        transport: Arc<dyn RealtimeTransport>,
        guardrail: Arc<dyn GuardrailClassifier>,
        audit: Arc<dyn ConversationAudit>,
    ) -> Result<Self, SessionError> {
        // Descriptor tables are immutable for the session; reject bad
        // parameter mappings here rather than overwriting silently later.
        for profile in &config.profiles {
            for descriptor in &profile.tools {
                descriptor.validate()?;
            }
        }
        let profiles: Arc<HashMap<String, AgentProfile>> = Arc::new(
            config
                .profiles
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        );
        if !profiles.contains_key(&config.default_agent) {
            return Err(SessionError::UnknownAgent(config.default_agent));
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (sink, events) = mpsc::unbounded_channel();

        let manager = ConnectionManager::new(
            config.connection,
            credentials,
            media,
            transport,
            event_tx,
        );
        let transcript = TranscriptStore::new(TRANSCRIPT_THROTTLE, sink.clone());
        let scheduler = ResponseScheduler::new(config.scheduler, manager.clone());
        let skills = Arc::new(SkillRegistry::new(config.skills));
        let router = ToolRouter::new(skills.clone(), manager.clone());
        let agents = AgentRegistry::new();

        let controller = Arc::new(SessionController::new(
            agents.clone(),
            manager.clone(),
            scheduler.clone(),
            router.clone(),
            profiles,
            sink.clone(),
        ));

        let ptt_mode = Arc::new(AtomicBool::new(false));
        skills.set_transfer_handler(Arc::new(TransferSkill::new(
            controller.clone(),
            ptt_mode.clone(),
        )));

        let hook_controller = controller.clone();
        manager.set_reactivation_hook(Arc::new(move || {
            let controller = hook_controller.clone();
            Box::pin(async move {
                controller.reactivate_active_agent().await;
            })
        }));

        let output_active = Arc::new(AtomicBool::new(false));
        let dispatcher = EventDispatcher::new(
            manager.clone(),
            transcript.clone(),
            scheduler.clone(),
            router,
            guardrail,
            audit,
            sink.clone(),
            output_active.clone(),
        );
        let dispatcher_task = tokio::spawn(dispatcher.run(event_rx));

        Ok(Self {
            manager,
            scheduler,
            controller,
            transcript,
            agents,
            sink,
            ptt_mode,
            output_active,
            default_agent: config.default_agent,
            events: Some(events),
            dispatcher_task,
        })
    }

    /// Take the client-bound event stream. Yields `None` after the first
    /// call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Warm the credential and media caches.
    pub async fn preload(&self) -> ConnectionResult<()> {
        self.manager.preload().await
    }

    /// Connect and activate the configured default agent.
    ///
    /// An explicit connect always starts from the default agent; only the
    /// reconnection path restores a previously active one.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.emit_status(LinkStatus::Connecting);
        if let Err(e) = self.manager.connect().await {
            self.emit_status(LinkStatus::Disconnected);
            return Err(e.into());
        }
        self.emit_status(LinkStatus::Connected);

        let profile = self
            .controller
            .profile(&self.default_agent)
            .cloned()
            .ok_or_else(|| SessionError::UnknownAgent(self.default_agent.clone()))?;
        self.controller
            .update_session_with_context(
                &profile.name,
                &profile.instructions,
                &profile.tools,
                None,
                false,
                self.current_turn_detection(),
            )
            .await?;
        Ok(())
    }

    /// Tear the session down. Safe to call at any time.
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
        self.scheduler.release();
        self.emit_status(LinkStatus::Disconnected);
    }

    /// Send a typed user message and ask for a reply.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        let item = ConversationItem::message("user", text);
        self.manager
            .send(ClientEvent::ConversationItemCreate { item })
            .await?;
        self.scheduler.request_response(None, "user-text").await;
        Ok(())
    }

    /// Forward captured audio to the upstream input buffer.
    pub async fn append_audio(&self, data: &[u8]) -> Result<(), SessionError> {
        self.manager.send(ClientEvent::audio_append(data)).await?;
        Ok(())
    }

    /// Switch input mode. When connected, re-issues the session
    /// configuration so the turn-detection policy matches.
    pub async fn set_push_to_talk(&self, enabled: bool) {
        let previous = self.ptt_mode.swap(enabled, Ordering::SeqCst);
        if previous == enabled || self.manager.status() != LinkStatus::Connected {
            return;
        }
        let Some(record) = self.agents.active() else {
            return;
        };
        let Some(profile) = self.controller.profile(&record.name).cloned() else {
            return;
        };
        let context = (!record.summary.is_empty()).then_some(record.summary);
        if let Err(e) = self
            .controller
            .update_session_with_context(
                &profile.name,
                &profile.instructions,
                &profile.tools,
                context.as_deref(),
                false,
                self.current_turn_detection(),
            )
            .await
        {
            tracing::warn!("Failed to apply input mode change: {}", e);
        }
    }

    /// Talk control pressed: drop buffered input and interrupt the
    /// assistant if it is speaking.
    pub async fn push_to_talk_pressed(&self) {
        let _ = self.manager.send(ClientEvent::InputAudioBufferClear).await;
        self.scheduler
            .cancel_active(self.output_active.load(Ordering::SeqCst))
            .await;
    }

    /// Talk control released: commit the captured turn and request a
    /// reply.
    pub async fn push_to_talk_released(&self) {
        let _ = self.manager.send(ClientEvent::InputAudioBufferCommit).await;
        self.scheduler.request_response(None, "push-to-talk").await;
    }

    /// Cancel the in-flight assistant reply.
    pub async fn cancel_response(&self) {
        self.scheduler
            .cancel_active(self.output_active.load(Ordering::SeqCst))
            .await;
    }

    /// Explicit (client-driven) agent transfer.
    pub async fn transfer(
        &self,
        destination: &str,
        rationale: &str,
    ) -> Result<TransferOutcome, SessionError> {
        let source = self.agents.active();
        let source_name = source
            .as_ref()
            .map(|r| r.name.as_str())
            .unwrap_or(&self.default_agent);
        let context = source.as_ref().map(|r| r.summary.as_str()).unwrap_or("");
        let outcome = self
            .controller
            .transfer_to_agent_with_context(
                source_name,
                destination,
                rationale,
                context,
                self.ptt_mode.load(Ordering::SeqCst),
            )
            .await?;
        Ok(outcome)
    }

    /// Current link status.
    pub fn status(&self) -> LinkStatus {
        self.manager.status()
    }

    /// The session transcript.
    pub fn transcript(&self) -> &TranscriptStore {
        &self.transcript
    }

    /// The agent registry.
    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    fn current_turn_detection(&self) -> Option<TurnDetection> {
        if self.ptt_mode.load(Ordering::SeqCst) {
            None
        } else {
            Some(TurnDetection::server_vad_default())
        }
    }

    fn emit_status(&self, status: LinkStatus) {
        let _ = self.sink.send(SessionEvent::Status {
            status: status.to_string(),
        });
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.dispatcher_task.abort();
    }
}

// =============================================================================
// Tests
// =============================================================================
