//! Session configuration and agent handoff.
//!
//! The controller builds outbound `session.update` payloads from agent
//! profiles and the registry, and performs transfers with context
//! carry-over. A transfer never fails silently: a destination profile
//! missing required fields is a hard error the caller sees.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

use super::{AgentContext, AgentProfile, AgentRegistry};
use crate::core::connection::{ConnectionError, ConnectionManager};
use crate::core::protocol::{
    ClientEvent, ConversationItem, InputAudioTranscription, SessionUpdate, TurnDetection,
};
use crate::core::response::ResponseScheduler;
use crate::core::tools::{SkillError, SkillHandler, ToolDescriptor, ToolRouter};
use crate::core::{SessionEvent, SessionEventSink};

/// Language policy block layered first into every composed instruction set.
pub const LANGUAGE_POLICY: &str = "Language policy: reply in the language the user is currently \
speaking, and keep using it until the user explicitly asks you to switch.";

/// Errors raised by session updates and transfers.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Unknown destination agent: {0}")]
    UnknownDestination(String),

    #[error("Agent profile '{0}' is missing required field '{1}'")]
    IncompleteProfile(String, &'static str),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Success record returned by a transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub destination: String,
    /// Unix epoch milliseconds
    pub transferred_at_ms: u64,
}

/// Builds session configuration and performs agent handoff.
pub struct SessionController {
    registry: AgentRegistry,
    manager: ConnectionManager,
    scheduler: ResponseScheduler,
    router: ToolRouter,
    profiles: Arc<HashMap<String, AgentProfile>>,
    sink: SessionEventSink,
    /// Last turn-detection policy sent, replayed on reactivation
    last_turn_detection: parking_lot::Mutex<Option<TurnDetection>>,
}

impl SessionController {
    pub fn new(
        registry: AgentRegistry,
        manager: ConnectionManager,
        scheduler: ResponseScheduler,
        router: ToolRouter,
        profiles: Arc<HashMap<String, AgentProfile>>,
        sink: SessionEventSink,
    ) -> Self {
        Self {
            registry,
            manager,
            scheduler,
            router,
            profiles,
            sink,
            last_turn_detection: parking_lot::Mutex::new(None),
        }
    }

    /// Look up a configured agent profile.
    pub fn profile(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles.get(name)
    }

    /// The registry this controller drives.
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Activate `agent_name`, compose and send the session configuration,
    /// and optionally trigger a model response through the single-flight
    /// scheduler.
    ///
    /// Instructions are layered in a fixed order: language policy, the
    /// caller-provided base, the agent's system prompt, the carried-over
    /// context.
    pub async fn update_session_with_context(
        &self,
        agent_name: &str,
        base_instructions: &str,
        tools: &[ToolDescriptor],
        context: Option<&str>,
        trigger_response: bool,
        turn_detection: Option<TurnDetection>,
    ) -> Result<AgentContext, TransferError> {
        let record = self
            .registry
            .activate(agent_name, context.unwrap_or_default());

        let profile = self.profiles.get(agent_name);
        let instructions = compose_instructions(
            base_instructions,
            profile.and_then(|p| p.system_prompt.as_deref()),
            context,
        );

        self.router.install_agent_tools(tools);
        *self.last_turn_detection.lock() = turn_detection.clone();

        let session = SessionUpdate {
            instructions: Some(instructions),
            voice: profile.and_then(|p| p.voice.clone()),
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            input_audio_transcription: Some(InputAudioTranscription {
                model: "whisper-1".to_string(),
            }),
            turn_detection,
            tools: Some(tools.iter().map(|d| d.definition.clone()).collect()),
            tool_choice: Some("auto".to_string()),
        };
        self.manager
            .send(ClientEvent::SessionUpdate { session })
            .await?;

        let _ = self.sink.send(SessionEvent::AgentChanged {
            agent: agent_name.to_string(),
        });

        if trigger_response {
            let item = ConversationItem::message(
                "system",
                &format!(
                    "You are now continuing this conversation as {agent_name}. \
                     Pick up naturally from the context above."
                ),
            );
            self.manager
                .send(ClientEvent::ConversationItemCreate { item })
                .await?;
            self.scheduler
                .request_response(
                    Some(json!({"agent": agent_name, "trigger": "activation"})),
                    "agent-activation",
                )
                .await;
        }

        Ok(record)
    }

    /// Hand the session off to `destination`, carrying context over.
    ///
    /// Turn detection is selected from the input mode: `null` while
    /// push-to-talk is active, the voice-activity configuration otherwise.
    pub async fn transfer_to_agent_with_context(
        &self,
        source: &str,
        destination: &str,
        rationale: &str,
        context: &str,
        push_to_talk: bool,
    ) -> Result<TransferOutcome, TransferError> {
        let profile = self
            .profiles
            .get(destination)
            .ok_or_else(|| TransferError::UnknownDestination(destination.to_string()))?;
        if profile.instructions.trim().is_empty() {
            return Err(TransferError::IncompleteProfile(
                destination.to_string(),
                "instructions",
            ));
        }

        let transfer_context = format_transfer_context(source, destination, rationale, context);
        let turn_detection = if push_to_talk {
            None
        } else {
            Some(TurnDetection::server_vad_default())
        };

        let tools = profile.tools.clone();
        let instructions = profile.instructions.clone();
        self.update_session_with_context(
            destination,
            &instructions,
            &tools,
            Some(&transfer_context),
            true,
            turn_detection,
        )
        .await?;

        tracing::info!(source, destination, rationale, "Agent transfer complete");
        Ok(TransferOutcome {
            destination: destination.to_string(),
            transferred_at_ms: epoch_ms(),
        })
    }

    /// Re-issue the active agent's session configuration. Run by the
    /// connection manager's hook after a successful reconnection; never on
    /// an explicit first connect.
    pub async fn reactivate_active_agent(&self) {
        let Some(record) = self.registry.active() else {
            return;
        };
        let Some(profile) = self.profiles.get(&record.name) else {
            tracing::warn!(agent = %record.name, "No profile for active agent; skipping reactivation");
            return;
        };

        let turn_detection = self.last_turn_detection.lock().clone();
        let context = (!record.summary.is_empty()).then_some(record.summary.clone());
        let tools = profile.tools.clone();
        let instructions = profile.instructions.clone();
        let name = record.name.clone();
        if let Err(e) = self
            .update_session_with_context(
                &name,
                &instructions,
                &tools,
                context.as_deref(),
                false,
                turn_detection,
            )
            .await
        {
            tracing::warn!(agent = %name, "Failed to reactivate agent after reconnect: {}", e);
        }
    }
}

fn compose_instructions(
    base: &str,
    system_prompt: Option<&str>,
    context: Option<&str>,
) -> String {
    let mut blocks = vec![LANGUAGE_POLICY];
    if !base.trim().is_empty() {
        blocks.push(base);
    }
    if let Some(prompt) = system_prompt
        && !prompt.trim().is_empty()
    {
        blocks.push(prompt);
    }
    if let Some(context) = context
        && !context.trim().is_empty()
    {
        blocks.push(context);
    }
    blocks.join("\n\n")
}

fn format_transfer_context(
    source: &str,
    destination: &str,
    rationale: &str,
    context: &str,
) -> String {
    format!(
        "Handoff: {source} -> {destination}. Reason: {rationale}. \
         Conversation so far: {context}. \
         Continue in the exact language the user has been speaking; \
         do not switch languages because of this handoff."
    )
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// Transfer as a skill
// =============================================================================

/// Exposes agent transfer to the model as a tool call. Routed through the
/// controller so a transfer initiated by the model behaves exactly like an
/// explicit one.
pub struct TransferSkill {
    controller: Arc<SessionController>,
    ptt_active: Arc<AtomicBool>,
}

impl TransferSkill {
    pub fn new(controller: Arc<SessionController>, ptt_active: Arc<AtomicBool>) -> Self {
        Self {
            controller,
            ptt_active,
        }
    }
}

#[async_trait]
impl SkillHandler for TransferSkill {
    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, SkillError> {
        let destination = args
            .get("destination_agent")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SkillError::InvalidArguments("destination_agent is required".to_string())
            })?;
        let rationale = args
            .get("rationale")
            .and_then(Value::as_str)
            .unwrap_or("unspecified");
        let context = args
            .get("conversation_context")
            .and_then(Value::as_str)
            .unwrap_or("");
        let source = self
            .controller
            .registry()
            .active()
            .map(|r| r.name)
            .unwrap_or_else(|| "unknown".to_string());

        let outcome = self
            .controller
            .transfer_to_agent_with_context(
                &source,
                destination,
                rationale,
                context,
                self.ptt_active.load(Ordering::SeqCst),
            )
            .await
            .map_err(|e| SkillError::Handler(e.to_string()))?;

        Ok(json!({
            "success": true,
            "destination": outcome.destination,
            "transferred_at_ms": outcome.transferred_at_ms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_instructions_layering_order() {
        let composed = compose_instructions("base block", Some("agent prompt"), Some("ctx"));
        let policy_at = composed.find(LANGUAGE_POLICY).unwrap();
        let base_at = composed.find("base block").unwrap();
        let prompt_at = composed.find("agent prompt").unwrap();
        let ctx_at = composed.find("ctx").unwrap();
        assert!(policy_at < base_at && base_at < prompt_at && prompt_at < ctx_at);
    }

    #[test]
    fn test_compose_instructions_skips_empty_blocks() {
        let composed = compose_instructions("base", None, Some("   "));
        assert!(!composed.contains("   \n"));
        assert!(composed.ends_with("base"));
    }

    #[test]
    fn test_transfer_context_pins_language() {
        let context = format_transfer_context("default", "placeGuide", "user asked", "summary");
        assert!(context.contains("default -> placeGuide"));
        assert!(context.contains("do not switch languages"));
    }
}
