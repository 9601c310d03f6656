//! Inbound protocol event dispatch.
//!
//! One dispatcher task consumes the ordered event queue the connection
//! manager feeds. Each handler runs to completion before the next event is
//! taken, so per-event state (dedup sets, the output-active flag, cooldown
//! stamps) needs no locking. Function calls found in a `response.done` are
//! awaited in array order; callers may rely on call N's side effects being
//! visible before call N+1 runs.

mod guardrail;
mod transcript;

pub use guardrail::{
    DenyListClassifier, GuardrailClassifier, GuardrailError, GuardrailVerdict, WORD_STRIDE,
};
pub use transcript::{ItemStatus, Role, TranscriptItem, TranscriptStore};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::audit::{ConversationAudit, estimate_audio_duration_ms};
use crate::core::connection::ConnectionManager;
use crate::core::protocol::{ClientEvent, ConversationItem, ServerEvent};
use crate::core::response::ResponseScheduler;
use crate::core::tools::{FunctionCallRequest, ToolRouter};
use crate::core::{SessionEvent, SessionEventSink};

/// Visible throttle window for streaming transcript deltas.
pub const TRANSCRIPT_THROTTLE: Duration = Duration::from_millis(100);

/// Cooldown between handled language-override requests.
const LANGUAGE_COOLDOWN: Duration = Duration::from_secs(10);

/// Placeholder shown for a user item whose transcription is pending.
const TRANSCRIBING_PLACEHOLDER: &str = "[Transcribing...]";

/// Placeholder stored when a transcription comes back empty.
const INAUDIBLE_PLACEHOLDER: &str = "[inaudible]";

static LANGUAGE_REQUEST: Lazy<Regex> = Lazy::new(|| {
    // Fixed phrase set for explicit language requests; the capture is the
    // requested language name.
    Regex::new(
        r"(?i)\b(?:please\s+)?(?:respond|reply|answer|speak|talk)(?:\s+to\s+me)?\s+(?:only\s+)?in\s+([a-zA-Z]+)\b",
    )
    .expect("static pattern")
});

/// Extract an explicitly requested reply language, if any.
fn detect_language_request(text: &str) -> Option<String> {
    let captures = LANGUAGE_REQUEST.captures(text)?;
    let language = captures.get(1)?.as_str();
    // The pattern also matches phrasing like "speak in a moment"; only
    // accept something that looks like a language name.
    const NOISE: &[&str] = &["a", "an", "the", "this", "that", "your", "my", "it"];
    if NOISE.contains(&language.to_lowercase().as_str()) {
        return None;
    }
    let mut chars = language.chars();
    let first = chars.next()?;
    Some(first.to_uppercase().collect::<String>() + chars.as_str())
}

/// Consumes the inbound event stream and drives the rest of the session.
pub struct EventDispatcher {
    manager: ConnectionManager,
    transcript: TranscriptStore,
    scheduler: ResponseScheduler,
    router: ToolRouter,
    guardrail: Arc<dyn GuardrailClassifier>,
    audit: Arc<dyn ConversationAudit>,
    sink: SessionEventSink,
    /// Shared with the session surface so cancellation can tell whether
    /// audio is actively playing
    output_active: Arc<AtomicBool>,

    primary_session: Option<String>,
    seen_sessions: HashSet<String>,
    seen_items: HashSet<String>,
    seen_responses: HashSet<String>,
    logged_transcriptions: HashSet<String>,
    last_language_override: Option<Instant>,
    guardrail_checked_words: HashMap<String, usize>,
}

impl EventDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: ConnectionManager,
        transcript: TranscriptStore,
        scheduler: ResponseScheduler,
        router: ToolRouter,
        guardrail: Arc<dyn GuardrailClassifier>,
        audit: Arc<dyn ConversationAudit>,
        sink: SessionEventSink,
        output_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            manager,
            transcript,
            scheduler,
            router,
            guardrail,
            audit,
            sink,
            output_active,
            primary_session: None,
            seen_sessions: HashSet::new(),
            seen_items: HashSet::new(),
            seen_responses: HashSet::new(),
            logged_transcriptions: HashSet::new(),
            last_language_override: None,
            guardrail_checked_words: HashMap::new(),
        }
    }

    /// Whether assistant audio is currently playing.
    pub fn output_active(&self) -> bool {
        self.output_active.load(Ordering::SeqCst)
    }

    /// The first session id seen on this transport, if any.
    pub fn primary_session(&self) -> Option<&str> {
        self.primary_session.as_deref()
    }

    /// Run the dispatch loop until the event queue closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        tracing::debug!("Dispatcher loop ended");
    }

    pub(crate) async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SessionCreated { session } => {
                if !self.seen_sessions.insert(session.id.clone()) {
                    tracing::debug!(session_id = %session.id, "Duplicate session.created ignored");
                    return;
                }
                if self.primary_session.is_none() {
                    self.primary_session = Some(session.id.clone());
                }
                let data = json!({"session_id": session.id, "model": session.model});
                self.audit.breadcrumb("session.started", &data);
                let _ = self.sink.send(SessionEvent::Breadcrumb {
                    label: "session.started".to_string(),
                    data,
                });
            }

            ServerEvent::OutputAudioStarted { .. } => {
                self.output_active.store(true, Ordering::SeqCst);
            }

            ServerEvent::OutputAudioStopped { .. } => {
                self.output_active.store(false, Ordering::SeqCst);
            }

            ServerEvent::ItemCreated { item } => self.on_item_created(item).await,

            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
                audio_duration_ms,
            } => {
                self.on_transcription_completed(&item_id, &transcript, audio_duration_ms)
                    .await
            }

            ServerEvent::AudioTranscriptDelta { item_id, delta } => {
                let running = self.transcript.append_delta(&item_id, &delta);
                self.maybe_classify(&item_id, running);
            }

            ServerEvent::ResponseDone { response } => {
                if !self.seen_responses.insert(response.id.clone()) {
                    tracing::debug!(response_id = %response.id, "Duplicate response.done ignored");
                    return;
                }
                // The completion signal the response lock waits for.
                self.scheduler.release();

                let mut assistant_batch: Vec<String> = Vec::new();
                let mut executed_calls = 0usize;

                for item in &response.output {
                    match item.item_type.as_str() {
                        "function_call" => {
                            let (Some(call_id), Some(name)) = (&item.call_id, &item.name) else {
                                tracing::warn!("function_call output missing call_id or name");
                                continue;
                            };
                            let request = FunctionCallRequest {
                                call_id: call_id.clone(),
                                name: name.clone(),
                                raw_arguments: item.arguments.clone().unwrap_or_default(),
                            };
                            // Awaited before the next output item so calls
                            // execute in the order they appear.
                            self.router.execute(request).await;
                            executed_calls += 1;
                        }
                        "message" if item.role.as_deref() == Some("assistant") => {
                            let text = item.text();
                            if !text.is_empty() {
                                assistant_batch.push(text);
                            }
                        }
                        _ => {}
                    }
                }

                if !assistant_batch.is_empty() {
                    // One combined log entry per response, not one per fragment.
                    self.audit.assistant_message(
                        &response.id,
                        &assistant_batch.join("\n"),
                        response.usage,
                    );
                }

                if executed_calls > 0 {
                    self.scheduler
                        .request_response(
                            Some(json!({"trigger": "tool_followup"})),
                            "tool-followup",
                        )
                        .await;
                }
            }

            ServerEvent::OutputItemDone { item } => {
                if let Some(id) = &item.id {
                    self.transcript.mark_done(id);
                }
            }

            ServerEvent::Error { error } => {
                tracing::error!(
                    code = error.code.as_deref(),
                    "Upstream error: {}",
                    error.message
                );
                let _ = self.sink.send(SessionEvent::Error {
                    message: error.message,
                });
            }

            ServerEvent::Unhandled => {
                tracing::trace!("Unhandled server event");
            }
        }
    }

    async fn on_item_created(&mut self, item: ConversationItem) {
        let Some(item_id) = item.id.clone() else {
            return;
        };
        if !self.seen_items.insert(item_id.clone()) {
            return; // at-most-once creation
        }

        match item.role.as_deref() {
            // System items are operational scaffolding, never surfaced.
            Some("system") => {}

            Some("user") => {
                let text = item.text();
                if text.is_empty() {
                    self.transcript
                        .insert(&item_id, Role::User, TRANSCRIBING_PLACEHOLDER);
                } else {
                    self.transcript.insert(&item_id, Role::User, &text);
                    self.maybe_handle_language_request(&text).await;
                }
            }

            Some("assistant") => {
                self.transcript.insert(&item_id, Role::Assistant, &item.text());
            }

            _ => {}
        }
    }

    async fn on_transcription_completed(
        &mut self,
        item_id: &str,
        transcript: &str,
        audio_duration_ms: Option<u64>,
    ) {
        let text = if transcript.trim().is_empty() {
            INAUDIBLE_PLACEHOLDER.to_string()
        } else {
            transcript.trim().to_string()
        };

        if !self.transcript.contains(item_id) {
            self.seen_items.insert(item_id.to_string());
            self.transcript.insert(item_id, Role::User, "");
        }
        self.transcript.finalize_text(item_id, &text);

        // Audit exactly once per item however often the event repeats.
        if self.logged_transcriptions.insert(item_id.to_string()) {
            let duration = audio_duration_ms.unwrap_or_else(|| estimate_audio_duration_ms(&text));
            self.audit.user_message(item_id, &text, Some(duration));
        }

        if text != INAUDIBLE_PLACEHOLDER {
            self.maybe_handle_language_request(&text).await;
        }
    }

    /// Language-override flow: clear in-flight audio and schedule one
    /// debounced response request carrying the override.
    async fn maybe_handle_language_request(&mut self, text: &str) {
        let Some(language) = detect_language_request(text) else {
            return;
        };
        if let Some(last) = self.last_language_override
            && last.elapsed() < LANGUAGE_COOLDOWN
        {
            tracing::debug!(%language, "Language override suppressed by cooldown");
            return;
        }
        self.last_language_override = Some(Instant::now());
        tracing::info!(%language, "Explicit language request detected");

        let _ = self.manager.send(ClientEvent::InputAudioBufferClear).await;
        if self.output_active.load(Ordering::SeqCst) {
            let _ = self.manager.send(ClientEvent::OutputAudioBufferClear).await;
        }
        self.scheduler.request_response_debounced(
            Some(json!({"language_override": language})),
            "language-override",
        );
    }

    /// Best-effort guardrail check every [`WORD_STRIDE`] words of running
    /// assistant text. Failures are logged and swallowed.
    fn maybe_classify(&mut self, item_id: &str, running: String) {
        let words = guardrail::word_count(&running);
        let checked = self
            .guardrail_checked_words
            .get(item_id)
            .copied()
            .unwrap_or(0);
        if !guardrail::stride_crossed(checked, words) {
            return;
        }
        self.guardrail_checked_words
            .insert(item_id.to_string(), words);

        let classifier = self.guardrail.clone();
        let transcript = self.transcript.clone();
        let item_id = item_id.to_string();
        tokio::spawn(async move {
            match classifier.classify(&running).await {
                Ok(verdict) if verdict.flagged => {
                    tracing::warn!(
                        item_id = %item_id,
                        category = verdict.category.as_deref(),
                        "Guardrail flagged assistant output"
                    );
                    transcript.annotate_guardrail(&item_id, verdict);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(item_id = %item_id, "Guardrail check failed: {}", e);
                }
            }
        });
    }
}

// =============================================================================
// Tests
// =============================================================================
