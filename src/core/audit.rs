//! Conversation audit logging.
//!
//! The audit trail records what was actually said (user and assistant
//! messages with token/duration metadata) plus operational breadcrumbs.
//! Persistence lives elsewhere; this crate only defines the collaborator
//! contract and a tracing-backed default.

use serde_json::Value;

use crate::core::protocol::Usage;

/// Words per minute assumed when the provider does not report audio
/// duration.
const ESTIMATED_WPM: u64 = 150;

/// Collaborator receiving the conversation audit trail.
pub trait ConversationAudit: Send + Sync {
    /// A finalized user utterance.
    fn user_message(&self, item_id: &str, text: &str, audio_duration_ms: Option<u64>);

    /// One combined assistant message per completed response.
    fn assistant_message(&self, response_id: &str, text: &str, usage: Option<Usage>);

    /// Non-conversational operational marker.
    fn breadcrumb(&self, label: &str, data: &Value);
}

/// Default audit sink writing structured tracing events.
pub struct TracingAudit;

impl ConversationAudit for TracingAudit {
    fn user_message(&self, item_id: &str, text: &str, audio_duration_ms: Option<u64>) {
        tracing::info!(
            target: "audit",
            item_id,
            audio_duration_ms,
            "user: {}",
            text
        );
    }

    fn assistant_message(&self, response_id: &str, text: &str, usage: Option<Usage>) {
        tracing::info!(
            target: "audit",
            response_id,
            total_tokens = usage.map(|u| u.total_tokens),
            "assistant: {}",
            text
        );
    }

    fn breadcrumb(&self, label: &str, data: &Value) {
        tracing::info!(target: "audit", %data, "breadcrumb: {}", label);
    }
}

/// Rough audio duration for a transcript when the provider omits it.
pub fn estimate_audio_duration_ms(text: &str) -> u64 {
    let words = text.split_whitespace().count().max(1) as u64;
    words * 60_000 / ESTIMATED_WPM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_estimate_scales_with_words() {
        assert_eq!(estimate_audio_duration_ms("one two three"), 1200);
        // Empty text still counts as one word's worth.
        assert_eq!(estimate_audio_duration_ms(""), 400);
    }
}
