//! Best-effort guardrail classification of streaming assistant text.
//!
//! Classification runs periodically against the accumulating running total
//! (every [`WORD_STRIDE`] words) and is strictly best-effort: failures are
//! logged and swallowed, never blocking event dispatch.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Classify once every this many accumulated words.
pub const WORD_STRIDE: usize = 5;

/// Outcome of a guardrail check.
#[derive(Debug, Clone, Serialize)]
pub struct GuardrailVerdict {
    /// Whether the text tripped the classifier
    pub flagged: bool,
    /// Category label when flagged
    pub category: Option<String>,
}

impl GuardrailVerdict {
    pub fn pass() -> Self {
        Self {
            flagged: false,
            category: None,
        }
    }
}

/// Errors from a guardrail classifier.
#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("Classifier failure: {0}")]
    Classifier(String),
}

/// Moderation check run against accumulating assistant text.
#[async_trait]
pub trait GuardrailClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<GuardrailVerdict, GuardrailError>;
}

/// Pattern deny-list classifier used when no external moderation service
/// is configured.
pub struct DenyListClassifier {
    patterns: Vec<(String, Regex)>,
}

static DEFAULT_DENY: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("credentials", r"(?i)\b(password|api[_ ]?key|secret token)\b"),
        ("self_reference", r"(?i)\bas an? (ai|language) model\b"),
    ]
});

impl DenyListClassifier {
    /// Build from `(category, pattern)` pairs; invalid patterns are skipped
    /// with a warning.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|(category, pattern)| match Regex::new(pattern.as_ref()) {
                Ok(re) => Some((category.as_ref().to_string(), re)),
                Err(e) => {
                    tracing::warn!(
                        pattern = pattern.as_ref(),
                        "Skipping invalid guardrail pattern: {}",
                        e
                    );
                    None
                }
            })
            .collect();
        Self { patterns }
    }
}

impl Default for DenyListClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_DENY.iter().copied())
    }
}

#[async_trait]
impl GuardrailClassifier for DenyListClassifier {
    async fn classify(&self, text: &str) -> Result<GuardrailVerdict, GuardrailError> {
        for (category, pattern) in &self.patterns {
            if pattern.is_match(text) {
                return Ok(GuardrailVerdict {
                    flagged: true,
                    category: Some(category.clone()),
                });
            }
        }
        Ok(GuardrailVerdict::pass())
    }
}

/// Whether a new word count crossed a stride boundary since the last check.
pub fn stride_crossed(checked_words: usize, current_words: usize) -> bool {
    current_words / WORD_STRIDE > checked_words / WORD_STRIDE
}

/// Whitespace word count.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deny_list_flags_category() {
        let classifier = DenyListClassifier::default();
        let verdict = classifier
            .classify("here is the password for the account")
            .await
            .unwrap();
        assert!(verdict.flagged);
        assert_eq!(verdict.category.as_deref(), Some("credentials"));
    }

    #[tokio::test]
    async fn test_deny_list_passes_clean_text() {
        let classifier = DenyListClassifier::default();
        let verdict = classifier.classify("the ferry leaves at nine").await.unwrap();
        assert!(!verdict.flagged);
    }

    #[test]
    fn test_stride_boundaries() {
        assert!(!stride_crossed(0, 4));
        assert!(stride_crossed(0, 5));
        assert!(!stride_crossed(5, 9));
        assert!(stride_crossed(7, 10));
        assert!(stride_crossed(9, 15));
    }

    #[test]
    fn test_invalid_pattern_skipped() {
        let classifier = DenyListClassifier::new(vec![("bad", "(unclosed"), ("ok", "fine")]);
        assert_eq!(classifier.patterns.len(), 1);
    }
}
