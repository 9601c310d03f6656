//! Agent context registry.
//!
//! One logical user session can hand off between several "agents". The
//! registry keeps a context record per agent name: created on first
//! activation, refreshed (summary overwritten, timestamp updated) on every
//! later one, never deleted while the session lives. Exactly one record or
//! none is active at a time.

mod transfer;

pub use transfer::{
    SessionController, TransferOutcome, TransferSkill, TransferError, LANGUAGE_POLICY,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::core::tools::ToolDescriptor;

/// Static per-agent configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub name: String,
    /// Base instructions (required; an empty value fails transfer fast)
    pub instructions: String,
    /// Optional agent-specific system prompt layered after the base
    pub system_prompt: Option<String>,
    /// Voice override for this agent
    pub voice: Option<String>,
    /// Tool descriptors exposed while this agent is active
    pub tools: Vec<ToolDescriptor>,
}

/// Context record for one agent.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_id: Uuid,
    pub name: String,
    pub last_active_at: SystemTime,
    pub summary: String,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, AgentContext>,
    active: Option<String>,
}

/// Session-scoped agent registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find-or-create the record for `name`, refresh its timestamp,
    /// overwrite its summary, and make it the active agent.
    pub fn activate(&self, name: &str, summary: &str) -> AgentContext {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .entry(name.to_string())
            .or_insert_with(|| AgentContext {
                agent_id: Uuid::new_v4(),
                name: name.to_string(),
                last_active_at: SystemTime::now(),
                summary: String::new(),
            });
        record.last_active_at = SystemTime::now();
        record.summary = summary.to_string();
        let record = record.clone();
        inner.active = Some(name.to_string());
        tracing::debug!(agent = name, "Agent activated");
        record
    }

    /// The currently active record, if any.
    pub fn active(&self) -> Option<AgentContext> {
        let inner = self.inner.read();
        inner
            .active
            .as_ref()
            .and_then(|name| inner.records.get(name))
            .cloned()
    }

    /// Look up a record without activating it.
    pub fn get(&self, name: &str) -> Option<AgentContext> {
        self.inner.read().records.get(name).cloned()
    }

    /// Number of known records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Whether no agent has ever been activated.
    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_creates_then_updates() {
        let registry = AgentRegistry::new();
        assert!(registry.active().is_none());

        let first = registry.activate("default", "greeting phase");
        assert_eq!(first.summary, "greeting phase");
        assert_eq!(registry.len(), 1);

        let second = registry.activate("default", "booking phase");
        assert_eq!(second.agent_id, first.agent_id, "record is reused");
        assert_eq!(second.summary, "booking phase");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_active_pointer_moves_but_records_remain() {
        let registry = AgentRegistry::new();
        registry.activate("default", "");
        registry.activate("placeGuide", "user wants a tour");

        assert_eq!(registry.active().unwrap().name, "placeGuide");
        assert_eq!(registry.len(), 2);
        assert!(registry.get("default").is_some(), "records are never deleted");
    }
}
