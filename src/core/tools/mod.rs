//! Function-call execution routing.
//!
//! Turns a model-issued tool call into a resolved, parameter-mapped,
//! executed, and reported result. Resolution order: an agent-local
//! override registered under the call's logical name, then the global
//! skill registry keyed by the descriptor's skill key, then a substring
//! heuristic kept only as a degrade path for legacy call names. Handler
//! failures of any kind become structured `{success:false, error}` results
//! and never escape into the dispatch loop.

mod descriptor;
mod skills;

pub use descriptor::{DescriptorError, ToolDescriptor, map_parameters};
pub use skills::{
    HttpSkill, SkillEndpoints, SkillError, SkillHandler, SkillKind, SkillRegistry,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::time::Instant;

use crate::core::connection::ConnectionManager;
use crate::core::protocol::{ClientEvent, ConversationItem};

/// A model-issued function call. Ephemeral: created per protocol event,
/// consumed here, gone once the result is emitted.
#[derive(Debug, Clone)]
pub struct FunctionCallRequest {
    pub call_id: String,
    pub name: String,
    /// Opaque serialized argument blob as received from the model
    pub raw_arguments: String,
}

/// How a call name was resolved to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    AgentOverride,
    SkillKey(String),
    /// Substring degrade path; logged as a warning
    Heuristic(String),
    Unresolved,
}

/// Result of one routed call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub payload: Value,
    pub resolution: Resolution,
    pub elapsed: Duration,
}

struct RouterInner {
    registry: Arc<SkillRegistry>,
    manager: ConnectionManager,
    /// Active agent's descriptor table, keyed by model-facing call name
    agent_tools: parking_lot::RwLock<HashMap<String, ToolDescriptor>>,
    /// Agent-local handler overrides, keyed by model-facing call name
    agent_overrides: parking_lot::RwLock<HashMap<String, Arc<dyn SkillHandler>>>,
}

/// Routes function calls for one session. Cheap to clone.
#[derive(Clone)]
pub struct ToolRouter {
    inner: Arc<RouterInner>,
}

impl ToolRouter {
    pub fn new(registry: Arc<SkillRegistry>, manager: ConnectionManager) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                manager,
                agent_tools: parking_lot::RwLock::new(HashMap::new()),
                agent_overrides: parking_lot::RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Replace the active agent's descriptor table. Called on every agent
    /// activation; descriptors were validated at configuration load.
    pub fn install_agent_tools(&self, descriptors: &[ToolDescriptor]) {
        let table = descriptors
            .iter()
            .map(|d| (d.call_name().to_string(), d.clone()))
            .collect();
        *self.inner.agent_tools.write() = table;
    }

    /// Register an agent-local override under the call's logical name.
    pub fn register_agent_override(&self, call_name: &str, handler: Arc<dyn SkillHandler>) {
        self.inner
            .agent_overrides
            .write()
            .insert(call_name.to_string(), handler);
    }

    /// The global registry, for runtime skill registration.
    pub fn registry(&self) -> &SkillRegistry {
        &self.inner.registry
    }

    /// Execute a call and report its result upstream.
    ///
    /// Never returns an error and never panics the caller: every failure
    /// mode ends as a structured payload echoed back under the call id.
    pub async fn execute(&self, call: FunctionCallRequest) -> ToolOutcome {
        let started = Instant::now();

        let args = match parse_arguments(&call.raw_arguments) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(name = %call.name, "Unparseable tool arguments: {}", e);
                let payload = json!({"success": false, "error": "invalid arguments"});
                return self.finish(call, payload, Resolution::Unresolved, started).await;
            }
        };

        let descriptor = self.inner.agent_tools.read().get(&call.name).cloned();
        let (handler, resolution) = self.resolve(&call.name, descriptor.as_ref());

        let Some(handler) = handler else {
            let payload = json!({
                "error": format!("Tool not found for function {}", call.name),
            });
            return self.finish(call, payload, Resolution::Unresolved, started).await;
        };

        let args = match &descriptor {
            Some(descriptor) => map_parameters(&descriptor.parameter_mapping, args),
            None => args,
        };

        // Run the handler on its own task so a panic inside a skill body
        // cannot take the dispatch loop down with it.
        let invocation = tokio::spawn(async move { handler.invoke(args).await });
        let payload = match invocation.await {
            Ok(Ok(value)) => normalize_success(value),
            Ok(Err(e)) => {
                tracing::warn!(name = %call.name, "Tool handler failed: {}", e);
                json!({"success": false, "error": e.to_string()})
            }
            Err(e) => {
                tracing::error!(name = %call.name, "Tool handler panicked: {}", e);
                json!({"success": false, "error": "handler panicked"})
            }
        };

        self.finish(call, payload, resolution, started).await
    }

    fn resolve(
        &self,
        call_name: &str,
        descriptor: Option<&ToolDescriptor>,
    ) -> (Option<Arc<dyn SkillHandler>>, Resolution) {
        if let Some(handler) = self.inner.agent_overrides.read().get(call_name) {
            return (Some(handler.clone()), Resolution::AgentOverride);
        }

        if let Some(descriptor) = descriptor {
            let kind = SkillKind::from_key(&descriptor.skill_key);
            if let Some(handler) = self.inner.registry.resolve(&kind) {
                return (
                    Some(handler),
                    Resolution::SkillKey(descriptor.skill_key.clone()),
                );
            }
        }

        // Degrade path for call names that predate declarative skill keys.
        let needle = descriptor
            .map(|d| d.skill_key.clone())
            .unwrap_or_else(|| call_name.to_string())
            .to_lowercase();
        if needle.contains("search") {
            tracing::warn!(call_name, "Falling back to substring routing (search)");
            return (
                Some(self.inner.registry.web_search_handler()),
                Resolution::Heuristic("search".to_string()),
            );
        }
        if needle.contains("crawl") {
            tracing::warn!(call_name, "Falling back to substring routing (crawl)");
            return (
                Some(self.inner.registry.site_crawl_handler()),
                Resolution::Heuristic("crawl".to_string()),
            );
        }

        (None, Resolution::Unresolved)
    }

    async fn finish(
        &self,
        call: FunctionCallRequest,
        payload: Value,
        resolution: Resolution,
        started: Instant,
    ) -> ToolOutcome {
        let elapsed = started.elapsed();
        let serialized = payload.to_string();
        tracing::debug!(
            name = %call.name,
            call_id = %call.call_id,
            elapsed_ms = elapsed.as_millis() as u64,
            ?resolution,
            "Tool call finished"
        );

        let item = ConversationItem::function_call_output(&call.call_id, &serialized);
        if let Err(e) = self
            .inner
            .manager
            .send(ClientEvent::ConversationItemCreate { item })
            .await
        {
            tracing::warn!(call_id = %call.call_id, "Failed to report tool result: {}", e);
        }

        ToolOutcome {
            call_id: call.call_id,
            name: call.name,
            payload,
            resolution,
            elapsed,
        }
    }
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected object, got {other}")),
    }
}

fn normalize_success(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map),
        other => json!({"success": true, "result": other}),
    }
}
