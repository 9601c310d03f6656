//! Tool descriptors and parameter mapping.
//!
//! A descriptor binds a model-facing function definition to a declarative
//! skill key and an optional parameter mapping. The model-facing call name
//! and the skill key are different namespaces: the call name is whatever
//! the prompt engineer exposed to the model, the skill key selects the
//! handler.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::protocol::ToolDef;

/// Errors raised while loading descriptors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// Two model-facing keys map onto the same handler-facing name.
    /// Rejected at load time; a silent overwrite at call time is worse
    /// than a loud configuration error.
    #[error(
        "parameter mapping for tool '{tool}' maps both '{first}' and '{second}' onto '{target}'"
    )]
    DuplicateMappingTarget {
        tool: String,
        first: String,
        second: String,
        target: String,
    },
}

/// Binding of a model-facing tool to a skill handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Declarative handler selector (not the model-facing call name)
    pub skill_key: String,
    /// Model-facing function definition sent in `session.update`
    pub definition: ToolDef,
    /// Model-facing argument key -> handler-facing argument key
    #[serde(default)]
    pub parameter_mapping: HashMap<String, String>,
}

impl ToolDescriptor {
    /// The model-facing call name.
    pub fn call_name(&self) -> &str {
        &self.definition.name
    }

    /// Reject mappings where two source keys share a target.
    pub fn validate(&self) -> Result<(), DescriptorError> {
        let mut sources = self.parameter_mapping.keys().collect::<Vec<_>>();
        sources.sort();
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for source in sources {
            let target = self.parameter_mapping[source].as_str();
            if let Some(first) = seen.get(target) {
                return Err(DescriptorError::DuplicateMappingTarget {
                    tool: self.definition.name.clone(),
                    first: (*first).to_string(),
                    second: source.clone(),
                    target: target.to_string(),
                });
            }
            seen.insert(target, source);
        }
        Ok(())
    }
}

/// Build the handler-facing argument map: keys present in the mapping are
/// renamed, keys absent from it pass through unchanged.
pub fn map_parameters(
    mapping: &HashMap<String, String>,
    raw: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    if mapping.is_empty() {
        return raw;
    }
    raw.into_iter()
        .map(|(key, value)| match mapping.get(&key) {
            Some(renamed) => (renamed.clone(), value),
            None => (key, value),
        })
        .collect()
}
