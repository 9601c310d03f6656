//! Configuration for the Parley Gateway server.
//!
//! Sources, in priority order: YAML file > environment variables >
//! defaults. `.env` files are loaded by the binary before this module
//! runs, so dotenv values arrive here as plain environment variables.
//!
//! # Example
//! ```rust,no_run
//! use parley_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Environment only
//! let config = ServerConfig::from_env()?;
//!
//! // YAML with environment fallback
//! let config = ServerConfig::from_file(&PathBuf::from("config.yaml"))?;
//! println!("listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::core::agents::AgentProfile;
use crate::core::connection::ConnectionConfig;
use crate::core::orchestrator::OrchestratorConfig;
use crate::core::protocol::ToolDef;
use crate::core::response::SchedulerConfig;
use crate::core::tools::{DescriptorError, SkillEndpoints, ToolDescriptor};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Default agent '{0}' is not defined under agents")]
    UnknownDefaultAgent(String),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Upstream realtime endpoint (wss)
    pub realtime_endpoint: Url,
    /// Credential-minting endpoint
    pub credential_endpoint: Url,
    /// Bearer secret protecting the session route; auth is disabled when
    /// absent
    pub auth_secret: Option<String>,
    /// Built-in skill endpoints
    pub skills: SkillEndpoints,
    /// Agent activated on session start
    pub default_agent: String,
    /// Agent profile table
    pub agents: Vec<AgentProfile>,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_REALTIME_ENDPOINT: &str = "wss://api.openai.com/v1/realtime?model=gpt-realtime";
const DEFAULT_CREDENTIAL_ENDPOINT: &str = "http://127.0.0.1:8081/realtime/credential";

impl ServerConfig {
    /// Load from environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::defaults()?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file; values missing from the file fall back to
    /// the environment, then to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::defaults()?;
        config.apply_env()?;

        let raw = std::fs::read_to_string(path)?;
        let yaml: YamlConfig = serde_yaml::from_str(&raw)?;
        config.apply_yaml(yaml)?;

        config.validate()?;
        Ok(config)
    }

    fn defaults() -> Result<Self, ConfigError> {
        Ok(Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            realtime_endpoint: parse_url("realtime_endpoint", DEFAULT_REALTIME_ENDPOINT)?,
            credential_endpoint: parse_url("credential_endpoint", DEFAULT_CREDENTIAL_ENDPOINT)?,
            auth_secret: None,
            skills: SkillEndpoints::default(),
            default_agent: "default".to_string(),
            agents: vec![AgentProfile {
                name: "default".to_string(),
                instructions: "You are a helpful, concise voice assistant.".to_string(),
                system_prompt: None,
                voice: None,
                tools: Vec::new(),
            }],
        })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("PARLEY_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("PARLEY_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PARLEY_PORT".to_string(),
                reason: format!("'{port}' is not a port number"),
            })?;
        }
        if let Ok(value) = std::env::var("PARLEY_REALTIME_ENDPOINT") {
            self.realtime_endpoint = parse_url("PARLEY_REALTIME_ENDPOINT", &value)?;
        }
        if let Ok(value) = std::env::var("PARLEY_CREDENTIAL_ENDPOINT") {
            self.credential_endpoint = parse_url("PARLEY_CREDENTIAL_ENDPOINT", &value)?;
        }
        if let Ok(secret) = std::env::var("PARLEY_AUTH_SECRET")
            && !secret.is_empty()
        {
            self.auth_secret = Some(secret);
        }
        if let Ok(value) = std::env::var("PARLEY_WEB_SEARCH_ENDPOINT") {
            self.skills.web_search = Some(parse_url("PARLEY_WEB_SEARCH_ENDPOINT", &value)?);
        }
        if let Ok(value) = std::env::var("PARLEY_KNOWLEDGE_LOOKUP_ENDPOINT") {
            self.skills.knowledge_lookup =
                Some(parse_url("PARLEY_KNOWLEDGE_LOOKUP_ENDPOINT", &value)?);
        }
        if let Ok(value) = std::env::var("PARLEY_SITE_CRAWL_ENDPOINT") {
            self.skills.site_crawl = Some(parse_url("PARLEY_SITE_CRAWL_ENDPOINT", &value)?);
        }
        Ok(())
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) -> Result<(), ConfigError> {
        if let Some(host) = yaml.host {
            self.host = host;
        }
        if let Some(port) = yaml.port {
            self.port = port;
        }
        if let Some(value) = yaml.realtime_endpoint {
            self.realtime_endpoint = parse_url("realtime_endpoint", &value)?;
        }
        if let Some(value) = yaml.credential_endpoint {
            self.credential_endpoint = parse_url("credential_endpoint", &value)?;
        }
        if let Some(secret) = yaml.auth_secret {
            self.auth_secret = Some(secret);
        }
        if let Some(skills) = yaml.skills {
            if let Some(value) = skills.web_search_endpoint {
                self.skills.web_search = Some(parse_url("skills.web_search_endpoint", &value)?);
            }
            if let Some(value) = skills.knowledge_lookup_endpoint {
                self.skills.knowledge_lookup =
                    Some(parse_url("skills.knowledge_lookup_endpoint", &value)?);
            }
            if let Some(value) = skills.site_crawl_endpoint {
                self.skills.site_crawl = Some(parse_url("skills.site_crawl_endpoint", &value)?);
            }
        }
        if let Some(default_agent) = yaml.default_agent {
            self.default_agent = default_agent;
        }
        if let Some(agents) = yaml.agents {
            self.agents = agents.into_iter().map(YamlAgent::into_profile).collect();
        }
        Ok(())
    }

    /// Fail fast on inconsistent configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.agents.iter().any(|a| a.name == self.default_agent) {
            return Err(ConfigError::UnknownDefaultAgent(self.default_agent.clone()));
        }
        for agent in &self.agents {
            if agent.instructions.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("agents.{}.instructions", agent.name),
                    reason: "must not be empty".to_string(),
                });
            }
            for descriptor in &agent.tools {
                descriptor.validate()?;
            }
        }
        Ok(())
    }

    /// Bind address for the listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether the session route requires a bearer secret.
    pub fn auth_required(&self) -> bool {
        self.auth_secret.is_some()
    }

    /// Per-session orchestrator configuration.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            connection: ConnectionConfig::default(),
            scheduler: SchedulerConfig::default(),
            skills: self.skills.clone(),
            default_agent: self.default_agent.clone(),
            profiles: self.agents.clone(),
        }
    }
}

fn parse_url(key: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

// =============================================================================
// YAML shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct YamlConfig {
    host: Option<String>,
    port: Option<u16>,
    realtime_endpoint: Option<String>,
    credential_endpoint: Option<String>,
    auth_secret: Option<String>,
    skills: Option<YamlSkills>,
    default_agent: Option<String>,
    agents: Option<Vec<YamlAgent>>,
}

#[derive(Debug, Deserialize)]
struct YamlSkills {
    web_search_endpoint: Option<String>,
    knowledge_lookup_endpoint: Option<String>,
    site_crawl_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YamlAgent {
    name: String,
    instructions: String,
    system_prompt: Option<String>,
    voice: Option<String>,
    #[serde(default)]
    tools: Vec<YamlTool>,
}

impl YamlAgent {
    fn into_profile(self) -> AgentProfile {
        AgentProfile {
            name: self.name,
            instructions: self.instructions,
            system_prompt: self.system_prompt,
            voice: self.voice,
            tools: self.tools.into_iter().map(YamlTool::into_descriptor).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct YamlTool {
    skill_key: String,
    name: String,
    description: Option<String>,
    parameters: Option<serde_json::Value>,
    #[serde(default)]
    parameter_mapping: HashMap<String, String>,
}

impl YamlTool {
    fn into_descriptor(self) -> ToolDescriptor {
        ToolDescriptor {
            skill_key: self.skill_key,
            definition: ToolDef {
                tool_type: "function".to_string(),
                name: self.name,
                description: self.description,
                parameters: self.parameters,
            },
            parameter_mapping: self.parameter_mapping,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
host: 127.0.0.1
port: 9090
realtime_endpoint: wss://realtime.internal/v1
credential_endpoint: https://auth.internal/credential
auth_secret: hunter2
skills:
  web_search_endpoint: https://skills.internal/search
default_agent: concierge
agents:
  - name: concierge
    instructions: Greet the caller and find out what they need.
    voice: sage
    tools:
      - skill_key: web_search
        name: searchTheWeb
        description: Search the public web.
        parameter_mapping:
          query: searchQuery
  - name: placeGuide
    instructions: Recommend nearby places.
"#;

    #[test]
    fn test_defaults_validate() {
        let config = ServerConfig::defaults().unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.address(), "0.0.0.0:8080");
        assert!(!config.auth_required());
    }

    #[test]
    fn test_yaml_overrides_everything() {
        let mut config = ServerConfig::defaults().unwrap();
        let yaml: YamlConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        config.apply_yaml(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.address(), "127.0.0.1:9090");
        assert!(config.auth_required());
        assert_eq!(config.default_agent, "concierge");
        assert_eq!(config.agents.len(), 2);
        let tool = &config.agents[0].tools[0];
        assert_eq!(tool.skill_key, "web_search");
        assert_eq!(
            tool.parameter_mapping.get("query").map(String::as_str),
            Some("searchQuery")
        );
        assert!(config.skills.web_search.is_some());
    }

    #[test]
    fn test_unknown_default_agent_rejected() {
        let mut config = ServerConfig::defaults().unwrap();
        config.default_agent = "nonexistent".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownDefaultAgent(_))
        ));
    }

    #[test]
    fn test_duplicate_mapping_target_rejected() {
        let mut config = ServerConfig::defaults().unwrap();
        config.agents[0].tools.push(ToolDescriptor {
            skill_key: "web_search".to_string(),
            definition: ToolDef {
                tool_type: "function".to_string(),
                name: "searchTheWeb".to_string(),
                description: None,
                parameters: None,
            },
            parameter_mapping: [
                ("query".to_string(), "q".to_string()),
                ("text".to_string(), "q".to_string()),
            ]
            .into_iter()
            .collect(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Descriptor(_))
        ));
    }

    #[test]
    fn test_empty_instructions_rejected() {
        let mut config = ServerConfig::defaults().unwrap();
        config.agents[0].instructions = "   ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_orchestrator_config_mirrors_agent_table() {
        let mut config = ServerConfig::defaults().unwrap();
        let yaml: YamlConfig = serde_yaml::from_str(SAMPLE_YAML).unwrap();
        config.apply_yaml(yaml).unwrap();

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.default_agent, "concierge");
        assert_eq!(orchestrator.profiles.len(), 2);
    }
}
