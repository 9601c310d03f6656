//! Skill kinds and the skill registry.
//!
//! Built-in skills form a closed enum so dispatch over them is exhaustive;
//! the `Dynamic` variant falls back to a string-keyed map for handlers
//! registered at runtime (admin-configured tools). Handler bodies are thin
//! wrappers over outbound HTTP calls; their content is not this crate's
//! concern, only the dispatch contract is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use thiserror::Error;
use url::Url;

/// Errors surfaced by skill handlers. Always converted by the router into
/// a structured `{success:false, error}` payload, never propagated.
#[derive(Debug, Error)]
pub enum SkillError {
    /// Arguments missing or of the wrong shape
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Downstream endpoint failed
    #[error("Skill endpoint error: {0}")]
    Endpoint(String),

    /// Skill key resolved to nothing
    #[error("Unregistered skill: {0}")]
    Unregistered(String),

    /// Anything else a handler wants to report
    #[error("{0}")]
    Handler(String),
}

/// A callable skill handler.
#[async_trait]
pub trait SkillHandler: Send + Sync {
    /// Execute with the handler-facing argument map.
    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, SkillError>;
}

/// Closed set of built-in skill kinds plus the runtime-registered fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillKind {
    WebSearch,
    KnowledgeLookup,
    SiteCrawl,
    AgentTransfer,
    /// Runtime-registered skill, resolved through the string-keyed map
    Dynamic(String),
}

impl SkillKind {
    /// Parse a declarative skill key.
    pub fn from_key(key: &str) -> Self {
        match key {
            "web_search" => SkillKind::WebSearch,
            "knowledge_lookup" => SkillKind::KnowledgeLookup,
            "site_crawl" => SkillKind::SiteCrawl,
            "agent_transfer" => SkillKind::AgentTransfer,
            other => SkillKind::Dynamic(other.to_string()),
        }
    }

    /// The declarative key.
    pub fn key(&self) -> &str {
        match self {
            SkillKind::WebSearch => "web_search",
            SkillKind::KnowledgeLookup => "knowledge_lookup",
            SkillKind::SiteCrawl => "site_crawl",
            SkillKind::AgentTransfer => "agent_transfer",
            SkillKind::Dynamic(key) => key,
        }
    }
}

/// Endpoints for the built-in HTTP-backed skills.
#[derive(Debug, Clone, Default)]
pub struct SkillEndpoints {
    pub web_search: Option<Url>,
    pub knowledge_lookup: Option<Url>,
    pub site_crawl: Option<Url>,
}

/// Built-in skill: POSTs the argument map to a configured endpoint and
/// returns the response body. Without an endpoint it returns simulated
/// data, which keeps local development working with no services up.
pub struct HttpSkill {
    label: &'static str,
    client: reqwest::Client,
    endpoint: Option<Url>,
}

impl HttpSkill {
    pub fn new(label: &'static str, endpoint: Option<Url>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            label,
            client,
            endpoint,
        }
    }
}

#[async_trait]
impl SkillHandler for HttpSkill {
    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, SkillError> {
        let Some(endpoint) = &self.endpoint else {
            tracing::debug!(skill = self.label, "No endpoint configured; returning simulated data");
            return Ok(json!({
                "success": true,
                "simulated": true,
                "skill": self.label,
                "echo": Value::Object(args),
            }));
        };

        let response = self
            .client
            .post(endpoint.clone())
            .json(&Value::Object(args))
            .send()
            .await
            .map_err(|e| SkillError::Endpoint(e.to_string()))?
            .error_for_status()
            .map_err(|e| SkillError::Endpoint(e.to_string()))?;

        response
            .json::<Value>()
            .await
            .map_err(|e| SkillError::Endpoint(format!("invalid response body: {e}")))
    }
}

/// Registry resolving skill kinds to handlers.
pub struct SkillRegistry {
    web_search: Arc<dyn SkillHandler>,
    knowledge_lookup: Arc<dyn SkillHandler>,
    site_crawl: Arc<dyn SkillHandler>,
    /// Installed once the session controller exists; transfer is a skill
    /// from the model's point of view but routes into session control
    agent_transfer: parking_lot::RwLock<Option<Arc<dyn SkillHandler>>>,
    dynamic: DashMap<String, Arc<dyn SkillHandler>>,
}

impl SkillRegistry {
    pub fn new(endpoints: SkillEndpoints) -> Self {
        Self {
            web_search: Arc::new(HttpSkill::new("web_search", endpoints.web_search)),
            knowledge_lookup: Arc::new(HttpSkill::new(
                "knowledge_lookup",
                endpoints.knowledge_lookup,
            )),
            site_crawl: Arc::new(HttpSkill::new("site_crawl", endpoints.site_crawl)),
            agent_transfer: parking_lot::RwLock::new(None),
            dynamic: DashMap::new(),
        }
    }

    /// Resolve a kind to its handler.
    pub fn resolve(&self, kind: &SkillKind) -> Option<Arc<dyn SkillHandler>> {
        match kind {
            SkillKind::WebSearch => Some(self.web_search.clone()),
            SkillKind::KnowledgeLookup => Some(self.knowledge_lookup.clone()),
            SkillKind::SiteCrawl => Some(self.site_crawl.clone()),
            SkillKind::AgentTransfer => self.agent_transfer.read().clone(),
            SkillKind::Dynamic(key) => self.dynamic.get(key).map(|h| h.value().clone()),
        }
    }

    /// Install the transfer handler once the session controller exists.
    pub fn set_transfer_handler(&self, handler: Arc<dyn SkillHandler>) {
        *self.agent_transfer.write() = Some(handler);
    }

    /// Register a runtime skill under its key.
    pub fn register_dynamic(&self, key: &str, handler: Arc<dyn SkillHandler>) {
        self.dynamic.insert(key.to_string(), handler);
    }

    /// Handler for the heuristic degrade path (`web_search`).
    pub fn web_search_handler(&self) -> Arc<dyn SkillHandler> {
        self.web_search.clone()
    }

    /// Handler for the heuristic degrade path (`site_crawl`).
    pub fn site_crawl_handler(&self) -> Arc<dyn SkillHandler> {
        self.site_crawl.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_skill_kind_round_trip() {
        assert_eq!(SkillKind::from_key("web_search"), SkillKind::WebSearch);
        assert_eq!(SkillKind::from_key("agent_transfer"), SkillKind::AgentTransfer);
        assert_eq!(
            SkillKind::from_key("weather"),
            SkillKind::Dynamic("weather".to_string())
        );
        assert_eq!(SkillKind::from_key("site_crawl").key(), "site_crawl");
    }

    #[tokio::test]
    async fn test_http_skill_without_endpoint_simulates() {
        let skill = HttpSkill::new("web_search", None);
        let mut args = Map::new();
        args.insert("searchQuery".to_string(), json!("ferry times"));
        let result = skill.invoke(args).await.unwrap();
        assert_eq!(result["simulated"], json!(true));
        assert_eq!(result["echo"]["searchQuery"], json!("ferry times"));
    }

    #[tokio::test]
    async fn test_http_skill_posts_arguments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(json!({"searchQuery": "ferry times"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"success": true, "hits": 3})),
            )
            .mount(&server)
            .await;

        let endpoint = Url::parse(&format!("{}/search", server.uri())).unwrap();
        let skill = HttpSkill::new("web_search", Some(endpoint));
        let mut args = Map::new();
        args.insert("searchQuery".to_string(), json!("ferry times"));
        let result = skill.invoke(args).await.unwrap();
        assert_eq!(result["hits"], json!(3));
    }

    #[tokio::test]
    async fn test_http_skill_maps_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let endpoint = Url::parse(&server.uri()).unwrap();
        let skill = HttpSkill::new("site_crawl", Some(endpoint));
        let result = skill.invoke(Map::new()).await;
        assert!(matches!(result, Err(SkillError::Endpoint(_))));
    }

    #[test]
    fn test_registry_resolution() {
        let registry = SkillRegistry::new(SkillEndpoints::default());
        assert!(registry.resolve(&SkillKind::WebSearch).is_some());
        assert!(registry.resolve(&SkillKind::AgentTransfer).is_none());
        assert!(
            registry
                .resolve(&SkillKind::Dynamic("weather".to_string()))
                .is_none()
        );

        struct Nop;
        #[async_trait]
        impl SkillHandler for Nop {
            async fn invoke(&self, _args: Map<String, Value>) -> Result<Value, SkillError> {
                Ok(json!({"success": true}))
            }
        }
        registry.register_dynamic("weather", Arc::new(Nop));
        assert!(
            registry
                .resolve(&SkillKind::Dynamic("weather".to_string()))
                .is_some()
        );
    }
}
