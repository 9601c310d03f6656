//! Shared application state.

use std::sync::Arc;

use crate::config::ServerConfig;

/// State shared across handlers. One per server process; each WebSocket
/// connection builds its own session orchestrator from it.
pub struct AppState {
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }
}
