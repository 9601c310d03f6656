//! HTTP route configuration.
//!
//! `GET /session` - WebSocket upgrade carrying the session protocol
//! `GET /healthz` - liveness probe (no auth)
//!
//! # Protocol
//!
//! After upgrade, the client sends:
//! 1. Optional `preload` to warm credential/media caches
//! 2. `start` with the agent name and input mode
//! 3. `text` messages and binary audio frames
//!
//! The gateway streams back `status`, `transcript_upsert`, `agent_changed`,
//! `breadcrumb`, and `error` events.

use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::session_handler;
use crate::middleware::auth_middleware;
use crate::state::AppState;

async fn health() -> &'static str {
    "ok"
}

/// Build the application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let session_routes = Router::new()
        .route("/session", get(session_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(health))
        .merge(session_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
