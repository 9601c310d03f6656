//! Request middleware.
//!
//! Bearer-secret authentication for the session route. The token is taken
//! from the `Authorization` header or, for browser WebSocket connections
//! where headers cannot be set, from a `?token=` query parameter.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::state::AppState;

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid authorization header")]
    InvalidAuthHeader,

    #[error("Invalid bearer token")]
    Unauthorized,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Extract the bearer token from the Authorization header or the `token`
/// query parameter (WebSocket browser clients cannot set headers).
fn extract_token(request: &Request) -> Result<String, AuthError> {
    if let Some(header) = request.headers().get("authorization") {
        let value = header.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
        return value
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .ok_or(AuthError::InvalidAuthHeader);
    }

    if let Some(query) = request.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "token" {
                return Ok(value.to_string());
            }
        }
    }

    Err(AuthError::MissingToken)
}

/// Validate the session-route bearer secret. A no-op when no secret is
/// configured.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(secret) = state.config.auth_secret.as_deref() else {
        tracing::debug!("Authentication disabled");
        return Ok(next.run(request).await);
    };

    let token = extract_token(&request)?;
    if token != secret {
        tracing::warn!(path = %request.uri().path(), "Bearer token mismatch");
        return Err(AuthError::Unauthorized);
    }
    Ok(next.run(request).await)
}
