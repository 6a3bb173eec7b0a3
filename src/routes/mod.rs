//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. Handlers are thin:
//! they read the cache or call a service facade, then shape JSON. All of
//! them except [`health`] sit behind the API key middleware (which is a
//! no-op when no key is configured).

pub mod config;
pub mod health;
pub mod microsoft;
pub mod system;
pub mod untis;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::errors::{SessionError, ValidationError};

/// Translate the session error taxonomy into an HTTP response.
///
/// Not-configured is the caller's problem (fix the setup), invalid
/// credentials need new secrets, and everything transient is the upstream
/// service's fault.
pub(crate) fn session_error(err: &SessionError) -> (StatusCode, Json<Value>) {
    let status = match err {
        SessionError::NotConfigured => StatusCode::CONFLICT,
        SessionError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        SessionError::Expired | SessionError::Transient(_) => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(json!({"error": err.to_string(), "kind": err.kind()})),
    )
}

pub(crate) fn validation_error(err: &ValidationError) -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"error": err.to_string(), "kind": "validation"})),
    )
}
