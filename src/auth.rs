//! Optional pre-shared API key authentication.
//!
//! The backend normally serves only the clock's own display process, so auth
//! defaults to off (empty key). When a key is configured — e.g. the clock is
//! reachable from the LAN — every route except `/api/health` requires
//! `Authorization: Bearer <key>`.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Extension type carrying the expected API key. An empty key disables the
/// check entirely.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Axum middleware enforcing the Bearer key when one is configured.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or malformed
/// - `403 Forbidden` — key present but wrong
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let expected = match request.extensions().get::<ApiKey>() {
        Some(key) => key.0.clone(),
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Server configuration error"})),
            )
                .into_response();
        }
    };

    if expected.is_empty() {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response(),
        Some(key) if !constant_time_eq(expected.as_bytes(), key.as_bytes()) => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response(),
        Some(_) => next.run(request).await,
    }
}

/// Constant-time byte comparison. Always walks the full expected key so
/// response timing reveals neither a prefix match nor the key length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() { provided[i] } else { 0xff };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }
}
