//! Microsoft identity and mail endpoints.
//!
//! Linking an account is a two-step device flow: `POST /login` returns the
//! code to show on the clock, and the UI calls `POST /poll` until the user
//! has authorized (or the flow dies). Everything else reads through the
//! facade.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::clients::microsoft::DevicePoll;
use crate::errors::SessionError;
use crate::state::AppState;

use super::session_error;

/// `POST /api/microsoft/login` — start a device-code flow.
pub async fn login(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.microsoft.begin_login().await {
        Ok(flow) => Ok(Json(json!({
            "verification_uri": flow.verification_uri,
            "user_code": flow.user_code,
            "message": flow.message,
            "expires_at": flow.expires_at,
            "interval_secs": flow.interval_secs,
        }))),
        Err(e) => Err(session_error(&e)),
    }
}

/// `POST /api/microsoft/poll` — advance the pending device flow one step.
///
/// `409` when no flow is in progress (start one with `/login`).
pub async fn poll(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.microsoft.poll_login().await {
        Ok(DevicePoll::Authorized(token)) => Ok(Json(json!({
            "status": "authorized",
            "account": token.account,
        }))),
        Ok(DevicePoll::Pending { interval_secs }) => Ok(Json(json!({
            "status": "pending",
            "interval_secs": interval_secs,
        }))),
        Ok(DevicePoll::SlowDown { interval_secs }) => Ok(Json(json!({
            "status": "pending",
            "interval_secs": interval_secs,
        }))),
        Ok(DevicePoll::Declined) => Ok(Json(json!({"status": "declined"}))),
        Ok(DevicePoll::Expired) => Ok(Json(json!({"status": "expired"}))),
        Err(SessionError::NotConfigured) => Err((
            StatusCode::CONFLICT,
            Json(json!({"error": "no device flow in progress", "kind": "not_configured"})),
        )),
        Err(e) => Err(session_error(&e)),
    }
}

/// `GET /api/microsoft/accounts` — linked accounts (zero or one).
pub async fn accounts(State(state): State<AppState>) -> Json<Value> {
    let accounts: Vec<Value> = state
        .microsoft
        .accounts()
        .await
        .into_iter()
        .map(|a| json!({"account": a}))
        .collect();
    Json(json!({"accounts": accounts}))
}

/// `GET /api/microsoft/messages` — latest mailbox entries via Graph.
pub async fn messages(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.microsoft.messages().await {
        Ok(messages) => Ok(Json(json!({"messages": messages}))),
        Err(e) => Err(session_error(&e)),
    }
}

/// `GET /api/microsoft/status` — session state and token metadata.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let status = state.microsoft.status().await;
    let token = state.cache.mail_token().await;
    Json(json!({
        "state": status.state,
        "last_error": status.last_error,
        "account": token.as_ref().map(|t| t.account.clone()),
        "token_expires_at": token.as_ref().map(|t| t.expires_at),
    }))
}

/// `POST /api/microsoft/logout` — unlink the account.
pub async fn logout(State(state): State<AppState>) -> Json<Value> {
    state.microsoft.logout().await;
    Json(json!({"status": "success"}))
}
