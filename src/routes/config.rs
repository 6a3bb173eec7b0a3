//! Clock settings endpoints.
//!
//! Every mutation persists before responding. Hostname and timezone changes
//! additionally shell out to the system; a failed system call is logged but
//! does not roll the setting back (it reapplies on the next boot).

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::clock::ClockConfig;
use crate::state::AppState;
use crate::system;

/// `GET /api/config` — current clock settings.
pub async fn get(State(state): State<AppState>) -> Json<ClockConfig> {
    Json(state.clock.get().await)
}

/// `PUT /api/config` — replace the whole configuration.
pub async fn put(
    State(state): State<AppState>,
    Json(config): Json<ClockConfig>,
) -> Json<Value> {
    state.clock.replace(config).await;
    Json(json!({"status": "success", "message": "Config updated"}))
}

#[derive(Deserialize)]
pub struct DebugPatch {
    pub debug: bool,
}

/// `PATCH /api/config/debug`
pub async fn patch_debug(
    State(state): State<AppState>,
    Json(patch): Json<DebugPatch>,
) -> Json<Value> {
    state.clock.set_debug(patch.debug).await;
    Json(json!({"status": "success", "debug": patch.debug}))
}

#[derive(Deserialize)]
pub struct SetupPatch {
    pub setup: bool,
}

/// `PATCH /api/config/setup` — flip the setup-complete flag.
pub async fn patch_setup(
    State(state): State<AppState>,
    Json(patch): Json<SetupPatch>,
) -> Json<Value> {
    state.clock.set_setup_complete(patch.setup).await;
    Json(json!({"status": "success", "setup": patch.setup}))
}

#[derive(Deserialize)]
pub struct HostnamePatch {
    pub hostname: String,
}

/// `PATCH /api/config/hostname`
pub async fn patch_hostname(
    State(state): State<AppState>,
    Json(patch): Json<HostnamePatch>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let hostname = patch.hostname.trim().to_string();
    if hostname.is_empty() || !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid hostname"})),
        ));
    }
    state.clock.set_hostname(hostname.clone()).await;
    system::apply_hostname(&hostname).await;
    Ok(Json(json!({"status": "success", "hostname": hostname})))
}

#[derive(Deserialize)]
pub struct TimezonePatch {
    pub timezone: String,
}

/// `PATCH /api/config/timezone`
pub async fn patch_timezone(
    State(state): State<AppState>,
    Json(patch): Json<TimezonePatch>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !system::timezone_is_valid(&patch.timezone) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid timezone"})),
        ));
    }
    state.clock.set_timezone(patch.timezone.clone()).await;
    system::apply_timezone(&patch.timezone).await;
    Ok(Json(json!({"status": "success", "timezone": patch.timezone})))
}

/// `POST /api/config/reset` — back to factory defaults.
pub async fn reset(State(state): State<AppState>) -> Json<Value> {
    state.clock.reset().await;
    Json(json!({"status": "success", "message": "Config reset to defaults"}))
}
