//! System command endpoints: reboot, shutdown, one-shot exec, logs.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;
use crate::system::{self, CmdError};

fn cmd_error(e: &CmdError) -> (StatusCode, Json<Value>) {
    let status = match e {
        CmdError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()})))
}

/// `POST /api/system/reboot`
pub async fn reboot(
    State(_state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match system::reboot().await {
        Ok(()) => Ok(Json(
            json!({"status": "success", "message": "System is rebooting..."}),
        )),
        Err(e) => Err(cmd_error(&e)),
    }
}

/// `POST /api/system/shutdown`
pub async fn shutdown(
    State(_state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match system::poweroff().await {
        Ok(()) => Ok(Json(
            json!({"status": "success", "message": "System is shutting down..."}),
        )),
        Err(e) => Err(cmd_error(&e)),
    }
}

#[derive(Deserialize)]
pub struct RunRequest {
    pub command: String,
    /// Defaults to 30 seconds.
    pub timeout_ms: Option<u64>,
}

/// `POST /api/system/run` — one-shot command for diagnostics.
pub async fn run(
    State(_state): State<AppState>,
    Json(payload): Json<RunRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let timeout = payload.timeout_ms.unwrap_or(30_000);
    match system::run_command(&payload.command, timeout).await {
        Ok(out) => Ok(Json(json!({
            "status": "completed",
            "exit_code": out.exit_code,
            "output": out.stdout,
            "error": out.stderr,
            "duration_ms": out.duration_ms,
        }))),
        Err(e) => Err(cmd_error(&e)),
    }
}

#[derive(Deserialize)]
pub struct LogsQuery {
    /// Journal lines to return (default 100, capped at 1000).
    pub lines: Option<u32>,
}

/// `GET /api/system/logs`
pub async fn logs(
    State(_state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match system::read_logs(query.lines.unwrap_or(100)).await {
        Ok(output) => Ok(Json(json!({"logs": output}))),
        Err(e) => Err(cmd_error(&e)),
    }
}
