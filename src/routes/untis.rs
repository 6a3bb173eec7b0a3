//! Timetable service endpoints.
//!
//! All reads come from the cache — a broken upstream session degrades these
//! to stale (flagged) data, never to errors or blocked requests.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Local;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cache::TimetableEntry;
use crate::credentials::UntisCredentials;
use crate::session::SessionState;
use crate::state::AppState;

use super::{session_error, validation_error};

fn format_entry(entry: &TimetableEntry) -> Value {
    json!({
        "subject": entry.subject,
        "start": entry.start.format("%Y-%m-%d %H:%M").to_string(),
        "end": entry.end.format("%Y-%m-%d %H:%M").to_string(),
        "room": entry.room,
        "classes": entry.classes,
    })
}

/// `POST /api/untis/creds` — store credentials and try them immediately.
///
/// Validation failures return `422` without touching the network. A
/// rejected or unreachable remote reports the session outcome, but the
/// credentials stay saved — the refresh loop keeps trying transient cases.
pub async fn set_creds(
    State(state): State<AppState>,
    Json(payload): Json<UntisCredentials>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.untis.set_credentials(payload).await {
        Err(validation) => Err(validation_error(&validation)),
        Ok(Ok(())) => Ok(Json(json!({
            "status": "success",
            "message": "Credentials saved and session established",
        }))),
        Ok(Err(session)) => {
            let (status, Json(mut body)) = session_error(&session);
            body["credentials_saved"] = json!(true);
            Err((status, Json(body)))
        }
    }
}

#[derive(Deserialize)]
pub struct TimetableQuery {
    /// Days ahead to include; defaults to the configured fetch window.
    pub day_range: Option<u32>,
}

/// `GET /api/untis/timetable?day_range=N` — cached entries, sorted by start.
pub async fn timetable(
    State(state): State<AppState>,
    Query(query): Query<TimetableQuery>,
) -> Json<Value> {
    let day_range = query.day_range.unwrap_or(state.config.untis.day_range);
    let today = Local::now().date_naive();
    let read = state.cache.timetable_window(today, day_range).await;
    let stale = state.untis.status().await.state != SessionState::Connected;

    Json(json!({
        "entries": read.data.iter().map(format_entry).collect::<Vec<_>>(),
        "updated_at": read.updated_at,
        "stale": stale,
    }))
}

/// `GET /api/untis/holidays` — cached holiday list.
pub async fn holidays(State(state): State<AppState>) -> Json<Value> {
    let read = state.cache.holidays().await;
    let stale = state.untis.status().await.state != SessionState::Connected;
    Json(json!({
        "holidays": read.data,
        "updated_at": read.updated_at,
        "stale": stale,
    }))
}

/// `GET /api/untis/current-lesson` — the lesson running right now, if any.
pub async fn current_lesson(State(state): State<AppState>) -> Json<Value> {
    let now = Local::now().naive_local();
    let lesson = state.cache.current_lesson(now).await;
    Json(json!({"lesson": lesson.as_ref().map(format_entry)}))
}

/// `GET /api/untis/lessons-today` — all of today's lessons.
pub async fn lessons_today(State(state): State<AppState>) -> Json<Value> {
    let now = Local::now().naive_local();
    let lessons = state.cache.lessons_today(now).await;
    Json(json!({
        "lessons": lessons.iter().map(format_entry).collect::<Vec<_>>(),
    }))
}

/// `GET /api/untis/lessons-week` — this week's lessons.
pub async fn lessons_week(State(state): State<AppState>) -> Json<Value> {
    let now = Local::now().naive_local();
    let lessons = state.cache.lessons_week(now).await;
    Json(json!({
        "lessons": lessons.iter().map(format_entry).collect::<Vec<_>>(),
    }))
}

/// `GET /api/untis/next-event` — the next upcoming holiday.
pub async fn next_event(State(state): State<AppState>) -> Json<Value> {
    let today = Local::now().date_naive();
    let event = state.cache.next_holiday(today).await.map(|h| {
        json!({
            "type": "holiday",
            "name": h.name,
            "start": h.start.to_string(),
            "end": h.end.to_string(),
        })
    });
    Json(json!({"event": event}))
}

/// `GET /api/untis/status` — session state and cache counts.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let status = state.untis.status().await;
    let (timetable_entries, holidays) = state.cache.counts().await;
    Json(json!({
        "state": status.state,
        "connected_secs": status.connected_secs,
        "last_error": status.last_error,
        "timetable_entries": timetable_entries,
        "holidays": holidays,
    }))
}

/// `GET /api/untis/login-name` — configured username, for the settings UI.
pub async fn login_name(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.untis.login_name().await {
        Some(username) => Ok(Json(json!({"username": username}))),
        None => Err((
            StatusCode::CONFLICT,
            Json(json!({"error": "no credentials configured", "kind": "not_configured"})),
        )),
    }
}

/// `POST /api/untis/logout` — drop the session, keep the credentials.
pub async fn logout(State(state): State<AppState>) -> Json<Value> {
    state.untis.manager.invalidate().await;
    Json(json!({"status": "success"}))
}

/// `DELETE /api/untis/creds` — forget credentials and drop the session.
pub async fn clear_creds(State(state): State<AppState>) -> Json<Value> {
    state.untis.clear_credentials().await;
    Json(json!({"status": "success"}))
}
