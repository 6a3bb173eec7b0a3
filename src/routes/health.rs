//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns uptime, version, per-service session state, and cache counts.
/// No authentication required; the display process polls this.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let untis = state.untis.status().await;
    let microsoft = state.microsoft.status().await;
    let (timetable_entries, holidays) = state.cache.counts().await;
    let clock = state.clock.get().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "setup_complete": clock.setup,
        "untis": {
            "state": untis.state,
            "timetable_entries": timetable_entries,
            "holidays": holidays,
        },
        "microsoft": {
            "state": microsoft.state,
        },
    }))
}
