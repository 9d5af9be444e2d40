//! Health endpoint.

use crate::api::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: i64,
    pub event_queue_depth: usize,
    pub events_dropped: u64,
    pub stored_events: i64,
    pub stored_api_accesses: i64,
    pub stored_audit_entries: i64,
    pub sessions: i64,
    pub tracked_sources: usize,
}

/// `GET /v1/security/health`
pub async fn get_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, StatusCode> {
    let orchestrator = &state.orchestrator;
    let (stored_events, stored_api_accesses, stored_audit_entries) = orchestrator
        .event_store
        .counts()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let sessions = orchestrator
        .sessions
        .count()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(HealthResponse {
        status: "ok",
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        event_queue_depth: orchestrator.event_queue.depth(),
        events_dropped: orchestrator.event_queue.dropped(),
        stored_events,
        stored_api_accesses,
        stored_audit_entries,
        sessions,
        tracked_sources: orchestrator.rate_limiter.tracked_sources(),
    }))
}
