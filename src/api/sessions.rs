//! Session endpoints.

use crate::api::AppState;
use crate::models::{AuditAction, AuditEntry};
use crate::security::StoreJob;
use crate::session::{RiskBand, Session};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ActiveQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
    pub count: usize,
}

/// `GET /v1/sessions/active?limit`
pub async fn get_active(
    Query(params): Query<ActiveQuery>,
    State(state): State<AppState>,
) -> Result<Json<SessionListResponse>, StatusCode> {
    let sessions = state
        .orchestrator
        .sessions
        .list_active(params.limit.unwrap_or(100))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    }))
}

/// `GET /v1/sessions/:id`
pub async fn get_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Session>, StatusCode> {
    let session = state
        .orchestrator
        .sessions
        .get(&session_id, Utc::now())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(session))
}

#[derive(Debug, Serialize)]
pub struct SessionRiskResponse {
    pub session_id: String,
    pub risk_score: u32,
    pub risk_level: &'static str,
    pub anomalies_detected: Vec<String>,
    pub is_terminated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    pub transaction_count: u32,
}

/// `GET /v1/sessions/:id/risk`
pub async fn get_session_risk(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SessionRiskResponse>, StatusCode> {
    let session = state
        .orchestrator
        .sessions
        .get(&session_id, Utc::now())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(SessionRiskResponse {
        session_id: session.session_id,
        risk_score: session.risk_score,
        risk_level: RiskBand::from_score(session.risk_score).as_str(),
        anomalies_detected: session.anomalies,
        is_terminated: session.terminated,
        termination_reason: session.termination_reason,
        transaction_count: session.transaction_count,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    pub analyst_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TerminateResponse {
    pub session_id: String,
    pub terminated: bool,
    /// False when the session was already terminated.
    pub changed: bool,
}

/// `POST /v1/sessions/:id/terminate`
pub async fn post_terminate(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<TerminateRequest>,
) -> Result<Json<TerminateResponse>, StatusCode> {
    let orchestrator = &state.orchestrator;
    let now = Utc::now();

    if orchestrator
        .sessions
        .get(&session_id, now)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }

    let reason = request
        .reason
        .unwrap_or_else(|| "terminated by analyst".to_string());
    let changed = orchestrator
        .sessions
        .terminate(&session_id, &reason, &request.analyst_id, now)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    orchestrator.event_queue.push(StoreJob::Audit(
        AuditEntry::new(
            &request.analyst_id,
            AuditAction::TerminateSession,
            &session_id,
            changed,
        )
        .with_metadata(serde_json::json!({ "reason": reason })),
    ));

    Ok(Json(TerminateResponse {
        session_id,
        terminated: true,
        changed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SuspiciousQuery {
    pub min_risk_score: Option<u32>,
}

/// `GET /v1/sessions/suspicious?min_risk_score`
pub async fn get_suspicious(
    Query(params): Query<SuspiciousQuery>,
    State(state): State<AppState>,
) -> Result<Json<SessionListResponse>, StatusCode> {
    let sessions = state
        .orchestrator
        .sessions
        .list_suspicious(params.min_risk_score.unwrap_or(60))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    }))
}
