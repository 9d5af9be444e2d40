//! Security and analyst endpoints.

use crate::api::AppState;
use crate::models::{AuditAction, AuditEntry, BlockedSource, ThreatKind, ThreatLevel};
use crate::security::event_store::{DashboardStats, EventFilter, SourceRiskProfile};
use crate::security::rate_limit::{Observation, Tier};
use crate::security::StoredEvent;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

const REVIEW_ACTIONS: [&str; 3] = ["dismiss", "investigate", "escalate"];

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    pub min_threat_level: Option<i64>,
    pub threat_type: Option<String>,
    pub source_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<StoredEvent>,
    pub count: usize,
}

/// `GET /v1/security/events`
pub async fn get_events(
    Query(params): Query<EventsQuery>,
    State(state): State<AppState>,
) -> Result<Json<EventsResponse>, StatusCode> {
    let kind = match &params.threat_type {
        Some(raw) => Some(ThreatKind::from_str(raw).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let min_level = match params.min_threat_level {
        Some(raw) => Some(ThreatLevel::from_code(raw).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };

    let filter = EventFilter {
        min_level,
        kind,
        source: params.source_id.clone(),
        limit: params.limit.unwrap_or(100),
    };
    let events = state
        .orchestrator
        .event_store
        .recent_events(&filter)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /v1/security/events/review-queue`
pub async fn get_review_queue(
    State(state): State<AppState>,
) -> Result<Json<EventsResponse>, StatusCode> {
    let events = state
        .orchestrator
        .event_store
        .review_queue(100)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub analyst_id: String,
    pub action: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReviewResponse {
    pub event_id: String,
    /// False when the event had already been reviewed.
    pub changed: bool,
}

/// `POST /v1/security/events/:id/review`
pub async fn post_review_event(
    Path(event_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<ReviewResponse>, StatusCode> {
    if !REVIEW_ACTIONS.contains(&request.action.as_str()) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let orchestrator = &state.orchestrator;
    let changed = orchestrator
        .event_store
        .review_event(
            &event_id,
            &request.analyst_id,
            &request.action,
            request.notes.as_deref(),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    orchestrator
        .event_store
        .record_audit(
            &AuditEntry::new(&request.analyst_id, AuditAction::ReviewEvent, &event_id, changed)
                .with_metadata(serde_json::json!({
                    "action": request.action,
                    "notes": request.notes,
                })),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(ReviewResponse { event_id, changed }))
}

#[derive(Debug, Deserialize, Default)]
pub struct ClearQueueRequest {
    #[serde(default)]
    pub analyst_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClearQueueResponse {
    pub cleared: usize,
}

/// `POST /v1/security/events/review-queue/clear`
pub async fn post_clear_review_queue(
    State(state): State<AppState>,
    request: Option<Json<ClearQueueRequest>>,
) -> Result<Json<ClearQueueResponse>, StatusCode> {
    let analyst = request
        .and_then(|Json(r)| r.analyst_id)
        .unwrap_or_else(|| "system".to_string());

    let orchestrator = &state.orchestrator;
    let cleared = orchestrator
        .event_store
        .clear_review_queue(&analyst)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    orchestrator
        .event_store
        .record_audit(
            &AuditEntry::new(&analyst, AuditAction::ReviewEvent, "review-queue", true)
                .with_metadata(serde_json::json!({ "cleared": cleared })),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(ClearQueueResponse { cleared }))
}

/// `GET /v1/security/dashboard`
pub async fn get_dashboard(
    State(state): State<AppState>,
) -> Result<Json<DashboardStats>, StatusCode> {
    let stats = state
        .orchestrator
        .event_store
        .dashboard(Utc::now())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(stats))
}

/// `GET /v1/security/sources/:id/risk`
pub async fn get_source_risk(
    Path(source_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SourceRiskProfile>, StatusCode> {
    let profile = state
        .orchestrator
        .event_store
        .source_risk_profile(&source_id, 24, Utc::now())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(profile))
}

#[derive(Debug, Serialize)]
pub struct BlockedResponse {
    pub sources: Vec<BlockedSource>,
    pub count: usize,
}

/// `GET /v1/security/sources/blocked`
pub async fn get_blocked(
    State(state): State<AppState>,
) -> Result<Json<BlockedResponse>, StatusCode> {
    let sources = state
        .orchestrator
        .event_store
        .blocked_sources()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(BlockedResponse {
        count: sources.len(),
        sources,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UnblockRequest {
    pub analyst_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UnblockResponse {
    pub source: String,
    /// False when the source was not blocked.
    pub changed: bool,
}

/// `POST /v1/security/sources/:id/unblock`
pub async fn post_unblock(
    Path(source_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<UnblockRequest>,
) -> Result<Json<UnblockResponse>, StatusCode> {
    let orchestrator = &state.orchestrator;
    let config = orchestrator.engine.load();
    let now = Utc::now();

    let changed = orchestrator
        .event_store
        .unblock_source(&source_id, &request.analyst_id, now)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    orchestrator.rate_limiter.unblock(&source_id, &config.limits, now);

    orchestrator
        .event_store
        .record_audit(
            &AuditEntry::new(&request.analyst_id, AuditAction::UnblockSource, &source_id, changed)
                .with_metadata(serde_json::json!({ "reason": request.reason })),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(UnblockResponse {
        source: source_id,
        changed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub analyst_id: String,
}

/// `POST /v1/security/sources/:id/reset`
pub async fn post_reset(
    Path(source_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Result<StatusCode, StatusCode> {
    let orchestrator = &state.orchestrator;
    let config = orchestrator.engine.load();

    orchestrator
        .rate_limiter
        .reset(&source_id, &config.limits, Utc::now());
    orchestrator
        .event_store
        .record_audit(
            &AuditEntry::new(&request.analyst_id, AuditAction::UnblockSource, &source_id, true)
                .with_metadata(serde_json::json!({ "operation": "reset" })),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
pub struct RateLimitResponse {
    pub source: String,
    #[serde(flatten)]
    pub observation: Observation,
}

/// `GET /v1/security/rate-limits/:id`
pub async fn get_rate_limit(
    Path(source_id): Path<String>,
    State(state): State<AppState>,
) -> Json<RateLimitResponse> {
    let orchestrator = &state.orchestrator;
    let config = orchestrator.engine.load();
    let observation = orchestrator
        .rate_limiter
        .observe(&source_id, Utc::now(), &config.limits);
    Json(RateLimitResponse {
        source: source_id,
        observation,
    })
}

#[derive(Debug, Deserialize)]
pub struct SetTierQuery {
    pub tier: String,
    pub analyst_id: String,
}

#[derive(Debug, Serialize)]
pub struct SetTierResponse {
    pub source: String,
    pub tier: Tier,
}

/// `POST /v1/security/rate-limits/:id/tier?tier&analyst_id`
pub async fn post_set_tier(
    Path(source_id): Path<String>,
    Query(params): Query<SetTierQuery>,
    State(state): State<AppState>,
) -> Result<Json<SetTierResponse>, StatusCode> {
    let tier = Tier::from_str(&params.tier).ok_or(StatusCode::BAD_REQUEST)?;

    let orchestrator = &state.orchestrator;
    let config = orchestrator.engine.load();
    orchestrator
        .rate_limiter
        .set_tier(&source_id, tier, &config.limits, Utc::now());

    orchestrator
        .event_store
        .record_audit(
            &AuditEntry::new(&params.analyst_id, AuditAction::SetTier, &source_id, true)
                .with_metadata(serde_json::json!({ "tier": tier.as_str() })),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(SetTierResponse {
        source: source_id,
        tier,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub actor: Option<String>,
    pub resource: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub entries: Vec<crate::models::AuditEntry>,
    pub count: usize,
}

/// `GET /v1/security/audit-trail`
pub async fn get_audit_trail(
    Query(params): Query<AuditQuery>,
    State(state): State<AppState>,
) -> Result<Json<AuditResponse>, StatusCode> {
    let entries = state
        .orchestrator
        .event_store
        .audit_trail(
            params.actor.as_deref(),
            params.resource.as_deref(),
            params.limit.unwrap_or(100),
            params.offset.unwrap_or(0),
        )
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(AuditResponse {
        count: entries.len(),
        entries,
    }))
}
