//! HTTP surface under `/v1/`.
//!
//! The decision endpoint drives the full orchestrator flow; session and
//! security endpoints receive the relevant sub-references directly. A thin
//! observer middleware feeds analyst-surface traffic to the security
//! monitor so abuse of the API itself is detected the same way as abuse of
//! the decision plane.

pub mod decision;
pub mod health;
pub mod security;
pub mod sessions;

use crate::middleware::auth::{analyst_auth, AnalystAuth};
use crate::models::{AuthResult, RequestEnvelope, ThreatLevel};
use crate::orchestrator::Orchestrator;
use crate::security::StoreJob;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware as axum_mw,
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: DateTime<Utc>,
}

/// Derive the request source: `X-Source-ID` header if present, else the
/// client network address.
pub fn source_from(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("X-Source-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Parse the security-relevant headers into a request envelope.
pub fn envelope_from(
    headers: &HeaderMap,
    source: String,
    endpoint: &str,
    method: &str,
    test_sentinel: &str,
    now: DateTime<Utc>,
) -> RequestEnvelope {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let mut envelope = RequestEnvelope::new(&source, endpoint, method, now);
    envelope.auth_result = match header("X-Auth-Result") {
        Some("success") => Some(AuthResult::Success),
        Some("failed") => Some(AuthResult::Failed),
        _ => None,
    };
    envelope.records_accessed = header("X-Records-Accessed").and_then(|v| v.parse().ok());
    envelope.off_hours_sentinel = header("X-Access-Time") == Some("off-hours");
    envelope.privileged_sentinel = header("X-Endpoint-Type") == Some("privileged");
    envelope.security_test_bypass = header("X-Security-Test") == Some(test_sentinel);
    envelope
}

/// Observer middleware for the analyst surfaces: runs the security monitor
/// over the request envelope, applies the auto-block policy, and logs the
/// access row. Never rejects a request.
pub async fn security_observer(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let orchestrator = &state.orchestrator;
    let config = orchestrator.engine.load();
    let now = Utc::now();
    let source = source_from(request.headers(), &addr);
    let endpoint = request.uri().path().to_string();
    let method = request.method().to_string();

    let envelope = envelope_from(
        request.headers(),
        source,
        &endpoint,
        &method,
        &config.security.test_sentinel,
        now,
    );

    let events = orchestrator.monitor.observe(&envelope, &config);
    for event in &events {
        if event.level == ThreatLevel::Critical {
            let _ = orchestrator.event_store.block_source(
                &event.source,
                &format!("auto-block: {}", event.description),
                event.level,
                true,
                now,
            );
            orchestrator
                .rate_limiter
                .block_indefinite(&event.source, &config.limits, now);
        }
        orchestrator.event_queue.push(StoreJob::Event(event.clone()));
    }

    let started = std::time::Instant::now();
    let response = next.run(request).await;

    orchestrator.event_queue.push(StoreJob::Access {
        source: envelope.source,
        endpoint,
        method,
        status: response.status().as_u16(),
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        now,
    });

    response
}

/// Assemble the `/v1` router. Analyst surfaces sit behind the observer and
/// (when configured) the bearer-token check; health stays open.
pub fn router(state: AppState, analyst_token: Option<String>) -> Router {
    let auth = AnalystAuth::new(analyst_token);

    let decision_routes = Router::new()
        .route("/v1/decision", post(decision::post_decision))
        .with_state(state.clone());

    let analyst_routes = Router::new()
        .route("/v1/sessions/active", get(sessions::get_active))
        .route("/v1/sessions/suspicious", get(sessions::get_suspicious))
        .route("/v1/sessions/:id", get(sessions::get_session))
        .route("/v1/sessions/:id/risk", get(sessions::get_session_risk))
        .route("/v1/sessions/:id/terminate", post(sessions::post_terminate))
        .route("/v1/security/events", get(security::get_events))
        .route(
            "/v1/security/events/review-queue",
            get(security::get_review_queue),
        )
        .route(
            "/v1/security/events/review-queue/clear",
            post(security::post_clear_review_queue),
        )
        .route(
            "/v1/security/events/:id/review",
            post(security::post_review_event),
        )
        .route("/v1/security/dashboard", get(security::get_dashboard))
        .route("/v1/security/sources/blocked", get(security::get_blocked))
        .route(
            "/v1/security/sources/:id/risk",
            get(security::get_source_risk),
        )
        .route(
            "/v1/security/sources/:id/unblock",
            post(security::post_unblock),
        )
        .route("/v1/security/sources/:id/reset", post(security::post_reset))
        .route(
            "/v1/security/rate-limits/:id",
            get(security::get_rate_limit),
        )
        .route(
            "/v1/security/rate-limits/:id/tier",
            post(security::post_set_tier),
        )
        .route("/v1/security/audit-trail", get(security::get_audit_trail))
        .route_layer(axum_mw::from_fn_with_state(auth, analyst_auth))
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            security_observer,
        ))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/v1/security/health", get(health::get_health))
        .with_state(state);

    Router::new()
        .merge(decision_routes)
        .merge(analyst_routes)
        .merge(health_routes)
}
