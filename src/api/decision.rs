//! Decision endpoint.

use crate::api::{envelope_from, source_from, AppState};
use crate::models::{FeatureContribution, Transaction};
use crate::orchestrator::{DecisionError, SessionRisk};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub decision_code: u8,
    pub decision: &'static str,
    pub score: f64,
    pub ml_score: Option<f64>,
    pub rule_flags: Vec<&'static str>,
    pub reasons: Vec<String>,
    pub latency_ms: f64,
    pub top_features: Vec<FeatureContribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_risk: Option<SessionRisk>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// `POST /v1/decision`: classify one transaction.
pub async fn post_decision(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<Transaction>, JsonRejection>,
) -> Response {
    let Json(tx) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "invalid_request",
                    message: rejection.body_text(),
                }),
            )
                .into_response();
        }
    };

    let orchestrator = &state.orchestrator;
    let config = orchestrator.engine.load();
    let source = source_from(&headers, &addr);
    let envelope = envelope_from(
        &headers,
        source,
        "/v1/decision",
        "POST",
        &config.security.test_sentinel,
        Utc::now(),
    );

    match orchestrator.handle_decision_request(&tx, &envelope) {
        Ok(outcome) => {
            let decision = outcome.decision;
            Json(DecisionResponse {
                decision_code: decision.code.code(),
                decision: decision.code.as_str(),
                score: decision.score,
                ml_score: decision.ml_score.as_ref().map(|m| m.calibrated),
                rule_flags: decision.rule_result.triggered.clone(),
                reasons: decision.reasons,
                latency_ms: decision.latency_ms,
                top_features: decision.top_features,
                session_risk: outcome.session_risk,
            })
            .into_response()
        }
        Err(DecisionError::Input(message)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "invalid_transaction",
                message,
            }),
        )
            .into_response(),
        Err(DecisionError::RateLimited { retry_after_ms }) => {
            // Indefinite blocks surface a fixed cool-down hint.
            let retry_after_secs = retry_after_ms
                .map(|ms| (ms as f64 / 1000.0).ceil() as i64)
                .unwrap_or(3600)
                .max(1);
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                Json(ErrorBody {
                    error: "rate_limit_exceeded",
                    message: "Too many requests. Please slow down.".to_string(),
                }),
            )
                .into_response()
        }
        Err(DecisionError::Pipeline(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: "pipeline_failure",
                message: "decision pipeline failed".to_string(),
            }),
        )
            .into_response(),
    }
}
