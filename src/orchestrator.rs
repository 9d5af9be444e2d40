//! Request orchestrator.
//!
//! One value, created at startup, holding every long-lived component; one
//! method per decision request. Order of operations: rate limit → decision
//! pipeline → session update and behavioral scoring → security monitor →
//! deferred persistence. The pipeline's answer must survive any failure in
//! session tracking or event persistence; those errors are logged and
//! swallowed. The single exception is a session crossing the critical risk
//! threshold, which upgrades the decision to Block.

use crate::config::EngineHandle;
use crate::models::{
    AuditAction, AuditEntry, Decision, DecisionCode, RequestEnvelope, SecurityEvent, ThreatLevel,
    Transaction,
};
use crate::pipeline::DecisionPipeline;
use crate::security::{EventQueue, EventStore, RateLimiter, SecurityMonitor, StoreJob};
use crate::session::{BehaviorScorer, SessionStore, TxnObservation};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

/// Soft per-request budget. Exceeding it degrades the decision to Review.
const DECISION_BUDGET_MS: f64 = 100.0;

pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_SESSION_TERMINATED: &str = "session terminated by behavioral risk";
pub const REASON_SESSION_ALREADY_TERMINATED: &str = "session is terminated";

/// Session fragment of a decision response.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRisk {
    pub session_id: String,
    pub risk_score: u32,
    pub signals_triggered: Vec<&'static str>,
    pub anomalies_detected: Vec<String>,
    pub is_terminated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    pub transaction_count: u32,
}

#[derive(Debug)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub session_risk: Option<SessionRisk>,
}

/// Request-path failures the HTTP layer maps to status codes.
#[derive(Debug)]
pub enum DecisionError {
    Input(String),
    RateLimited { retry_after_ms: Option<i64> },
    Pipeline(anyhow::Error),
}

pub struct Orchestrator {
    pub engine: Arc<EngineHandle>,
    pub pipeline: Arc<DecisionPipeline>,
    pub rate_limiter: Arc<RateLimiter>,
    pub monitor: Arc<SecurityMonitor>,
    pub event_store: Arc<EventStore>,
    pub event_queue: Arc<EventQueue>,
    pub sessions: Arc<SessionStore>,
    pub behavior: BehaviorScorer,
}

impl Orchestrator {
    /// Classify one transaction request end to end.
    pub fn handle_decision_request(
        &self,
        tx: &Transaction,
        envelope: &RequestEnvelope,
    ) -> Result<DecisionOutcome, DecisionError> {
        let started = std::time::Instant::now();
        let config = self.engine.load();
        let now = envelope.now;

        if let Err(reason) = tx.validate() {
            return Err(DecisionError::Input(reason));
        }

        // Admission. The test-only bypass skips the limiter but the request
        // is still recorded and observed.
        if !envelope.security_test_bypass {
            let admit = self.rate_limiter.admit(&envelope.source, now, &config.limits);
            if !admit.allowed {
                self.event_queue.push(StoreJob::Access {
                    source: envelope.source.clone(),
                    endpoint: envelope.endpoint.clone(),
                    method: envelope.method.clone(),
                    status: 429,
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                    now,
                });
                return Err(DecisionError::RateLimited {
                    retry_after_ms: admit.retry_after_ms,
                });
            }
        }

        // Decision pipeline.
        let mut decision = match self.pipeline.run(tx, &config, now) {
            Ok(decision) => decision,
            Err(e) => {
                self.event_queue.push(StoreJob::Audit(
                    AuditEntry::new("system", AuditAction::DecisionRequest, &tx.transaction_id, false)
                        .with_metadata(serde_json::json!({ "error": e.to_string() })),
                ));
                self.event_queue.push(StoreJob::Access {
                    source: envelope.source.clone(),
                    endpoint: envelope.endpoint.clone(),
                    method: envelope.method.clone(),
                    status: 500,
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                    now,
                });
                error!(error = %e, tx = %tx.transaction_id, "decision pipeline failed");
                return Err(DecisionError::Pipeline(e));
            }
        };

        // Attack traffic counts toward velocity too.
        self.pipeline.history.record(tx, now);

        // Session tracking. Never fails the request; a critical behavioral
        // score is the one path allowed to change the decision.
        let session_risk = tx
            .session_id
            .as_deref()
            .and_then(|session_id| self.track_session(session_id, tx, &mut decision, now));

        // Soft deadline: late answers degrade to Review for a human.
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > DECISION_BUDGET_MS && decision.code < DecisionCode::Review {
            warn!(
                elapsed_ms,
                tx = %tx.transaction_id,
                "decision exceeded budget, degrading to review"
            );
            decision.code = DecisionCode::Review;
            decision.reasons.push(REASON_TIMEOUT.to_string());
            self.event_queue.push(StoreJob::Audit(
                AuditEntry::new("system", AuditAction::DecisionRequest, &tx.transaction_id, true)
                    .with_metadata(serde_json::json!({
                        "degraded": "timeout",
                        "elapsed_ms": elapsed_ms,
                    })),
            ));
        }

        // Security monitor and auto-block policy.
        let events = self.monitor.observe(envelope, &config);
        for event in &events {
            if event.level == ThreatLevel::Critical {
                self.auto_block(event, envelope);
            }
            self.event_queue.push(StoreJob::Event(event.clone()));
        }

        decision.latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.event_queue.push(StoreJob::Access {
            source: envelope.source.clone(),
            endpoint: envelope.endpoint.clone(),
            method: envelope.method.clone(),
            status: 200,
            latency_ms: decision.latency_ms,
            now,
        });

        metrics::increment_counter!("fraudgate_decisions_total");
        metrics::histogram!("fraudgate_decision_latency_ms", decision.latency_ms);

        Ok(DecisionOutcome {
            decision,
            session_risk,
        })
    }

    fn track_session(
        &self,
        session_id: &str,
        tx: &Transaction,
        decision: &mut Decision,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<SessionRisk> {
        let config = self.engine.load();
        let metadata = serde_json::to_value(&tx.metadata).unwrap_or(serde_json::Value::Null);

        let recorded = match self.sessions.record_transaction(
            session_id,
            &tx.user_id,
            tx.amount,
            tx.is_new_beneficiary.unwrap_or(false),
            &tx.location,
            &metadata,
            now,
        ) {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!(error = %e, session_id, "session tracking failed, continuing");
                return None;
            }
        };

        // A previously terminated session stays closed; its traffic is
        // blocked outright.
        if recorded.session.terminated && recorded.event_id.is_empty() {
            decision.code = DecisionCode::Block;
            decision.score = 1.0;
            decision
                .reasons
                .push(REASON_SESSION_ALREADY_TERMINATED.to_string());
            return Some(SessionRisk {
                session_id: session_id.to_string(),
                risk_score: recorded.session.risk_score,
                signals_triggered: Vec::new(),
                anomalies_detected: recorded.session.anomalies.clone(),
                is_terminated: true,
                termination_reason: recorded.session.termination_reason.clone(),
                transaction_count: recorded.session.transaction_count,
            });
        }

        let observation = TxnObservation {
            amount: tx.amount,
            timestamp: tx.timestamp,
            is_new_beneficiary: tx.is_new_beneficiary.unwrap_or(false),
            location: tx.location.clone(),
        };
        let assessment = self
            .behavior
            .score(&recorded.session, &observation, &config.behavior);

        if let Err(e) = self.sessions.update_risk(
            session_id,
            assessment.risk_score,
            &assessment.anomalies,
            Some(&recorded.event_id),
            now,
        ) {
            warn!(error = %e, session_id, "persisting session risk failed");
        }

        let mut terminated = false;
        let mut termination_reason = None;
        if assessment.risk_score >= config.behavior.critical_risk {
            match self
                .sessions
                .terminate(session_id, "critical behavioral risk", "system", now)
            {
                Ok(_) => {
                    terminated = true;
                    termination_reason = Some("critical behavioral risk".to_string());
                    decision.code = DecisionCode::Block;
                    decision.score = 1.0;
                    decision.reasons.push(REASON_SESSION_TERMINATED.to_string());
                    self.event_queue.push(StoreJob::Audit(
                        AuditEntry::new("system", AuditAction::TerminateSession, session_id, true)
                            .with_metadata(serde_json::json!({
                                "risk_score": assessment.risk_score,
                                "signals": assessment.signals,
                            })),
                    ));
                    metrics::increment_counter!("fraudgate_sessions_terminated_total");
                }
                Err(e) => {
                    warn!(error = %e, session_id, "session termination failed");
                }
            }
        }

        Some(SessionRisk {
            session_id: session_id.to_string(),
            risk_score: assessment.risk_score,
            signals_triggered: assessment.signals,
            anomalies_detected: assessment.anomalies,
            is_terminated: terminated,
            termination_reason,
            transaction_count: recorded.session.transaction_count,
        })
    }

    /// Level-4 events mark the source blocked in the store and arm an
    /// indefinite limiter block. Store failures are logged, never surfaced.
    fn auto_block(&self, event: &SecurityEvent, envelope: &RequestEnvelope) {
        let config = self.engine.load();
        match self.event_store.block_source(
            &event.source,
            &format!("auto-block: {}", event.description),
            event.level,
            true,
            envelope.now,
        ) {
            Ok(true) => {
                warn!(
                    source = %event.source,
                    kind = event.kind.as_str(),
                    "🚫 Source auto-blocked on critical event"
                );
                metrics::increment_counter!("fraudgate_auto_blocks_total");
            }
            Ok(false) => {} // already blocked
            Err(e) => {
                error!(error = %e, source = %event.source, "auto-block persistence failed");
            }
        }
        self.rate_limiter
            .block_indefinite(&event.source, &config.limits, envelope.now);
    }

    /// Re-arm limiter blocks from the store's active rows. Called once at
    /// startup: rows without an `unblocked_at` are the source of truth.
    pub fn restore_blocks(&self) -> anyhow::Result<usize> {
        let config = self.engine.load();
        let blocked = self.event_store.blocked_sources()?;
        let count = blocked.len();
        for row in blocked {
            self.rate_limiter
                .block_indefinite(&row.source, &config.limits, chrono::Utc::now());
        }
        Ok(count)
    }
}
