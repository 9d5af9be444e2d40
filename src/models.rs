//! Core domain types shared across the decision pipeline and the
//! security monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Final decision outcome. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DecisionCode {
    Allow = 0,
    Monitor = 1,
    StepUp = 2,
    Review = 3,
    Block = 4,
}

impl DecisionCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionCode::Allow => "allow",
            DecisionCode::Monitor => "monitor",
            DecisionCode::StepUp => "step_up",
            DecisionCode::Review => "review",
            DecisionCode::Block => "block",
        }
    }
}

/// A rules-engine verdict that fixes or lower-bounds the final decision
/// regardless of the model score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardOutcome {
    AllowOnly,
    StepUpMin,
    ReviewMin,
    Block,
}

/// Inbound transaction. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub user_id: String,
    pub device_id: String,
    pub source_ip: String,
    pub merchant_id: String,
    pub amount: f64,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    #[serde(default)]
    pub beneficiary_account: Option<String>,
    #[serde(default)]
    pub is_new_beneficiary: Option<bool>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Transaction {
    /// Basic input validation before the pipeline runs.
    pub fn validate(&self) -> Result<(), String> {
        if self.transaction_id.trim().is_empty() {
            return Err("transaction_id must not be empty".to_string());
        }
        if self.user_id.trim().is_empty() {
            return Err("user_id must not be empty".to_string());
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err("amount must be a non-negative number".to_string());
        }
        Ok(())
    }
}

/// Output of the rules engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleResult {
    pub triggered: Vec<&'static str>,
    pub hard_outcome: Option<HardOutcome>,
    pub reasons: Vec<String>,
}

impl RuleResult {
    pub fn is_hard_block(&self) -> bool {
        self.hard_outcome == Some(HardOutcome::Block)
    }
}

/// One of the three most influential model features for a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureContribution {
    pub name: &'static str,
    pub value: f64,
    pub contribution: f64,
}

/// Output of the ML scorer.
#[derive(Debug, Clone, Serialize)]
pub struct MlScore {
    pub raw: f64,
    pub calibrated: f64,
    pub top_features: Vec<FeatureContribution>,
}

/// Final combined decision for a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub code: DecisionCode,
    pub score: f64,
    pub reasons: Vec<String>,
    pub latency_ms: f64,
    pub top_features: Vec<FeatureContribution>,
    pub rule_result: RuleResult,
    pub ml_score: Option<MlScore>,
}

/// Threat taxonomy for the security monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatKind {
    ApiAbuse,
    BruteForce,
    DataExfiltration,
    InsiderThreat,
    PrivilegeEscalation,
    UnusualAccess,
    SystemAnomaly,
}

impl ThreatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::ApiAbuse => "api_abuse",
            ThreatKind::BruteForce => "brute_force",
            ThreatKind::DataExfiltration => "data_exfiltration",
            ThreatKind::InsiderThreat => "insider_threat",
            ThreatKind::PrivilegeEscalation => "privilege_escalation",
            ThreatKind::UnusualAccess => "unusual_access",
            ThreatKind::SystemAnomaly => "system_anomaly",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "api_abuse" => Some(ThreatKind::ApiAbuse),
            "brute_force" => Some(ThreatKind::BruteForce),
            "data_exfiltration" => Some(ThreatKind::DataExfiltration),
            "insider_threat" => Some(ThreatKind::InsiderThreat),
            "privilege_escalation" => Some(ThreatKind::PrivilegeEscalation),
            "unusual_access" => Some(ThreatKind::UnusualAccess),
            "system_anomaly" => Some(ThreatKind::SystemAnomaly),
            _ => None,
        }
    }
}

/// Severity scale. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ThreatLevel {
    Info = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl ThreatLevel {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Info => "info",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ThreatLevel::Info),
            1 => Some(ThreatLevel::Low),
            2 => Some(ThreatLevel::Medium),
            3 => Some(ThreatLevel::High),
            4 => Some(ThreatLevel::Critical),
            _ => None,
        }
    }
}

/// A detected security event. Events at Medium or above land in the SOC
/// review queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ThreatKind,
    pub level: ThreatLevel,
    pub source: String,
    pub endpoint: String,
    pub description: String,
    pub metadata: serde_json::Value,
    pub requires_review: bool,
}

impl SecurityEvent {
    pub fn new(
        kind: ThreatKind,
        level: ThreatLevel,
        source: &str,
        endpoint: &str,
        description: String,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            level,
            source: source.to_string(),
            endpoint: endpoint.to_string(),
            description,
            metadata,
            requires_review: level >= ThreatLevel::Medium,
        }
    }
}

/// A block record for a source. At most one row per source may have a null
/// `unblocked_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedSource {
    pub source: String,
    pub blocked_at: DateTime<Utc>,
    pub reason: String,
    pub level: ThreatLevel,
    pub auto: bool,
    pub unblocked_at: Option<DateTime<Utc>>,
    pub unblocked_by: Option<String>,
}

/// Actions recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ReviewEvent,
    UnblockSource,
    SetTier,
    BlockSource,
    DecisionRequest,
    DataAccess,
    TerminateSession,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ReviewEvent => "review_event",
            AuditAction::UnblockSource => "unblock_source",
            AuditAction::SetTier => "set_tier",
            AuditAction::BlockSource => "block_source",
            AuditAction::DecisionRequest => "decision_request",
            AuditAction::DataAccess => "data_access",
            AuditAction::TerminateSession => "terminate_session",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "review_event" => Some(AuditAction::ReviewEvent),
            "unblock_source" => Some(AuditAction::UnblockSource),
            "set_tier" => Some(AuditAction::SetTier),
            "block_source" => Some(AuditAction::BlockSource),
            "decision_request" => Some(AuditAction::DecisionRequest),
            "data_access" => Some(AuditAction::DataAccess),
            "terminate_session" => Some(AuditAction::TerminateSession),
            _ => None,
        }
    }
}

/// One analyst or system action, as persisted in the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub resource: String,
    pub success: bool,
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    pub fn new(actor: &str, action: AuditAction, resource: &str, success: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action,
            resource: resource.to_string(),
            success,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Authentication result reported by the edge via `X-Auth-Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    Failed,
}

/// Request metadata observed by the orchestrator and fed to the security
/// monitor. Headers are parsed once at the HTTP boundary.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub source: String,
    pub endpoint: String,
    pub method: String,
    pub auth_result: Option<AuthResult>,
    pub records_accessed: Option<u64>,
    /// `X-Access-Time: off-hours` forces the insider-threat time predicate.
    pub off_hours_sentinel: bool,
    /// `X-Endpoint-Type: privileged` marks privileged-endpoint access.
    pub privileged_sentinel: bool,
    /// `X-Security-Test` carried the configured sentinel.
    pub security_test_bypass: bool,
    pub now: DateTime<Utc>,
}

impl RequestEnvelope {
    pub fn new(source: &str, endpoint: &str, method: &str, now: DateTime<Utc>) -> Self {
        Self {
            source: source.to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            auth_result: None,
            records_accessed: None,
            off_hours_sentinel: false,
            privileged_sentinel: false,
            security_test_bypass: false,
            now,
        }
    }
}
