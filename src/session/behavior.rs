//! Behavioral risk scorer.
//!
//! Pure function over a session snapshot and the current transaction. Five
//! independent signals each contribute a fixed weight; the sum, clamped to
//! 100, is the session risk. Crossing the critical band terminates the
//! session upstream. The scorer never touches persistent state.

use crate::config::BehaviorConfig;
use crate::session::store::Session;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;

pub const SIGNAL_AMOUNT: &str = "amount_deviation";
pub const SIGNAL_BENEFICIARY: &str = "beneficiary_changes";
pub const SIGNAL_TIME: &str = "time_pattern";
pub const SIGNAL_VELOCITY: &str = "velocity";
pub const SIGNAL_GEO: &str = "geolocation";

/// Risk bands over the 0–100 session scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskBand {
    Low,
    Elevated,
    High,
    Critical,
}

impl RiskBand {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=29 => RiskBand::Low,
            30..=59 => RiskBand::Elevated,
            60..=79 => RiskBand::High,
            _ => RiskBand::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::Low => "LOW",
            RiskBand::Elevated => "ELEVATED",
            RiskBand::High => "HIGH",
            RiskBand::Critical => "CRITICAL",
        }
    }
}

/// The transaction being scored, as seen by the session engine.
#[derive(Debug, Clone)]
pub struct TxnObservation {
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub is_new_beneficiary: bool,
    pub location: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BehaviorAssessment {
    pub risk_score: u32,
    pub band: RiskBand,
    pub signals: Vec<&'static str>,
    /// One `kind:detail` line per triggered signal.
    pub anomalies: Vec<String>,
}

pub struct BehaviorScorer;

impl BehaviorScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score a session snapshot that already includes the observed
    /// transaction in its aggregates.
    pub fn score(
        &self,
        session: &Session,
        txn: &TxnObservation,
        config: &BehaviorConfig,
    ) -> BehaviorAssessment {
        let weights = &config.weights;
        let mut risk = 0u32;
        let mut signals = Vec::new();
        let mut anomalies = Vec::new();

        // Amount deviation: large vs the session's own history or vs the
        // account baseline.
        let prior_count = session.transaction_count.saturating_sub(1);
        let prior_mean = if prior_count > 0 {
            (session.total_amount - txn.amount) / prior_count as f64
        } else {
            0.0
        };
        let vs_session = prior_count > 0 && txn.amount > prior_mean * config.amount_multiplier;
        let vs_baseline = txn.amount > config.user_baseline * config.baseline_multiplier;
        if vs_session || vs_baseline {
            risk += weights.amount_deviation;
            signals.push(SIGNAL_AMOUNT);
            anomalies.push(format!(
                "{}:amount {:.2} vs session mean {:.2}",
                SIGNAL_AMOUNT, txn.amount, prior_mean
            ));
        }

        // Beneficiary churn across the whole session.
        if session.new_beneficiary_count > config.beneficiary_threshold {
            risk += weights.beneficiary_changes;
            signals.push(SIGNAL_BENEFICIARY);
            anomalies.push(format!(
                "{}:{} new beneficiaries in session",
                SIGNAL_BENEFICIARY, session.new_beneficiary_count
            ));
        }

        // Night-window activity, [night_start, night_end) wrapping midnight.
        let hour = txn.timestamp.hour();
        let at_night = if config.night_start > config.night_end {
            hour >= config.night_start || hour < config.night_end
        } else {
            hour >= config.night_start && hour < config.night_end
        };
        if at_night {
            risk += weights.time_pattern;
            signals.push(SIGNAL_TIME);
            anomalies.push(format!("{}:transaction at {:02}:00 UTC", SIGNAL_TIME, hour));
        }

        // Transaction velocity within the session.
        if session.transaction_count > config.velocity_threshold {
            risk += weights.velocity;
            signals.push(SIGNAL_VELOCITY);
            anomalies.push(format!(
                "{}:{} transactions in session",
                SIGNAL_VELOCITY, session.transaction_count
            ));
        }

        // Geolocation: a different location too soon after the session's
        // first observed one implies impossible travel.
        if let Some(first_location) = &session.first_location {
            let elapsed = txn.timestamp - session.created_at;
            if txn.location != *first_location
                && elapsed < Duration::minutes(config.impossible_travel_minutes)
            {
                risk += weights.geolocation;
                signals.push(SIGNAL_GEO);
                anomalies.push(format!(
                    "{}:{} differs from session origin {} after {}m",
                    SIGNAL_GEO,
                    txn.location,
                    first_location,
                    elapsed.num_minutes()
                ));
            }
        }

        let risk_score = risk.min(100);
        BehaviorAssessment {
            risk_score,
            band: RiskBand::from_score(risk_score),
            signals,
            anomalies,
        }
    }
}

impl Default for BehaviorScorer {
    fn default() -> Self {
        Self::new()
    }
}
