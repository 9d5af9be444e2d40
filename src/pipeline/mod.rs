//! Decision pipeline: feature extraction → rules → ML score → policy.
//!
//! All four stages are stateless with respect to requests and shared by
//! every worker; the only mutable collaborator is the in-memory
//! [`HistoryStore`], which the orchestrator updates after each request.

pub mod features;
pub mod policy;
pub mod rules;
pub mod scorer;

pub use features::{FeatureExtractor, FeatureVector, HistoryStore, FEATURE_NAMES};
pub use policy::PolicyCombiner;
pub use rules::RulesEngine;
pub use scorer::MlScorer;

use crate::config::EngineConfig;
use crate::models::{Decision, Transaction};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// The assembled pipeline. Created once at startup and shared by all
/// request workers.
pub struct DecisionPipeline {
    pub history: Arc<HistoryStore>,
    extractor: FeatureExtractor,
    rules: RulesEngine,
    scorer: Arc<MlScorer>,
    policy: PolicyCombiner,
}

impl DecisionPipeline {
    pub fn new(history: Arc<HistoryStore>, scorer: Arc<MlScorer>) -> Self {
        Self {
            history,
            extractor: FeatureExtractor::new(),
            rules: RulesEngine::new(),
            scorer,
            policy: PolicyCombiner::new(),
        }
    }

    /// Classify a single transaction. Pure except for the read-only history
    /// lookups; recording the transaction back into history is the caller's
    /// responsibility so blocked attempts still count toward velocity.
    pub fn run(
        &self,
        tx: &Transaction,
        config: &EngineConfig,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let started = std::time::Instant::now();

        let user = self
            .history
            .user_snapshot(&tx.user_id, tx.amount, now, config.rules.velocity.high_value_amount);
        let device = self.history.device_snapshot(&tx.device_id, &tx.user_id, now);
        let ip_risk = self.history.ip_risk(&tx.source_ip);

        let features = self.extractor.extract(tx, &user, &device, ip_risk, config);
        let rule_result = self.rules.evaluate(tx, &features, &user, &device, config);

        // Early exit: a hard block never consults the model.
        let ml_score = if rule_result.is_hard_block() {
            None
        } else {
            Some(self.scorer.score(&features)?)
        };

        let mut decision = self.policy.combine(&rule_result, ml_score.as_ref(), tx, config);
        decision.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(decision)
    }
}
