//! Policy combiner.
//!
//! Merges the rules verdict with the calibrated model score into the final
//! decision. The table is evaluated top to bottom, first match wins, so for
//! a fixed rules outcome the decision is non-decreasing in the calibrated
//! score.

use crate::config::EngineConfig;
use crate::models::{Decision, DecisionCode, HardOutcome, MlScore, RuleResult, Transaction};

pub struct PolicyCombiner;

impl PolicyCombiner {
    pub fn new() -> Self {
        Self
    }

    pub fn combine(
        &self,
        rules: &RuleResult,
        ml: Option<&MlScore>,
        tx: &Transaction,
        config: &EngineConfig,
    ) -> Decision {
        let thresholds = &config.policy;
        let calibrated = ml.map(|m| m.calibrated).unwrap_or(0.0);

        let code = if rules.hard_outcome == Some(HardOutcome::Block) {
            DecisionCode::Block
        } else if rules.hard_outcome == Some(HardOutcome::AllowOnly) {
            DecisionCode::Allow
        } else if calibrated >= thresholds.block {
            DecisionCode::Block
        } else if rules.hard_outcome == Some(HardOutcome::ReviewMin)
            || (tx.amount > thresholds.high_amount && calibrated > thresholds.high_amount_score)
        {
            DecisionCode::Review
        } else if calibrated >= thresholds.review {
            DecisionCode::Review
        } else if rules.hard_outcome == Some(HardOutcome::StepUpMin)
            || calibrated >= thresholds.step_up
        {
            DecisionCode::StepUp
        } else if calibrated >= thresholds.monitor {
            DecisionCode::Monitor
        } else {
            DecisionCode::Allow
        };

        // Rule names first, then the model's view.
        let mut reasons: Vec<String> = rules.triggered.iter().map(|r| r.to_string()).collect();
        if let Some(ml) = ml {
            reasons.push(format!("fraud probability: {:.0}%", ml.calibrated * 100.0));
            for feature in &ml.top_features {
                reasons.push(format!(
                    "{}={:.2} (contribution {:.2})",
                    feature.name, feature.value, feature.contribution
                ));
            }
        }

        let score = if rules.is_hard_block() { 1.0 } else { calibrated };
        let top_features = ml.map(|m| m.top_features.clone()).unwrap_or_default();

        Decision {
            code,
            score,
            reasons,
            latency_ms: 0.0,
            top_features,
            rule_result: rules.clone(),
            ml_score: ml.cloned(),
        }
    }
}

impl Default for PolicyCombiner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn tx(amount: f64) -> Transaction {
        Transaction {
            transaction_id: "tx-1".to_string(),
            user_id: "alice".to_string(),
            device_id: "dev-1".to_string(),
            source_ip: "10.0.0.1".to_string(),
            merchant_id: "m-1".to_string(),
            amount,
            currency: "USD".to_string(),
            timestamp: Utc::now(),
            location: "home".to_string(),
            beneficiary_account: None,
            is_new_beneficiary: None,
            session_id: None,
            metadata: HashMap::new(),
        }
    }

    fn ml(calibrated: f64) -> MlScore {
        MlScore {
            raw: calibrated,
            calibrated,
            top_features: Vec::new(),
        }
    }

    fn combine(
        hard: Option<HardOutcome>,
        triggered: Vec<&'static str>,
        score: Option<f64>,
        amount: f64,
    ) -> Decision {
        let rules = RuleResult {
            triggered,
            hard_outcome: hard,
            reasons: Vec::new(),
        };
        let ml_score = score.map(ml);
        PolicyCombiner::new().combine(&rules, ml_score.as_ref(), &tx(amount), &EngineConfig::default())
    }

    #[test]
    fn test_hard_block_wins_with_unit_score() {
        let decision = combine(Some(HardOutcome::Block), vec!["denylist_user"], None, 50.0);
        assert_eq!(decision.code, DecisionCode::Block);
        assert_eq!(decision.score, 1.0);
        assert_eq!(decision.reasons[0], "denylist_user");
    }

    #[test]
    fn test_score_bands() {
        assert_eq!(combine(None, vec![], Some(0.10), 50.0).code, DecisionCode::Allow);
        assert_eq!(combine(None, vec![], Some(0.40), 50.0).code, DecisionCode::Monitor);
        assert_eq!(combine(None, vec![], Some(0.60), 50.0).code, DecisionCode::StepUp);
        assert_eq!(combine(None, vec![], Some(0.80), 50.0).code, DecisionCode::Review);
        assert_eq!(combine(None, vec![], Some(0.95), 50.0).code, DecisionCode::Block);
    }

    #[test]
    fn test_review_min_floor() {
        let decision = combine(Some(HardOutcome::ReviewMin), vec!["amount_review_absolute"], Some(0.10), 50.0);
        assert_eq!(decision.code, DecisionCode::Review);
        // A review floor never suppresses an ML block.
        let decision = combine(Some(HardOutcome::ReviewMin), vec!["amount_review_absolute"], Some(0.95), 50.0);
        assert_eq!(decision.code, DecisionCode::Block);
    }

    #[test]
    fn test_step_up_min_floor_yields_to_high_score() {
        let decision = combine(Some(HardOutcome::StepUpMin), vec!["amount_first_transaction"], Some(0.20), 50.0);
        assert_eq!(decision.code, DecisionCode::StepUp);

        let decision = combine(Some(HardOutcome::StepUpMin), vec!["amount_first_transaction"], Some(0.80), 50.0);
        assert_eq!(decision.code, DecisionCode::Review);
    }

    #[test]
    fn test_high_amount_with_elevated_score_reviews() {
        // 0.72 alone is only StepUp, but with a high amount it reviews.
        assert_eq!(combine(None, vec![], Some(0.72), 50.0).code, DecisionCode::StepUp);
        assert_eq!(combine(None, vec![], Some(0.72), 6000.0).code, DecisionCode::Review);
    }

    #[test]
    fn test_decision_monotone_in_score() {
        let mut prev = DecisionCode::Allow;
        for i in 0..=100 {
            let score = i as f64 / 100.0;
            let code = combine(None, vec![], Some(score), 50.0).code;
            assert!(code >= prev, "decision regressed at score {}", score);
            prev = code;
        }
    }

    #[test]
    fn test_reasons_order_rules_then_model() {
        let rules = RuleResult {
            triggered: vec!["time_night_window"],
            hard_outcome: None,
            reasons: Vec::new(),
        };
        let ml_score = MlScore {
            raw: 0.6,
            calibrated: 0.62,
            top_features: vec![crate::models::FeatureContribution {
                name: "device_new",
                value: 1.0,
                contribution: 0.9,
            }],
        };
        let decision = PolicyCombiner::new().combine(
            &rules,
            Some(&ml_score),
            &tx(50.0),
            &EngineConfig::default(),
        );

        assert_eq!(decision.reasons[0], "time_night_window");
        assert!(decision.reasons[1].starts_with("fraud probability: 62%"));
        assert!(decision.reasons[2].starts_with("device_new"));
    }

    #[test]
    fn test_nonzero_decisions_carry_reasons() {
        for score in [0.40, 0.60, 0.80, 0.95] {
            let decision = combine(None, vec![], Some(score), 50.0);
            assert_ne!(decision.code, DecisionCode::Allow);
            assert!(!decision.reasons.is_empty());
        }
    }
}
