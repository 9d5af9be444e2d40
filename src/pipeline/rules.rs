//! Deterministic rules engine.
//!
//! Table-driven checks over the transaction and its feature vector. Rule
//! names are stable identifiers used as log keys and surfaced verbatim in
//! decision reasons. A hard BLOCK short-circuits evaluation; the model is
//! never consulted for it.

use crate::config::EngineConfig;
use crate::models::{HardOutcome, RuleResult, Transaction};
use crate::pipeline::features::{DeviceSnapshot, FeatureVector, UserSnapshot, F_DISTANCE_KM};
use chrono::Timelike;

pub const RULE_DENYLIST_USER: &str = "denylist_user";
pub const RULE_DENYLIST_DEVICE: &str = "denylist_device";
pub const RULE_DENYLIST_IP: &str = "denylist_ip";
pub const RULE_DENYLIST_MERCHANT: &str = "denylist_merchant";
pub const RULE_VELOCITY_USER_1H: &str = "velocity_user_1h";
pub const RULE_VELOCITY_USER_1D: &str = "velocity_user_1d";
pub const RULE_VELOCITY_DEVICE_1H: &str = "velocity_device_1h";
pub const RULE_VELOCITY_HIGH_VALUE_1D: &str = "velocity_high_value_1d";
pub const RULE_GEO_DISTANCE: &str = "geo_distance_review";
pub const RULE_GEO_IMPOSSIBLE_TRAVEL: &str = "geo_impossible_travel";
pub const RULE_TIME_NIGHT_WINDOW: &str = "time_night_window";
pub const RULE_AMOUNT_FIRST_TXN: &str = "amount_first_transaction";
pub const RULE_AMOUNT_ABSOLUTE: &str = "amount_review_absolute";
pub const RULE_AMOUNT_OVER_MEAN: &str = "amount_over_user_mean";

pub struct RulesEngine;

impl RulesEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        tx: &Transaction,
        features: &FeatureVector,
        user: &UserSnapshot,
        device: &DeviceSnapshot,
        config: &EngineConfig,
    ) -> RuleResult {
        let mut result = RuleResult::default();
        let rules = &config.rules;

        // Deny lists. Any hit is terminal.
        if rules.deny_lists.users.contains(&tx.user_id) {
            return blocked(result, RULE_DENYLIST_USER, format!("user {} is deny-listed", tx.user_id));
        }
        if rules.deny_lists.devices.contains(&tx.device_id) {
            return blocked(
                result,
                RULE_DENYLIST_DEVICE,
                format!("device {} is deny-listed", tx.device_id),
            );
        }
        if rules.deny_lists.ips.contains(&tx.source_ip) {
            return blocked(result, RULE_DENYLIST_IP, format!("ip {} is deny-listed", tx.source_ip));
        }
        if rules.deny_lists.merchants.contains(&tx.merchant_id) {
            return blocked(
                result,
                RULE_DENYLIST_MERCHANT,
                format!("merchant {} is deny-listed", tx.merchant_id),
            );
        }

        // Velocity caps. Counts include the current transaction.
        let velocity_user_1h = user.count_1h + 1;
        if velocity_user_1h > rules.velocity.user_hourly {
            return blocked(
                result,
                RULE_VELOCITY_USER_1H,
                format!(
                    "{} transactions in 1h exceeds cap {}",
                    velocity_user_1h, rules.velocity.user_hourly
                ),
            );
        }
        let velocity_user_1d = user.count_1d + 1;
        if velocity_user_1d > rules.velocity.user_daily {
            return blocked(
                result,
                RULE_VELOCITY_USER_1D,
                format!(
                    "{} transactions in 24h exceeds cap {}",
                    velocity_user_1d, rules.velocity.user_daily
                ),
            );
        }
        let velocity_device_1h = device.count_1h + 1;
        if velocity_device_1h > rules.velocity.device_hourly {
            return blocked(
                result,
                RULE_VELOCITY_DEVICE_1H,
                format!(
                    "{} transactions from device in 1h exceeds cap {}",
                    velocity_device_1h, rules.velocity.device_hourly
                ),
            );
        }

        if tx.amount > rules.velocity.high_value_amount {
            let high_value_1d = user.high_value_count_1d + 1;
            if high_value_1d > rules.velocity.high_value_daily {
                return blocked(
                    result,
                    RULE_VELOCITY_HIGH_VALUE_1D,
                    format!(
                        "{} transactions above {:.0} in 24h exceeds cap {}",
                        high_value_1d,
                        rules.velocity.high_value_amount,
                        rules.velocity.high_value_daily
                    ),
                );
            }
        }

        // Geographic rules.
        if let Some((last_ts, last_location)) = &user.last_seen {
            let km = config.distance_km(last_location, &tx.location);
            let elapsed_hours = (tx.timestamp - *last_ts).num_seconds() as f64 / 3600.0;
            if km > rules.geo.impossible_travel_km
                && elapsed_hours >= 0.0
                && elapsed_hours < rules.geo.impossible_travel_hours
            {
                return blocked(
                    result,
                    RULE_GEO_IMPOSSIBLE_TRAVEL,
                    format!("{:.0} km travelled in {:.1}h", km, elapsed_hours),
                );
            }
        }

        let distance = features.get(F_DISTANCE_KM);
        if distance > rules.geo.distance_km_review {
            result.triggered.push(RULE_GEO_DISTANCE);
            result
                .reasons
                .push(format!("{:.0} km from usual location", distance));
            escalate(&mut result, HardOutcome::ReviewMin);
        }

        // Time rules: the night window raises risk but forces nothing.
        let hour = tx.timestamp.hour();
        if hour >= rules.time.night_window_start && hour < rules.time.night_window_end {
            result.triggered.push(RULE_TIME_NIGHT_WINDOW);
            result
                .reasons
                .push(format!("transaction at {:02}:00 local", hour));
        }

        // Amount rules.
        if user.total_count == 0 && tx.amount > rules.amount.first_transaction_stepup {
            result.triggered.push(RULE_AMOUNT_FIRST_TXN);
            result.reasons.push(format!(
                "first transaction of {:.2} exceeds {:.0}",
                tx.amount, rules.amount.first_transaction_stepup
            ));
            escalate(&mut result, HardOutcome::StepUpMin);
        }
        if tx.amount > rules.amount.review_absolute {
            result.triggered.push(RULE_AMOUNT_ABSOLUTE);
            result.reasons.push(format!(
                "amount {:.2} exceeds {:.0}",
                tx.amount, rules.amount.review_absolute
            ));
            escalate(&mut result, HardOutcome::ReviewMin);
        }
        if let Some(mean) = user.mean_30d {
            if mean > 0.0 && tx.amount > mean * rules.amount.review_multiplier_of_mean {
                result.triggered.push(RULE_AMOUNT_OVER_MEAN);
                result.reasons.push(format!(
                    "amount {:.2} is over {:.0}x the 30-day mean {:.2}",
                    tx.amount, rules.amount.review_multiplier_of_mean, mean
                ));
                escalate(&mut result, HardOutcome::ReviewMin);
            }
        }

        result
    }
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn blocked(mut result: RuleResult, rule: &'static str, reason: String) -> RuleResult {
    result.triggered.push(rule);
    result.reasons.push(reason);
    result.hard_outcome = Some(HardOutcome::Block);
    result
}

/// Raise the hard outcome, never lower it.
fn escalate(result: &mut RuleResult, outcome: HardOutcome) {
    let rank = |o: &HardOutcome| match o {
        HardOutcome::AllowOnly => 0,
        HardOutcome::StepUpMin => 1,
        HardOutcome::ReviewMin => 2,
        HardOutcome::Block => 3,
    };
    match &result.hard_outcome {
        Some(current) if rank(current) >= rank(&outcome) => {}
        _ => result.hard_outcome = Some(outcome),
    }
}
