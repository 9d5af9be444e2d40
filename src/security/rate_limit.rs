//! Per-source rate limiting.
//!
//! Token bucket with tiered capacity. Tokens refill continuously at
//! `capacity / 60s` up to the tier's burst allowance; each admitted request
//! consumes one. Repeated denials inside a five-minute window escalate to a
//! temporary block, and the security monitor can impose an indefinite block
//! that only an analyst lifts.
//!
//! Every source carries its own lock so admissions for different sources
//! never contend; the outer map lock is held only to fetch the entry.

use crate::config::{RateLimitConfig, TierLimit};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

/// Named rate-limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Internal,
    Unlimited,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Internal => "internal",
            Tier::Unlimited => "unlimited",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Tier::Free),
            "basic" => Some(Tier::Basic),
            "premium" => Some(Tier::Premium),
            "internal" => Some(Tier::Internal),
            "unlimited" => Some(Tier::Unlimited),
            _ => None,
        }
    }

    fn limit(&self, config: &RateLimitConfig) -> Option<TierLimit> {
        match self {
            Tier::Free => Some(config.free),
            Tier::Basic => Some(config.basic),
            Tier::Premium => Some(config.premium),
            Tier::Internal => Some(config.internal),
            Tier::Unlimited => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockUntil {
    At(DateTime<Utc>),
    Indefinite,
}

#[derive(Debug)]
struct SourceState {
    tier: Tier,
    tokens: f64,
    last_refill: DateTime<Utc>,
    violations: VecDeque<DateTime<Utc>>,
    blocked_until: Option<BlockUntil>,
}

impl SourceState {
    fn new(tier: Tier, config: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        let tokens = tier.limit(config).map(|l| l.burst as f64).unwrap_or(0.0);
        Self {
            tier,
            tokens,
            last_refill: now,
            violations: VecDeque::new(),
            blocked_until: None,
        }
    }

    fn refill(&mut self, limit: &TierLimit, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        let rate = limit.capacity_per_minute as f64 / 60.0;
        self.tokens = (self.tokens + elapsed * rate).min(limit.burst as f64);
        self.last_refill = now;
    }

    fn evict_violations(&mut self, window: Duration, now: DateTime<Utc>) {
        while let Some(front) = self.violations.front() {
            if now - *front > window {
                self.violations.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_block_window(&self, now: DateTime<Utc>) -> Option<Option<i64>> {
        match self.blocked_until {
            Some(BlockUntil::Indefinite) => Some(None),
            Some(BlockUntil::At(until)) if until > now => {
                Some(Some((until - now).num_milliseconds()))
            }
            _ => None,
        }
    }
}

/// Snapshot of one source's limiter state.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub tier: Tier,
    pub remaining_tokens: f64,
    pub violation_count: usize,
    pub blocked: bool,
    /// Remaining block time; absent for indefinite blocks.
    pub retry_after_ms: Option<i64>,
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone)]
pub struct AdmitDecision {
    pub allowed: bool,
    /// Cool-down hint on denial; `None` means an indefinite block.
    pub retry_after_ms: Option<i64>,
    pub observation: Observation,
}

pub struct RateLimiter {
    states: Mutex<HashMap<String, Arc<Mutex<SourceState>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    fn state_for(
        &self,
        source: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Arc<Mutex<SourceState>> {
        let mut states = self.states.lock();
        states
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SourceState::new(Tier::Free, config, now))))
            .clone()
    }

    /// Try to admit one request from `source` at `now`.
    pub fn admit(&self, source: &str, now: DateTime<Utc>, config: &RateLimitConfig) -> AdmitDecision {
        let entry = self.state_for(source, config, now);
        let mut state = entry.lock();

        let Some(limit) = state.tier.limit(config) else {
            // Unlimited tier bypasses the bucket entirely.
            return AdmitDecision {
                allowed: true,
                retry_after_ms: None,
                observation: Observation {
                    tier: state.tier,
                    remaining_tokens: f64::INFINITY,
                    violation_count: 0,
                    blocked: false,
                    retry_after_ms: None,
                },
            };
        };

        state.evict_violations(Duration::seconds(config.violation_window_secs), now);

        // An active block denies without touching the bucket.
        if let Some(retry_after_ms) = state.in_block_window(now) {
            return AdmitDecision {
                allowed: false,
                retry_after_ms,
                observation: Self::observe_locked(&state, now),
            };
        }
        // A lapsed temporary block clears itself.
        if matches!(state.blocked_until, Some(BlockUntil::At(_))) {
            state.blocked_until = None;
        }

        state.refill(&limit, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            metrics::increment_counter!("fraudgate_rate_limit_admitted_total");
            return AdmitDecision {
                allowed: true,
                retry_after_ms: None,
                observation: Self::observe_locked(&state, now),
            };
        }

        // Denied: record a violation and maybe open a temporary block.
        state.violations.push_back(now);
        metrics::increment_counter!("fraudgate_rate_limit_denied_total");

        let retry_after_ms = if state.violations.len() >= config.violation_threshold {
            let until = now + Duration::seconds(config.temp_block_secs);
            state.blocked_until = Some(BlockUntil::At(until));
            warn!(
                source = source,
                violations = state.violations.len(),
                "⛔ Source entered temporary rate-limit block"
            );
            (until - now).num_milliseconds()
        } else {
            // Time until one token refills.
            let rate = limit.capacity_per_minute as f64 / 60.0;
            (((1.0 - state.tokens) / rate) * 1000.0).ceil() as i64
        };

        AdmitDecision {
            allowed: false,
            retry_after_ms: Some(retry_after_ms.max(1)),
            observation: Self::observe_locked(&state, now),
        }
    }

    fn observe_locked(state: &SourceState, now: DateTime<Utc>) -> Observation {
        let block = state.in_block_window(now);
        Observation {
            tier: state.tier,
            remaining_tokens: state.tokens,
            violation_count: state.violations.len(),
            blocked: block.is_some(),
            retry_after_ms: block.flatten(),
        }
    }

    /// Snapshot without consuming a token.
    pub fn observe(&self, source: &str, now: DateTime<Utc>, config: &RateLimitConfig) -> Observation {
        let entry = self.state_for(source, config, now);
        let mut state = entry.lock();
        state.evict_violations(Duration::seconds(config.violation_window_secs), now);
        Self::observe_locked(&state, now)
    }

    /// Assign a tier. Idempotent: re-assigning the current tier is a no-op.
    pub fn set_tier(&self, source: &str, tier: Tier, config: &RateLimitConfig, now: DateTime<Utc>) {
        let entry = self.state_for(source, config, now);
        let mut state = entry.lock();
        if state.tier == tier {
            return;
        }
        state.tier = tier;
        state.tokens = tier.limit(config).map(|l| l.burst as f64).unwrap_or(0.0);
        state.last_refill = now;
        info!(source = source, tier = tier.as_str(), "🎚️ Rate-limit tier set");
    }

    /// Clear bucket, violations, and any block. Idempotent.
    pub fn reset(&self, source: &str, config: &RateLimitConfig, now: DateTime<Utc>) {
        let entry = self.state_for(source, config, now);
        let mut state = entry.lock();
        let tier = state.tier;
        *state = SourceState::new(tier, config, now);
        info!(source = source, "♻️ Rate-limit state reset");
    }

    /// Impose a block that persists until an analyst lifts it. Idempotent.
    pub fn block_indefinite(&self, source: &str, config: &RateLimitConfig, now: DateTime<Utc>) {
        let entry = self.state_for(source, config, now);
        let mut state = entry.lock();
        state.blocked_until = Some(BlockUntil::Indefinite);
    }

    /// Lift any block and give the source a fresh bucket so it is not
    /// instantly re-blocked by stale violations. Idempotent.
    pub fn unblock(&self, source: &str, config: &RateLimitConfig, now: DateTime<Utc>) {
        let entry = self.state_for(source, config, now);
        let mut state = entry.lock();
        state.blocked_until = None;
        state.violations.clear();
        state.tokens = state.tier.limit(config).map(|l| l.burst as f64).unwrap_or(0.0);
        state.last_refill = now;
    }

    /// Periodic sweep of idle default-tier entries (call from a background
    /// task). Blocked sources and assigned tiers are kept.
    pub fn cleanup(&self, now: DateTime<Utc>) {
        let mut states = self.states.lock();
        states.retain(|_, entry| {
            let state = entry.lock();
            state.tier != Tier::Free
                || state.blocked_until.is_some()
                || now - state.last_refill < Duration::hours(1)
        });
    }

    pub fn tracked_sources(&self) -> usize {
        self.states.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig::default()
    }

    #[test]
    fn test_burst_admitted_then_denied() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        // Free tier: burst of 10.
        for i in 0..10 {
            let decision = limiter.admit("src", now, &cfg);
            assert!(decision.allowed, "request {} should be admitted", i);
        }
        let decision = limiter.admit("src", now, &cfg);
        assert!(!decision.allowed);
        assert!(decision.retry_after_ms.unwrap() > 0);
    }

    #[test]
    fn test_tokens_refill_over_time() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        for _ in 0..10 {
            assert!(limiter.admit("src", now, &cfg).allowed);
        }
        assert!(!limiter.admit("src", now, &cfg).allowed);

        // Free tier refills at 20/min; 9 seconds buys 3 tokens.
        let later = now + Duration::seconds(9);
        assert!(limiter.admit("src", later, &cfg).allowed);
        assert!(limiter.admit("src", later, &cfg).allowed);
        assert!(limiter.admit("src", later, &cfg).allowed);
        assert!(!limiter.admit("src", later, &cfg).allowed);
    }

    #[test]
    fn test_token_count_monotone_under_consumption() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        let mut prev = f64::INFINITY;
        for _ in 0..10 {
            let decision = limiter.admit("src", now, &cfg);
            assert!(decision.observation.remaining_tokens < prev);
            prev = decision.observation.remaining_tokens;
        }
    }

    #[test]
    fn test_three_violations_open_temporary_block() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        for _ in 0..10 {
            limiter.admit("src", now, &cfg);
        }
        // Three denials within the window.
        for _ in 0..3 {
            assert!(!limiter.admit("src", now, &cfg).allowed);
        }

        let decision = limiter.admit("src", now + Duration::seconds(5), &cfg);
        assert!(!decision.allowed);
        assert!(decision.observation.blocked);
        let retry = decision.retry_after_ms.unwrap();
        assert!(retry > 0 && retry <= cfg.temp_block_secs * 1000);

        // Block expires after the configured window.
        let after = now + Duration::seconds(cfg.temp_block_secs + 301);
        let decision = limiter.admit("src", after, &cfg);
        assert!(decision.allowed);
    }

    #[test]
    fn test_violations_evicted_after_window() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        for _ in 0..10 {
            limiter.admit("src", now, &cfg);
        }
        limiter.admit("src", now, &cfg);
        limiter.admit("src", now, &cfg);
        assert_eq!(limiter.observe("src", now, &cfg).violation_count, 2);

        let later = now + Duration::seconds(cfg.violation_window_secs + 1);
        assert_eq!(limiter.observe("src", later, &cfg).violation_count, 0);
    }

    #[test]
    fn test_indefinite_block_until_unblocked() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        limiter.block_indefinite("src", &cfg, now);
        let much_later = now + Duration::days(7);
        let decision = limiter.admit("src", much_later, &cfg);
        assert!(!decision.allowed);
        assert!(decision.retry_after_ms.is_none());

        limiter.unblock("src", &cfg, much_later);
        assert!(limiter.admit("src", much_later, &cfg).allowed);
    }

    #[test]
    fn test_unlimited_tier_bypasses() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        limiter.set_tier("internal-batch", Tier::Unlimited, &cfg, now);
        for _ in 0..10_000 {
            assert!(limiter.admit("internal-batch", now, &cfg).allowed);
        }
    }

    #[test]
    fn test_tier_change_and_idempotent_reset() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        limiter.set_tier("src", Tier::Premium, &cfg, now);
        // Premium burst: 100.
        for _ in 0..100 {
            assert!(limiter.admit("src", now, &cfg).allowed);
        }
        assert!(!limiter.admit("src", now, &cfg).allowed);

        limiter.reset("src", &cfg, now);
        limiter.reset("src", &cfg, now); // safe to repeat
        let obs = limiter.observe("src", now, &cfg);
        assert_eq!(obs.tier, Tier::Premium);
        assert_eq!(obs.violation_count, 0);
        assert!(limiter.admit("src", now, &cfg).allowed);
    }

    #[test]
    fn test_sources_isolated() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        for _ in 0..10 {
            limiter.admit("a", now, &cfg);
        }
        assert!(!limiter.admit("a", now, &cfg).allowed);
        assert!(limiter.admit("b", now, &cfg).allowed);
    }

    #[test]
    fn test_cleanup_keeps_blocked_and_tiered() {
        let limiter = RateLimiter::new();
        let cfg = config();
        let now = Utc::now();

        limiter.admit("idle", now, &cfg);
        limiter.set_tier("premium", Tier::Premium, &cfg, now);
        limiter.block_indefinite("bad", &cfg, now);
        assert_eq!(limiter.tracked_sources(), 3);

        limiter.cleanup(now + Duration::hours(2));
        assert_eq!(limiter.tracked_sources(), 2);
    }

    #[test]
    fn test_concurrent_admissions_never_overspend() {
        use std::sync::Arc as StdArc;
        let limiter = StdArc::new(RateLimiter::new());
        let cfg = config();
        let now = Utc::now();

        let mut handles = Vec::new();
        let admitted = StdArc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..8 {
            let limiter = limiter.clone();
            let cfg = cfg.clone();
            let admitted = admitted.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    if limiter.admit("shared", now, &cfg).allowed {
                        admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Free tier burst is 10; with a fixed clock no refill can occur.
        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 10);
    }
}
