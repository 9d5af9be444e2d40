//! Security monitor.
//!
//! Per-source rolling windows over request metadata, with ten detection
//! predicates across seven threat kinds. Detection is pure observation:
//! events are returned to the orchestrator, which applies the auto-block
//! policy and persists them. Everything here is in-memory and must stay
//! inside the per-request millisecond budget.
//!
//! Re-emission is suppressed per (source, kind) until the predicate has
//! been false for a 60-second cooldown, unless the level has increased.

use crate::config::EngineConfig;
use crate::models::{AuthResult, RequestEnvelope, SecurityEvent, ThreatKind, ThreatLevel};
use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

const REQUEST_RING_CAP: usize = 1000;
const COOLDOWN_SECS: i64 = 60;

// API abuse request-rate thresholds over the trailing 60 seconds.
const ABUSE_BURST: usize = 50;
const ABUSE_SUSTAINED: usize = 100;
const ABUSE_SEVERE: usize = 500;

// Brute-force thresholds over the trailing 15 minutes.
const BRUTE_FORCE_WINDOW_MIN: i64 = 15;
const BRUTE_FORCE_WARN: usize = 5;
const BRUTE_FORCE_CRITICAL: usize = 10;

// Exfiltration: records in one request vs the source's rolling 1h mean.
const EXFIL_MEAN_MULTIPLIER: f64 = 10.0;
const EXFIL_ABSOLUTE_MIN: u64 = 100;

// Hours counted as off-hours for insider-threat detection.
const OFF_HOURS: [u32; 8] = [22, 23, 0, 1, 2, 3, 4, 5];

#[derive(Debug, Default)]
struct EmitState {
    last_level: Option<ThreatLevel>,
    false_since: Option<DateTime<Utc>>,
    rearmed: bool,
}

impl EmitState {
    /// Gate one predicate evaluation. Returns the level to emit at, or
    /// `None` while suppressed.
    fn check(&mut self, active: Option<ThreatLevel>, now: DateTime<Utc>) -> Option<ThreatLevel> {
        let Some(level) = active else {
            if self.false_since.is_none() {
                self.false_since = Some(now);
            }
            if let Some(since) = self.false_since {
                if now - since >= Duration::seconds(COOLDOWN_SECS) {
                    self.rearmed = true;
                }
            }
            return None;
        };

        self.false_since = None;
        let emit = match self.last_level {
            None => true,
            Some(prev) if level > prev => true,
            Some(_) => self.rearmed,
        };
        if emit {
            self.last_level = Some(level);
            self.rearmed = false;
            Some(level)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct EndpointHistory {
    last_seen: DateTime<Utc>,
    hour_histogram: [u32; 24],
}

#[derive(Debug)]
struct SourceWindow {
    requests: VecDeque<DateTime<Utc>>,
    auth_failures: VecDeque<DateTime<Utc>>,
    records_access: VecDeque<(DateTime<Utc>, u64)>,
    endpoints: HashMap<String, EndpointHistory>,
    admin_seen: HashSet<String>,
    emit_states: HashMap<ThreatKind, EmitState>,
}

impl SourceWindow {
    fn new() -> Self {
        Self {
            requests: VecDeque::with_capacity(64),
            auth_failures: VecDeque::new(),
            records_access: VecDeque::new(),
            endpoints: HashMap::new(),
            admin_seen: HashSet::new(),
            emit_states: HashMap::new(),
        }
    }

    fn push_request(&mut self, now: DateTime<Utc>) {
        if self.requests.len() >= REQUEST_RING_CAP {
            self.requests.pop_front();
        }
        self.requests.push_back(now);
    }

    fn requests_last_minute(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(60);
        self.requests.iter().rev().take_while(|t| **t > cutoff).count()
    }

    fn auth_failures_in_window(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::minutes(BRUTE_FORCE_WINDOW_MIN);
        while let Some(front) = self.auth_failures.front() {
            if *front <= cutoff {
                self.auth_failures.pop_front();
            } else {
                break;
            }
        }
        self.auth_failures.len()
    }

    /// Rolling mean of records accessed per request over the trailing hour,
    /// excluding the current request.
    fn records_mean_1h(&mut self, now: DateTime<Utc>) -> Option<f64> {
        let cutoff = now - Duration::hours(1);
        while let Some((ts, _)) = self.records_access.front() {
            if *ts <= cutoff {
                self.records_access.pop_front();
            } else {
                break;
            }
        }
        if self.records_access.is_empty() {
            return None;
        }
        let sum: u64 = self.records_access.iter().map(|(_, n)| *n).sum();
        Some(sum as f64 / self.records_access.len() as f64)
    }
}

pub struct SecurityMonitor {
    windows: Mutex<HashMap<String, Arc<Mutex<SourceWindow>>>>,
}

impl SecurityMonitor {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn window_for(&self, source: &str) -> Arc<Mutex<SourceWindow>> {
        let mut windows = self.windows.lock();
        windows
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SourceWindow::new())))
            .clone()
    }

    /// Observe one request and return any newly detected events.
    pub fn observe(&self, envelope: &RequestEnvelope, config: &EngineConfig) -> Vec<SecurityEvent> {
        let entry = self.window_for(&envelope.source);
        let mut window = entry.lock();
        let now = envelope.now;
        let mut events = Vec::new();

        window.push_request(now);
        if envelope.auth_result == Some(AuthResult::Failed) {
            window.auth_failures.push_back(now);
        } else if envelope.auth_result == Some(AuthResult::Success) {
            // A successful login ends the failure streak.
            window.auth_failures.clear();
        }

        // --- API abuse -----------------------------------------------------
        let rate = window.requests_last_minute(now);
        let abuse_level = if rate >= ABUSE_SEVERE {
            Some(ThreatLevel::Critical)
        } else if rate >= ABUSE_SUSTAINED {
            Some(ThreatLevel::High)
        } else if rate >= ABUSE_BURST {
            Some(ThreatLevel::Medium)
        } else {
            None
        };
        if let Some(level) = window
            .emit_states
            .entry(ThreatKind::ApiAbuse)
            .or_default()
            .check(abuse_level, now)
        {
            events.push(SecurityEvent::new(
                ThreatKind::ApiAbuse,
                level,
                &envelope.source,
                &envelope.endpoint,
                format!("{} requests in the last 60s", rate),
                json!({ "requests_per_minute": rate }),
            ));
        }

        // --- Brute force ---------------------------------------------------
        let failures = window.auth_failures_in_window(now);
        let brute_level = if failures >= BRUTE_FORCE_CRITICAL {
            Some(ThreatLevel::Critical)
        } else if failures >= BRUTE_FORCE_WARN {
            Some(ThreatLevel::High)
        } else {
            None
        };
        if let Some(level) = window
            .emit_states
            .entry(ThreatKind::BruteForce)
            .or_default()
            .check(brute_level, now)
        {
            events.push(SecurityEvent::new(
                ThreatKind::BruteForce,
                level,
                &envelope.source,
                &envelope.endpoint,
                format!("{} authentication failures in 15m", failures),
                json!({ "auth_failures_15m": failures }),
            ));
        }

        // --- Data exfiltration --------------------------------------------
        let exfil_level = if let Some(records) = envelope.records_accessed {
            let mean = window.records_mean_1h(now);
            let triggered = records >= EXFIL_ABSOLUTE_MIN
                && mean.is_some_and(|m| records as f64 >= m * EXFIL_MEAN_MULTIPLIER);
            if triggered {
                Some((ThreatLevel::High, records, mean.unwrap_or(0.0)))
            } else {
                None
            }
        } else {
            None
        };
        if let Some(level) = window
            .emit_states
            .entry(ThreatKind::DataExfiltration)
            .or_default()
            .check(exfil_level.map(|(l, _, _)| l), now)
        {
            let (_, records, mean) = exfil_level.unwrap();
            events.push(SecurityEvent::new(
                ThreatKind::DataExfiltration,
                level,
                &envelope.source,
                &envelope.endpoint,
                format!("{} records accessed vs 1h mean {:.1}", records, mean),
                json!({ "records_accessed": records, "rolling_mean_1h": mean }),
            ));
        }
        if let Some(records) = envelope.records_accessed {
            window.records_access.push_back((now, records));
        }

        // --- Insider threat ------------------------------------------------
        let privileged = envelope.privileged_sentinel
            || config
                .security
                .privileged_endpoints
                .iter()
                .any(|p| envelope.endpoint.starts_with(p.as_str()));
        let off_hours = envelope.off_hours_sentinel || OFF_HOURS.contains(&now.hour());
        let insider_level = (privileged && off_hours).then_some(ThreatLevel::High);
        if let Some(level) = window
            .emit_states
            .entry(ThreatKind::InsiderThreat)
            .or_default()
            .check(insider_level, now)
        {
            events.push(SecurityEvent::new(
                ThreatKind::InsiderThreat,
                level,
                &envelope.source,
                &envelope.endpoint,
                format!("privileged endpoint accessed at {:02}:00 UTC", now.hour()),
                json!({ "hour": now.hour(), "forced": envelope.off_hours_sentinel }),
            ));
        }

        // --- Privilege escalation -----------------------------------------
        let admin = config
            .security
            .admin_endpoints
            .iter()
            .any(|p| envelope.endpoint.starts_with(p.as_str()));
        let first_admin_access = admin && !window.admin_seen.contains(&envelope.endpoint);
        if first_admin_access {
            // First-ever is an edge, not a state: no cooldown tracking needed.
            window.admin_seen.insert(envelope.endpoint.clone());
            events.push(SecurityEvent::new(
                ThreatKind::PrivilegeEscalation,
                ThreatLevel::High,
                &envelope.source,
                &envelope.endpoint,
                "first access to an admin endpoint from this source".to_string(),
                json!({ "endpoint": envelope.endpoint }),
            ));
        }

        // --- Unusual access ------------------------------------------------
        let hour = now.hour() as usize;
        let known_recent = window
            .endpoints
            .get(&envelope.endpoint)
            .is_some_and(|h| now - h.last_seen < Duration::hours(24));
        let total_hits: u32 = window
            .endpoints
            .values()
            .map(|h| h.hour_histogram.iter().sum::<u32>())
            .sum();
        let hour_hits: u32 = window
            .endpoints
            .values()
            .map(|h| h.hour_histogram[hour])
            .sum();
        let unusual =
            (!known_recent && total_hits > 0 && hour_hits == 0).then_some(ThreatLevel::Medium);
        if let Some(level) = window
            .emit_states
            .entry(ThreatKind::UnusualAccess)
            .or_default()
            .check(unusual, now)
        {
            events.push(SecurityEvent::new(
                ThreatKind::UnusualAccess,
                level,
                &envelope.source,
                &envelope.endpoint,
                format!(
                    "endpoint not seen in 24h, accessed outside usual hours ({:02}:00)",
                    hour
                ),
                json!({ "endpoint": envelope.endpoint, "hour": hour }),
            ));
        }

        // Update endpoint history after the predicates that key on it.
        let history = window
            .endpoints
            .entry(envelope.endpoint.clone())
            .or_insert_with(|| EndpointHistory {
                last_seen: now,
                hour_histogram: [0; 24],
            });
        history.last_seen = now;
        history.hour_histogram[hour] += 1;

        if !events.is_empty() {
            metrics::counter!("fraudgate_security_events_total", events.len() as u64);
        }
        events
    }

    /// Emit a system-anomaly event directly, for configuration-change or
    /// component-failure signals that do not flow through `observe`.
    pub fn system_anomaly(&self, source: &str, endpoint: &str, description: &str) -> SecurityEvent {
        SecurityEvent::new(
            ThreatKind::SystemAnomaly,
            ThreatLevel::Medium,
            source,
            endpoint,
            description.to_string(),
            json!({}),
        )
    }

    pub fn tracked_sources(&self) -> usize {
        self.windows.lock().len()
    }

    /// Drop windows with no traffic in the trailing day.
    pub fn cleanup(&self, now: DateTime<Utc>) {
        let mut windows = self.windows.lock();
        windows.retain(|_, entry| {
            let window = entry.lock();
            window
                .requests
                .back()
                .is_some_and(|last| now - *last < Duration::hours(24))
        });
    }
}

impl Default for SecurityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn envelope(source: &str, now: DateTime<Utc>) -> RequestEnvelope {
        RequestEnvelope::new(source, "/v1/decision", "POST", now)
    }

    fn daytime() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 14, 0, 0).unwrap()
    }

    #[test]
    fn test_api_abuse_burst_detection() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        let mut emitted = Vec::new();
        for i in 0..55 {
            let env = envelope("src", now + Duration::milliseconds(i * 10));
            emitted.extend(monitor.observe(&env, &config));
        }

        let abuse: Vec<_> = emitted
            .iter()
            .filter(|e| e.kind == ThreatKind::ApiAbuse)
            .collect();
        assert_eq!(abuse.len(), 1, "cooldown must suppress re-emission");
        assert_eq!(abuse[0].level, ThreatLevel::Medium);
    }

    #[test]
    fn test_api_abuse_escalates_levels() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        let mut emitted = Vec::new();
        for i in 0..520 {
            let env = envelope("src", now + Duration::milliseconds(i));
            emitted.extend(monitor.observe(&env, &config));
        }

        let levels: Vec<ThreatLevel> = emitted
            .iter()
            .filter(|e| e.kind == ThreatKind::ApiAbuse)
            .map(|e| e.level)
            .collect();
        // One emission per level step: Medium at 50, High at 100, Critical at 500.
        assert_eq!(
            levels,
            vec![ThreatLevel::Medium, ThreatLevel::High, ThreatLevel::Critical]
        );
    }

    #[test]
    fn test_cooldown_reemits_after_observed_quiet_minute() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        let mut first = Vec::new();
        for i in 0..50 {
            first.extend(monitor.observe(&envelope("src", now + Duration::milliseconds(i)), &config));
        }
        assert_eq!(first.iter().filter(|e| e.kind == ThreatKind::ApiAbuse).count(), 1);

        // A slow trickle keeps the predicate observably false for well over
        // the 60s cooldown, re-arming the detector.
        let mut second = Vec::new();
        for i in 0..40 {
            second.extend(monitor.observe(
                &envelope("src", now + Duration::seconds(100 + i * 2)),
                &config,
            ));
        }
        assert!(second.iter().all(|e| e.kind != ThreatKind::ApiAbuse));

        // A fresh burst after the quiet period emits again.
        let burst_start = now + Duration::seconds(181);
        for i in 0..60 {
            second.extend(monitor.observe(
                &envelope("src", burst_start + Duration::milliseconds(i)),
                &config,
            ));
        }
        assert_eq!(
            second.iter().filter(|e| e.kind == ThreatKind::ApiAbuse).count(),
            1,
            "predicate false for over 60s must re-arm the detector"
        );
    }

    #[test]
    fn test_brute_force_warning_then_critical() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        let mut emitted = Vec::new();
        for i in 0..10 {
            let mut env = envelope("attacker", now + Duration::seconds(i));
            env.auth_result = Some(AuthResult::Failed);
            emitted.extend(monitor.observe(&env, &config));
        }

        let brute: Vec<_> = emitted
            .iter()
            .filter(|e| e.kind == ThreatKind::BruteForce)
            .collect();
        assert_eq!(brute.len(), 2);
        assert_eq!(brute[0].level, ThreatLevel::High);
        assert_eq!(brute[1].level, ThreatLevel::Critical);
        assert!(brute[1].requires_review);
    }

    #[test]
    fn test_successful_login_clears_failure_streak() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        for i in 0..4 {
            let mut env = envelope("src", now + Duration::seconds(i));
            env.auth_result = Some(AuthResult::Failed);
            assert!(monitor.observe(&env, &config).is_empty());
        }
        let mut env = envelope("src", now + Duration::seconds(5));
        env.auth_result = Some(AuthResult::Success);
        monitor.observe(&env, &config);

        // A fifth failure after the success is a streak of one, not five.
        let mut env = envelope("src", now + Duration::seconds(6));
        env.auth_result = Some(AuthResult::Failed);
        let events = monitor.observe(&env, &config);
        assert!(events.iter().all(|e| e.kind != ThreatKind::BruteForce));
    }

    #[test]
    fn test_exfiltration_requires_spike_and_floor() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        // Establish a baseline of ~10 records per request.
        for i in 0..5 {
            let mut env = envelope("src", now + Duration::seconds(i));
            env.records_accessed = Some(10);
            assert!(monitor
                .observe(&env, &config)
                .iter()
                .all(|e| e.kind != ThreatKind::DataExfiltration));
        }

        // 90 records is 9x the mean: below the multiplier, no event.
        let mut env = envelope("src", now + Duration::seconds(10));
        env.records_accessed = Some(90);
        assert!(monitor
            .observe(&env, &config)
            .iter()
            .all(|e| e.kind != ThreatKind::DataExfiltration));

        // 500 records is far past 10x the (slightly raised) mean and the floor.
        let mut env = envelope("src", now + Duration::seconds(11));
        env.records_accessed = Some(500);
        let events = monitor.observe(&env, &config);
        assert!(events.iter().any(|e| e.kind == ThreatKind::DataExfiltration
            && e.level == ThreatLevel::High));
    }

    #[test]
    fn test_insider_threat_via_sentinels() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime(); // 14:00, not off-hours

        let mut env = envelope("insider", now);
        env.privileged_sentinel = true;
        assert!(monitor
            .observe(&env, &config)
            .iter()
            .all(|e| e.kind != ThreatKind::InsiderThreat));

        let mut env = envelope("insider", now + Duration::seconds(1));
        env.privileged_sentinel = true;
        env.off_hours_sentinel = true;
        let events = monitor.observe(&env, &config);
        assert!(events.iter().any(|e| e.kind == ThreatKind::InsiderThreat));
    }

    #[test]
    fn test_insider_threat_on_real_off_hours() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let night = Utc.with_ymd_and_hms(2024, 6, 3, 2, 30, 0).unwrap();

        let mut env = RequestEnvelope::new("insider", "/v1/security/events", "GET", night);
        env.privileged_sentinel = false; // endpoint itself is privileged
        let events = monitor.observe(&env, &config);
        assert!(events.iter().any(|e| e.kind == ThreatKind::InsiderThreat));
    }

    #[test]
    fn test_privilege_escalation_first_access_only() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        let env = RequestEnvelope::new("src", "/v1/security/sources/blocked", "GET", now);
        let events = monitor.observe(&env, &config);
        assert!(events.iter().any(|e| e.kind == ThreatKind::PrivilegeEscalation));

        let env = RequestEnvelope::new(
            "src",
            "/v1/security/sources/blocked",
            "GET",
            now + Duration::seconds(1),
        );
        let events = monitor.observe(&env, &config);
        assert!(events.iter().all(|e| e.kind != ThreatKind::PrivilegeEscalation));
    }

    #[test]
    fn test_unusual_access_outside_hour_histogram() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let afternoon = daytime();

        // Build an afternoon-only profile for one endpoint.
        for i in 0..20 {
            monitor.observe(
                &envelope("src", afternoon + Duration::seconds(i)),
                &config,
            );
        }

        // A brand-new endpoint at 04:00, an hour this source has never used.
        let night = Utc.with_ymd_and_hms(2024, 6, 5, 4, 0, 0).unwrap();
        let env = RequestEnvelope::new("src", "/v1/sessions/active", "GET", night);
        let events = monitor.observe(&env, &config);
        assert!(events.iter().any(|e| e.kind == ThreatKind::UnusualAccess
            && e.level == ThreatLevel::Medium));
    }

    #[test]
    fn test_sources_do_not_share_windows() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        for i in 0..9 {
            let mut env = envelope("a", now + Duration::seconds(i));
            env.auth_result = Some(AuthResult::Failed);
            monitor.observe(&env, &config);
        }
        let mut env = envelope("b", now + Duration::seconds(10));
        env.auth_result = Some(AuthResult::Failed);
        let events = monitor.observe(&env, &config);
        assert!(events.iter().all(|e| e.kind != ThreatKind::BruteForce));
    }

    #[test]
    fn test_request_ring_capped() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        for i in 0..2_000 {
            monitor.observe(&envelope("src", now + Duration::seconds(i * 2)), &config);
        }
        let entry = monitor.window_for("src");
        assert_eq!(entry.lock().requests.len(), REQUEST_RING_CAP);
    }

    #[test]
    fn test_cleanup_drops_idle_windows() {
        let monitor = SecurityMonitor::new();
        let config = EngineConfig::default();
        let now = daytime();

        monitor.observe(&envelope("old", now), &config);
        monitor.observe(&envelope("fresh", now + Duration::hours(30)), &config);
        monitor.cleanup(now + Duration::hours(31));
        assert_eq!(monitor.tracked_sources(), 1);
    }
}
