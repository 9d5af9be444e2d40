//! Runtime configuration.
//!
//! Two layers, both loaded once at startup: process settings from the
//! environment (ports, data paths, tokens) and the engine document from a
//! TOML file (deny lists, caps, thresholds, tiers, signal weights). The
//! engine document is held behind an `ArcSwap` so a SIGHUP can replace it
//! without stopping request admission.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Process-level settings from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub event_db_path: String,
    pub session_db_path: String,
    pub engine_config_path: String,
    pub model_path: String,
    pub calibration_path: String,
    /// When set, session and security endpoints require this bearer token.
    pub analyst_api_token: Option<String>,
    /// Prometheus scrape listener, e.g. "0.0.0.0:9090". Unset disables it.
    pub metrics_addr: Option<String>,
    pub session_cleanup_secs: u64,
    pub session_max_age_hours: i64,
    /// Capacity of the bounded event queue between orchestrator and store.
    pub event_queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let event_db_path = resolve_data_path(std::env::var("EVENT_DB_PATH").ok(), "fraudgate_events.db");
        let session_db_path =
            resolve_data_path(std::env::var("SESSION_DB_PATH").ok(), "fraudgate_sessions.db");

        let engine_config_path = std::env::var("ENGINE_CONFIG_PATH")
            .unwrap_or_else(|_| default_config_file("engine.toml"));
        let model_path =
            std::env::var("MODEL_PATH").unwrap_or_else(|_| default_config_file("model.json"));
        let calibration_path = std::env::var("CALIBRATION_PATH")
            .unwrap_or_else(|_| default_config_file("calibration.json"));

        let analyst_api_token = std::env::var("ANALYST_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let metrics_addr = std::env::var("METRICS_ADDR")
            .ok()
            .filter(|a| !a.trim().is_empty());

        let session_cleanup_secs = std::env::var("SESSION_CLEANUP_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let session_max_age_hours = std::env::var("SESSION_MAX_AGE_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24);

        let event_queue_capacity = std::env::var("EVENT_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4096);

        Ok(Self {
            port,
            event_db_path,
            session_db_path,
            engine_config_path,
            model_path,
            calibration_path,
            analyst_api_token,
            metrics_addr,
            session_cleanup_secs,
            session_max_age_hours,
            event_queue_capacity,
        })
    }
}

/// Resolve a data file path relative to the crate directory so running from
/// another working directory never creates a stray database.
pub fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}

fn default_config_file(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join(name)
        .to_string_lossy()
        .to_string()
}

// ---------------------------------------------------------------------------
// Engine document
// ---------------------------------------------------------------------------

/// Deny lists, any hit forces a hard BLOCK.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DenyLists {
    pub users: HashSet<String>,
    pub devices: HashSet<String>,
    pub ips: HashSet<String>,
    pub merchants: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityCaps {
    pub user_hourly: u32,
    pub user_daily: u32,
    pub device_hourly: u32,
    /// Cap on transactions above `high_value_amount` per day.
    pub high_value_daily: u32,
    pub high_value_amount: f64,
}

impl Default for VelocityCaps {
    fn default() -> Self {
        Self {
            user_hourly: 10,
            user_daily: 50,
            device_hourly: 5,
            high_value_daily: 3,
            high_value_amount: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoRules {
    pub distance_km_review: f64,
    pub impossible_travel_km: f64,
    pub impossible_travel_hours: f64,
}

impl Default for GeoRules {
    fn default() -> Self {
        Self {
            distance_km_review: 500.0,
            impossible_travel_km: 1000.0,
            impossible_travel_hours: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeRules {
    /// Inclusive start hour of the night window (local to the timestamp).
    pub night_window_start: u32,
    /// Exclusive end hour of the night window.
    pub night_window_end: u32,
}

impl Default for TimeRules {
    fn default() -> Self {
        Self {
            night_window_start: 3,
            night_window_end: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmountRules {
    pub first_transaction_stepup: f64,
    pub review_absolute: f64,
    pub review_multiplier_of_mean: f64,
}

impl Default for AmountRules {
    fn default() -> Self {
        Self {
            first_transaction_stepup: 500.0,
            review_absolute: 10_000.0,
            review_multiplier_of_mean: 100.0,
        }
    }
}

/// The rules-engine configuration record. A bounded, enumerated set of
/// recognised options, not a free-form map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub version: u32,
    pub deny_lists: DenyLists,
    pub velocity: VelocityCaps,
    pub geo: GeoRules,
    pub time: TimeRules,
    pub amount: AmountRules,
}

/// Score thresholds for the policy combiner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyThresholds {
    pub monitor: f64,
    pub step_up: f64,
    pub review: f64,
    pub block: f64,
    /// Amount above which a moderately-elevated score already reviews.
    pub high_amount: f64,
    pub high_amount_score: f64,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            monitor: 0.35,
            step_up: 0.55,
            review: 0.75,
            block: 0.90,
            high_amount: 5000.0,
            high_amount_score: 0.70,
        }
    }
}

/// Capacity-per-minute and burst allowance for one rate-limit tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimit {
    pub capacity_per_minute: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub free: TierLimit,
    pub basic: TierLimit,
    pub premium: TierLimit,
    pub internal: TierLimit,
    /// Violations kept within this window (seconds).
    pub violation_window_secs: i64,
    /// Violations at or above this count trigger a temporary block.
    pub violation_threshold: usize,
    pub temp_block_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            free: TierLimit {
                capacity_per_minute: 20,
                burst: 10,
            },
            basic: TierLimit {
                capacity_per_minute: 100,
                burst: 30,
            },
            premium: TierLimit {
                capacity_per_minute: 500,
                burst: 100,
            },
            internal: TierLimit {
                capacity_per_minute: 1000,
                burst: 200,
            },
            violation_window_secs: 300,
            violation_threshold: 3,
            temp_block_secs: 300,
        }
    }
}

/// Weights for the five behavioral signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorWeights {
    pub amount_deviation: u32,
    pub beneficiary_changes: u32,
    pub time_pattern: u32,
    pub velocity: u32,
    pub geolocation: u32,
}

impl Default for BehaviorWeights {
    fn default() -> Self {
        Self {
            amount_deviation: 25,
            beneficiary_changes: 20,
            time_pattern: 15,
            velocity: 20,
            geolocation: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub weights: BehaviorWeights,
    /// Amount deviation triggers above `session_mean * amount_multiplier`.
    pub amount_multiplier: f64,
    /// ... or above `user_baseline * baseline_multiplier`.
    pub baseline_multiplier: f64,
    pub user_baseline: f64,
    pub beneficiary_threshold: u32,
    /// Night window for the time-pattern signal, [start, end) wrapping
    /// midnight.
    pub night_start: u32,
    pub night_end: u32,
    pub velocity_threshold: u32,
    /// A location change this soon after session start is impossible travel.
    pub impossible_travel_minutes: i64,
    pub critical_risk: u32,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            weights: BehaviorWeights::default(),
            amount_multiplier: 10.0,
            baseline_multiplier: 3.0,
            user_baseline: 2500.0,
            beneficiary_threshold: 2,
            night_start: 23,
            night_end: 6,
            velocity_threshold: 10,
            impossible_travel_minutes: 120,
            critical_risk: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Endpoint prefixes counted as privileged for insider-threat detection.
    pub privileged_endpoints: Vec<String>,
    /// Endpoint prefixes counted as admin for privilege-escalation detection.
    pub admin_endpoints: Vec<String>,
    /// Sentinel value for the `X-Security-Test` limiter bypass.
    pub test_sentinel: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            privileged_endpoints: vec![
                "/v1/security/audit-trail".to_string(),
                "/v1/security/events".to_string(),
            ],
            admin_endpoints: vec![
                "/v1/security/sources".to_string(),
                "/v1/security/rate-limits".to_string(),
            ],
            test_sentinel: "fraudgate-security-test".to_string(),
        }
    }
}

/// The full engine document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rules: RulesConfig,
    pub policy: PolicyThresholds,
    pub limits: RateLimitConfig,
    pub behavior: BehaviorConfig,
    pub security: SecurityConfig,
    /// Known location labels with [lat, lon] coordinates for geo rules.
    pub locations: HashMap<String, [f64; 2]>,
}

impl EngineConfig {
    /// Load the document from a TOML file. A missing file at the default
    /// location falls back to built-in defaults; a malformed file is fatal.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            warn!("engine config not found at {}, using built-in defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config at {}", path))?;
        let config: EngineConfig =
            toml::from_str(&raw).with_context(|| format!("Malformed engine config at {}", path))?;

        info!(
            version = config.rules.version,
            deny_users = config.rules.deny_lists.users.len(),
            "📋 Engine config loaded from {}",
            path
        );
        Ok(config)
    }

    /// Distance in kilometres between two location labels. Unknown labels
    /// yield zero so absent geo data never trips geo rules on its own.
    pub fn distance_km(&self, from: &str, to: &str) -> f64 {
        let (Some(a), Some(b)) = (self.locations.get(from), self.locations.get(to)) else {
            return 0.0;
        };
        haversine_km(a[0], a[1], b[0], b[1])
    }
}

/// Shared, hot-swappable handle to the engine document.
pub struct EngineHandle {
    inner: ArcSwap<EngineConfig>,
    path: String,
}

impl EngineHandle {
    pub fn new(config: EngineConfig, path: &str) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
            path: path.to_string(),
        }
    }

    /// Snapshot of the current document. Cheap; readers never block.
    pub fn load(&self) -> Arc<EngineConfig> {
        self.inner.load_full()
    }

    /// Re-read the document from disk and swap it in. Invoked from the
    /// SIGHUP handler; a bad file leaves the previous document active.
    pub fn reload(&self) -> Result<()> {
        let config = EngineConfig::load(&self.path)?;
        self.inner.store(Arc::new(config));
        info!("🔄 Engine config reloaded");
        Ok(())
    }
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.rules.velocity.user_hourly, 10);
        assert_eq!(cfg.rules.velocity.user_daily, 50);
        assert_eq!(cfg.rules.velocity.device_hourly, 5);
        assert_eq!(cfg.rules.velocity.high_value_daily, 3);
        assert_eq!(cfg.policy.monitor, 0.35);
        assert_eq!(cfg.policy.block, 0.90);
        assert_eq!(cfg.limits.free.capacity_per_minute, 20);
        assert_eq!(cfg.limits.free.burst, 10);
        assert_eq!(cfg.behavior.weights.amount_deviation, 25);
        assert_eq!(cfg.behavior.critical_risk, 80);
    }

    #[test]
    fn test_toml_round_trip() {
        let cfg = EngineConfig::default();
        let raw = toml::to_string(&cfg).unwrap();
        let parsed: EngineConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.policy.review, cfg.policy.review);
        assert_eq!(parsed.limits.premium.burst, cfg.limits.premium.burst);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            [rules.velocity]
            user_hourly = 3

            [policy]
            block = 0.95
        "#;
        let cfg: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.rules.velocity.user_hourly, 3);
        assert_eq!(cfg.rules.velocity.user_daily, 50);
        assert_eq!(cfg.policy.block, 0.95);
        assert_eq!(cfg.policy.monitor, 0.35);
    }

    #[test]
    fn test_distance_between_known_locations() {
        let mut cfg = EngineConfig::default();
        cfg.locations
            .insert("new_york".to_string(), [40.7128, -74.0060]);
        cfg.locations
            .insert("london".to_string(), [51.5074, -0.1278]);

        let d = cfg.distance_km("new_york", "london");
        assert!((5500.0..5700.0).contains(&d), "got {}", d);

        // Unknown labels never contribute distance.
        assert_eq!(cfg.distance_km("new_york", "atlantis"), 0.0);
    }

    #[test]
    fn test_engine_handle_swap() {
        let handle = EngineHandle::new(EngineConfig::default(), "/nonexistent/engine.toml");
        assert_eq!(handle.load().policy.block, 0.90);

        // Reload from a missing path falls back to defaults, not an error.
        handle.reload().unwrap();
        assert_eq!(handle.load().policy.block, 0.90);
    }
}
