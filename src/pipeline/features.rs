//! Feature extraction.
//!
//! Derives the fixed 15-element feature vector the model was trained on
//! from a transaction plus read-only user/device/IP lookups. Missing
//! history collapses to documented defaults; the output never contains a
//! NaN.

use crate::config::EngineConfig;
use crate::models::Transaction;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};

/// Feature schema, in the exact order the model expects its input tensor.
pub const FEATURE_NAMES: [&str; 15] = [
    "amount",
    "amount_percentile",
    "hour_of_day",
    "day_of_week",
    "device_new",
    "distance_from_mode_km",
    "ip_risk",
    "velocity_1h",
    "velocity_1d",
    "account_age_days",
    "failed_logins_15m",
    "mean_spend_30d",
    "std_spend_30d",
    "neighbor_risk",
    "device_reuse_count",
];

pub const F_AMOUNT: usize = 0;
pub const F_AMOUNT_PERCENTILE: usize = 1;
pub const F_HOUR_OF_DAY: usize = 2;
pub const F_DAY_OF_WEEK: usize = 3;
pub const F_DEVICE_NEW: usize = 4;
pub const F_DISTANCE_KM: usize = 5;
pub const F_IP_RISK: usize = 6;
pub const F_VELOCITY_1H: usize = 7;
pub const F_VELOCITY_1D: usize = 8;
pub const F_ACCOUNT_AGE_DAYS: usize = 9;
pub const F_FAILED_LOGINS_15M: usize = 10;
pub const F_MEAN_SPEND_30D: usize = 11;
pub const F_STD_SPEND_30D: usize = 12;
pub const F_NEIGHBOR_RISK: usize = 13;
pub const F_DEVICE_REUSE: usize = 14;

// Defaults when history is absent.
const DEFAULT_MEAN_SPEND: f64 = 100.0;
const DEFAULT_STD_SPEND: f64 = 50.0;
const DEFAULT_IP_RISK: f64 = 0.5;

// Caps keep single outliers from saturating the model input range.
const DISTANCE_CAP_KM: f64 = 10_000.0;
const VELOCITY_1H_CAP: f64 = 50.0;
const VELOCITY_1D_CAP: f64 = 500.0;
const ACCOUNT_AGE_CAP_DAYS: f64 = 3_650.0;
const FAILED_LOGINS_CAP: f64 = 10.0;

// Graph features are out of scope; the model slot is fed a constant.
const NEIGHBOR_RISK_PLACEHOLDER: f64 = 0.0;

/// Dense model input. Opaque to the scorer beyond its length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; 15]);

impl FeatureVector {
    pub fn values(&self) -> &[f64; 15] {
        &self.0
    }

    pub fn get(&self, index: usize) -> f64 {
        self.0[index]
    }
}

#[derive(Debug, Clone)]
struct TxnRecord {
    timestamp: DateTime<Utc>,
    amount: f64,
    location: String,
}

#[derive(Debug, Clone)]
struct UserHistory {
    account_created: DateTime<Utc>,
    /// Profile home location, used as the mode location until transaction
    /// history establishes one.
    home_location: Option<String>,
    transactions: VecDeque<TxnRecord>,
    failed_logins: VecDeque<DateTime<Utc>>,
}

const MAX_USER_TXNS: usize = 2_000;
const MAX_FAILED_LOGINS: usize = 64;

#[derive(Debug, Clone, Default)]
struct DeviceRecord {
    users: HashSet<String>,
    use_count: u32,
    recent_uses: VecDeque<DateTime<Utc>>,
}

/// Read-only view of a user's history for one request.
#[derive(Debug, Clone, Default)]
pub struct UserSnapshot {
    /// Prior transactions on record (before the current one).
    pub total_count: usize,
    /// Prior transactions in the trailing hour / day.
    pub count_1h: u32,
    pub count_1d: u32,
    /// Prior transactions above the high-value threshold in the trailing day.
    pub high_value_count_1d: u32,
    pub mean_30d: Option<f64>,
    pub std_30d: Option<f64>,
    /// Most frequent location across the 30-day window.
    pub mode_location: Option<String>,
    /// Most recent transaction, for impossible-travel checks.
    pub last_seen: Option<(DateTime<Utc>, String)>,
    pub account_age_days: f64,
    pub failed_logins_15m: u32,
    /// Rank of the current amount within the 30-day history, in [0, 1].
    pub amount_percentile: f64,
}

/// Read-only view of a device's history for one request.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub known_for_user: bool,
    pub reuse_count: u32,
    pub count_1h: u32,
}

/// In-memory user/device/IP history backing the extractor's lookups.
///
/// Pipeline state is process-local and does not survive restarts.
/// Different keys proceed under a single RwLock because lookups are short
/// and read-mostly.
pub struct HistoryStore {
    users: RwLock<HashMap<String, UserHistory>>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    ip_reputation: RwLock<HashMap<String, f64>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            ip_reputation: RwLock::new(HashMap::new()),
        }
    }

    /// Record a processed transaction. Blocked attempts are recorded too so
    /// attack traffic keeps counting toward velocity caps.
    pub fn record(&self, tx: &Transaction, now: DateTime<Utc>) {
        {
            let mut users = self.users.write();
            let entry = users.entry(tx.user_id.clone()).or_insert_with(|| UserHistory {
                account_created: now,
                home_location: None,
                transactions: VecDeque::with_capacity(64),
                failed_logins: VecDeque::new(),
            });
            if entry.transactions.len() >= MAX_USER_TXNS {
                entry.transactions.pop_front();
            }
            entry.transactions.push_back(TxnRecord {
                timestamp: tx.timestamp,
                amount: tx.amount,
                location: tx.location.clone(),
            });
        }

        let mut devices = self.devices.write();
        let device = devices.entry(tx.device_id.clone()).or_default();
        device.users.insert(tx.user_id.clone());
        device.use_count = device.use_count.saturating_add(1);
        if device.recent_uses.len() >= 512 {
            device.recent_uses.pop_front();
        }
        device.recent_uses.push_back(tx.timestamp);
    }

    pub fn record_failed_login(&self, user_id: &str, now: DateTime<Utc>) {
        let mut users = self.users.write();
        let entry = users.entry(user_id.to_string()).or_insert_with(|| UserHistory {
            account_created: now,
            home_location: None,
            transactions: VecDeque::new(),
            failed_logins: VecDeque::new(),
        });
        if entry.failed_logins.len() >= MAX_FAILED_LOGINS {
            entry.failed_logins.pop_front();
        }
        entry.failed_logins.push_back(now);
    }

    pub fn set_ip_risk(&self, ip: &str, risk: f64) {
        self.ip_reputation
            .write()
            .insert(ip.to_string(), risk.clamp(0.0, 1.0));
    }

    /// Seed an account profile ahead of any traffic, so account age and the
    /// home location reflect reality rather than first-contact data.
    pub fn seed_account(&self, user_id: &str, created: DateTime<Utc>, home_location: Option<&str>) {
        let mut users = self.users.write();
        users.entry(user_id.to_string()).or_insert_with(|| UserHistory {
            account_created: created,
            home_location: home_location.map(|l| l.to_string()),
            transactions: VecDeque::new(),
            failed_logins: VecDeque::new(),
        });
    }

    pub fn ip_risk(&self, ip: &str) -> f64 {
        self.ip_reputation
            .read()
            .get(ip)
            .copied()
            .unwrap_or(DEFAULT_IP_RISK)
    }

    pub fn user_snapshot(
        &self,
        user_id: &str,
        amount: f64,
        now: DateTime<Utc>,
        high_value_amount: f64,
    ) -> UserSnapshot {
        let users = self.users.read();
        let Some(history) = users.get(user_id) else {
            return UserSnapshot {
                amount_percentile: 0.5,
                ..UserSnapshot::default()
            };
        };

        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::days(1);
        let month_ago = now - Duration::days(30);

        let mut count_1h = 0u32;
        let mut count_1d = 0u32;
        let mut high_value_count_1d = 0u32;
        let mut window_sum = 0.0;
        let mut window_sq_sum = 0.0;
        let mut window_n = 0usize;
        let mut below = 0usize;
        let mut location_counts: HashMap<&str, u32> = HashMap::new();

        for record in &history.transactions {
            if record.timestamp > hour_ago {
                count_1h += 1;
            }
            if record.timestamp > day_ago {
                count_1d += 1;
                if record.amount > high_value_amount {
                    high_value_count_1d += 1;
                }
            }
            if record.timestamp > month_ago {
                window_n += 1;
                window_sum += record.amount;
                window_sq_sum += record.amount * record.amount;
                if record.amount <= amount {
                    below += 1;
                }
                *location_counts.entry(record.location.as_str()).or_default() += 1;
            }
        }

        let (mean_30d, std_30d, amount_percentile) = if window_n > 0 {
            let mean = window_sum / window_n as f64;
            let variance = (window_sq_sum / window_n as f64 - mean * mean).max(0.0);
            (
                Some(mean),
                Some(variance.sqrt()),
                below as f64 / window_n as f64,
            )
        } else {
            (None, None, 0.5)
        };

        let mode_location = location_counts
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .map(|(loc, _)| loc.to_string())
            .or_else(|| history.home_location.clone());

        let last_seen = history
            .transactions
            .back()
            .map(|r| (r.timestamp, r.location.clone()));

        let fifteen_min_ago = now - Duration::minutes(15);
        let failed_logins_15m = history
            .failed_logins
            .iter()
            .filter(|t| **t > fifteen_min_ago)
            .count() as u32;

        UserSnapshot {
            total_count: history.transactions.len(),
            count_1h,
            count_1d,
            high_value_count_1d,
            mean_30d,
            std_30d,
            mode_location,
            last_seen,
            account_age_days: (now - history.account_created).num_seconds() as f64 / 86_400.0,
            failed_logins_15m,
            amount_percentile,
        }
    }

    pub fn device_snapshot(
        &self,
        device_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> DeviceSnapshot {
        let devices = self.devices.read();
        let Some(device) = devices.get(device_id) else {
            return DeviceSnapshot::default();
        };

        let hour_ago = now - Duration::hours(1);
        DeviceSnapshot {
            known_for_user: device.users.contains(user_id),
            reuse_count: device.use_count,
            count_1h: device.recent_uses.iter().filter(|t| **t > hour_ago).count() as u32,
        }
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless extractor over the shared lookups.
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(
        &self,
        tx: &Transaction,
        user: &UserSnapshot,
        device: &DeviceSnapshot,
        ip_risk: f64,
        config: &EngineConfig,
    ) -> FeatureVector {
        let mut v = [0.0f64; 15];

        v[F_AMOUNT] = tx.amount;
        v[F_AMOUNT_PERCENTILE] = user.amount_percentile;
        v[F_HOUR_OF_DAY] = tx.timestamp.hour() as f64;
        v[F_DAY_OF_WEEK] = tx.timestamp.weekday().num_days_from_monday() as f64;
        v[F_DEVICE_NEW] = if device.known_for_user { 0.0 } else { 1.0 };

        v[F_DISTANCE_KM] = user
            .mode_location
            .as_deref()
            .map(|mode| config.distance_km(mode, &tx.location))
            .unwrap_or(0.0)
            .min(DISTANCE_CAP_KM);

        v[F_IP_RISK] = ip_risk.clamp(0.0, 1.0);

        // Velocities include the current transaction.
        v[F_VELOCITY_1H] = (user.count_1h as f64 + 1.0).min(VELOCITY_1H_CAP);
        v[F_VELOCITY_1D] = (user.count_1d as f64 + 1.0).min(VELOCITY_1D_CAP);

        v[F_ACCOUNT_AGE_DAYS] = user.account_age_days.clamp(0.0, ACCOUNT_AGE_CAP_DAYS);
        v[F_FAILED_LOGINS_15M] = (user.failed_logins_15m as f64).min(FAILED_LOGINS_CAP);

        v[F_MEAN_SPEND_30D] = (1.0 + user.mean_30d.unwrap_or(DEFAULT_MEAN_SPEND)).ln();
        v[F_STD_SPEND_30D] = (1.0 + user.std_30d.unwrap_or(DEFAULT_STD_SPEND)).ln();

        v[F_NEIGHBOR_RISK] = NEIGHBOR_RISK_PLACEHOLDER;
        v[F_DEVICE_REUSE] = device.reuse_count as f64;

        // The model contract forbids NaN in any slot.
        for value in v.iter_mut() {
            if !value.is_finite() {
                *value = 0.0;
            }
        }

        FeatureVector(v)
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn sample_tx(amount: f64, location: &str, ts: DateTime<Utc>) -> Transaction {
        Transaction {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            user_id: "alice".to_string(),
            device_id: "dev-1".to_string(),
            source_ip: "10.0.0.1".to_string(),
            merchant_id: "m-1".to_string(),
            amount,
            currency: "USD".to_string(),
            timestamp: ts,
            location: location.to_string(),
            beneficiary_account: None,
            is_new_beneficiary: None,
            session_id: None,
            metadata: StdHashMap::new(),
        }
    }

    #[test]
    fn test_defaults_without_history() {
        let store = HistoryStore::new();
        let config = EngineConfig::default();
        let now = Utc::now();
        let tx = sample_tx(45.99, "home", now);

        let user = store.user_snapshot("alice", tx.amount, now, 1000.0);
        let device = store.device_snapshot("dev-1", "alice", now);
        let features =
            FeatureExtractor::new().extract(&tx, &user, &device, store.ip_risk("10.0.0.1"), &config);

        assert_eq!(features.get(F_DEVICE_NEW), 1.0);
        assert_eq!(features.get(F_IP_RISK), 0.5);
        assert_eq!(features.get(F_AMOUNT_PERCENTILE), 0.5);
        assert!((features.get(F_MEAN_SPEND_30D) - (101.0f64).ln()).abs() < 1e-9);
        assert!((features.get(F_STD_SPEND_30D) - (51.0f64).ln()).abs() < 1e-9);
        assert!(features.values().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_velocity_counts_include_current() {
        let store = HistoryStore::new();
        let now = Utc::now();

        for i in 0..5 {
            let tx = sample_tx(10.0, "home", now - Duration::minutes(50 - i));
            store.record(&tx, now);
        }

        let user = store.user_snapshot("alice", 10.0, now, 1000.0);
        assert_eq!(user.count_1h, 5);
        assert_eq!(user.count_1d, 5);

        let config = EngineConfig::default();
        let tx = sample_tx(10.0, "home", now);
        let device = store.device_snapshot("dev-1", "alice", now);
        let features = FeatureExtractor::new().extract(&tx, &user, &device, 0.5, &config);
        assert_eq!(features.get(F_VELOCITY_1H), 6.0);
    }

    #[test]
    fn test_velocity_caps_applied() {
        let store = HistoryStore::new();
        let now = Utc::now();
        for _ in 0..80 {
            let tx = sample_tx(10.0, "home", now - Duration::minutes(10));
            store.record(&tx, now);
        }

        let user = store.user_snapshot("alice", 10.0, now, 1000.0);
        let config = EngineConfig::default();
        let tx = sample_tx(10.0, "home", now);
        let device = store.device_snapshot("dev-1", "alice", now);
        let features = FeatureExtractor::new().extract(&tx, &user, &device, 0.5, &config);
        assert_eq!(features.get(F_VELOCITY_1H), 50.0);
    }

    #[test]
    fn test_amount_percentile_against_window() {
        let store = HistoryStore::new();
        let now = Utc::now();
        for amount in [10.0, 20.0, 30.0, 40.0] {
            let tx = sample_tx(amount, "home", now - Duration::days(2));
            store.record(&tx, now);
        }

        let user = store.user_snapshot("alice", 35.0, now, 1000.0);
        assert!((user.amount_percentile - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_mode_location_and_distance() {
        let store = HistoryStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            store.record(&sample_tx(10.0, "new_york", now - Duration::days(1)), now);
        }
        store.record(&sample_tx(10.0, "london", now - Duration::days(1)), now);

        let user = store.user_snapshot("alice", 10.0, now, 1000.0);
        assert_eq!(user.mode_location.as_deref(), Some("new_york"));

        let mut config = EngineConfig::default();
        config
            .locations
            .insert("new_york".to_string(), [40.7128, -74.0060]);
        config
            .locations
            .insert("london".to_string(), [51.5074, -0.1278]);

        let tx = sample_tx(10.0, "london", now);
        let device = store.device_snapshot("dev-1", "alice", now);
        let features = FeatureExtractor::new().extract(&tx, &user, &device, 0.5, &config);
        assert!(features.get(F_DISTANCE_KM) > 5_000.0);
    }

    #[test]
    fn test_device_reuse_and_known_for_user() {
        let store = HistoryStore::new();
        let now = Utc::now();
        store.record(&sample_tx(10.0, "home", now), now);

        let device = store.device_snapshot("dev-1", "alice", now);
        assert!(device.known_for_user);
        assert_eq!(device.reuse_count, 1);

        let other = store.device_snapshot("dev-1", "mallory", now);
        assert!(!other.known_for_user);
    }

    #[test]
    fn test_failed_logins_window() {
        let store = HistoryStore::new();
        let now = Utc::now();
        store.record_failed_login("alice", now - Duration::minutes(20));
        store.record_failed_login("alice", now - Duration::minutes(5));
        store.record_failed_login("alice", now - Duration::minutes(1));

        let user = store.user_snapshot("alice", 10.0, now, 1000.0);
        assert_eq!(user.failed_logins_15m, 2);
    }
}
