//! Durable security event store.
//!
//! Single SQLite file holding security events, API access rows, blocked
//! sources, and the analyst audit trail. WAL mode keeps readers unblocked
//! during writes; a single connection behind a mutex preserves
//! single-writer semantics under concurrent callers. Schema initialisation
//! is idempotent on open.

use crate::models::{
    AuditAction, AuditEntry, BlockedSource, SecurityEvent, ThreatKind, ThreatLevel,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS security_events (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    kind TEXT NOT NULL,
    level INTEGER NOT NULL,
    source TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    description TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    requires_review INTEGER NOT NULL,
    reviewed_by TEXT,
    review_action TEXT,
    review_notes TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_security_events_ts
    ON security_events(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_security_events_source
    ON security_events(source, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_security_events_kind
    ON security_events(kind, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_security_events_level
    ON security_events(level, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_security_events_review
    ON security_events(timestamp DESC) WHERE requires_review = 1 AND reviewed_by IS NULL;

CREATE TABLE IF NOT EXISTS api_access (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    source TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    status INTEGER NOT NULL,
    latency_ms REAL NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_api_access_ts
    ON api_access(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_api_access_source
    ON api_access(source, timestamp DESC);

CREATE TABLE IF NOT EXISTS blocked_sources (
    source TEXT NOT NULL,
    blocked_at INTEGER NOT NULL,
    reason TEXT NOT NULL,
    level INTEGER NOT NULL,
    auto INTEGER NOT NULL,
    unblocked_at INTEGER,
    unblocked_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_blocked_sources_source
    ON blocked_sources(source, blocked_at DESC);
-- At most one active block per source, enforced by the store itself.
CREATE UNIQUE INDEX IF NOT EXISTS idx_blocked_sources_active
    ON blocked_sources(source) WHERE unblocked_at IS NULL;

CREATE TABLE IF NOT EXISTS audit_trail (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    resource TEXT NOT NULL,
    success INTEGER NOT NULL,
    metadata_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_audit_trail_ts
    ON audit_trail(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_trail_actor
    ON audit_trail(actor, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_trail_resource
    ON audit_trail(resource, timestamp DESC);
"#;

/// A security event as stored, including any review outcome.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub event: SecurityEvent,
    pub reviewed_by: Option<String>,
    pub review_action: Option<String>,
    pub review_notes: Option<String>,
}

/// Filters for the recent-events query. All optional.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub min_level: Option<ThreatLevel>,
    pub kind: Option<ThreatKind>,
    pub source: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub total_events: i64,
    pub events_last_24h: i64,
    pub by_kind: HashMap<String, i64>,
    pub by_level: HashMap<String, i64>,
    pub pending_reviews: i64,
    pub blocked_sources: i64,
    pub recent: Vec<StoredEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRiskProfile {
    pub source: String,
    pub window_hours: i64,
    pub total_events: i64,
    pub by_level: HashMap<String, i64>,
    pub by_kind: HashMap<String, i64>,
    pub currently_blocked: bool,
}

pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open event store at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize event store schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM security_events", [], |row| row.get(0))
            .unwrap_or(0);
        info!("🗄️ Event store initialized at {} ({} events)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // --- writes ------------------------------------------------------------

    pub fn store_event(&self, event: &SecurityEvent) -> Result<()> {
        let metadata_json = serde_json::to_string(&event.metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO security_events
             (id, timestamp, kind, level, source, endpoint, description,
              metadata_json, requires_review)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.id,
                event.timestamp.timestamp(),
                event.kind.as_str(),
                event.level.code() as i64,
                event.source,
                event.endpoint,
                event.description,
                metadata_json,
                event.requires_review as i64,
            ],
        )?;
        Ok(())
    }

    pub fn record_api_access(
        &self,
        source: &str,
        endpoint: &str,
        method: &str,
        status: u16,
        latency_ms: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_access (id, timestamp, source, endpoint, method, status, latency_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid::Uuid::new_v4().to_string(),
                now.timestamp(),
                source,
                endpoint,
                method,
                status as i64,
                latency_ms,
            ],
        )?;
        Ok(())
    }

    pub fn record_audit(&self, entry: &AuditEntry) -> Result<()> {
        let metadata_json = serde_json::to_string(&entry.metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO audit_trail
             (id, timestamp, actor, action, resource, success, metadata_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.timestamp.timestamp(),
                entry.actor,
                entry.action.as_str(),
                entry.resource,
                entry.success as i64,
                metadata_json,
            ],
        )?;
        Ok(())
    }

    /// Mark a source blocked. Returns false when it is already blocked
    /// (idempotent: the existing block stands).
    pub fn block_source(
        &self,
        source: &str,
        reason: &str,
        level: ThreatLevel,
        auto: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        // The partial unique index rejects a second active block.
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO blocked_sources (source, blocked_at, reason, level, auto)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![source, now.timestamp(), reason, level.code() as i64, auto as i64],
        )?;
        Ok(inserted > 0)
    }

    /// Lift the active block for a source. Returns false when none exists.
    pub fn unblock_source(&self, source: &str, analyst: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE blocked_sources SET unblocked_at = ?1, unblocked_by = ?2
             WHERE source = ?3 AND unblocked_at IS NULL",
            params![now.timestamp(), analyst, source],
        )?;
        Ok(changed > 0)
    }

    /// Record a review for an event. Returns false when the event was
    /// already reviewed (the first review stands).
    pub fn review_event(
        &self,
        event_id: &str,
        analyst: &str,
        action: &str,
        notes: Option<&str>,
    ) -> Result<Option<bool>> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM security_events WHERE id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(None);
        }

        let changed = conn.execute(
            "UPDATE security_events
             SET reviewed_by = ?1, review_action = ?2, review_notes = ?3
             WHERE id = ?4 AND reviewed_by IS NULL",
            params![analyst, action, notes, event_id],
        )?;
        Ok(Some(changed > 0))
    }

    /// Bulk-dismiss the review queue. Returns the number of events cleared.
    pub fn clear_review_queue(&self, analyst: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE security_events
             SET reviewed_by = ?1, review_action = 'dismiss'
             WHERE requires_review = 1 AND reviewed_by IS NULL",
            params![analyst],
        )?;
        Ok(changed)
    }

    // --- queries -----------------------------------------------------------

    pub fn recent_events(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>> {
        let limit = if filter.limit == 0 { 100 } else { filter.limit.min(1000) };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, kind, level, source, endpoint, description,
                    metadata_json, requires_review, reviewed_by, review_action, review_notes
             FROM security_events
             WHERE (?1 IS NULL OR level >= ?1)
               AND (?2 IS NULL OR kind = ?2)
               AND (?3 IS NULL OR source = ?3)
             ORDER BY timestamp DESC, id
             LIMIT ?4",
        )?;

        let events = stmt
            .query_map(
                params![
                    filter.min_level.map(|l| l.code() as i64),
                    filter.kind.map(|k| k.as_str()),
                    filter.source.as_deref(),
                    limit,
                ],
                Self::row_to_event,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<StoredEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, kind, level, source, endpoint, description,
                    metadata_json, requires_review, reviewed_by, review_action, review_notes
             FROM security_events WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![event_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_event(row)?)),
            None => Ok(None),
        }
    }

    /// Events awaiting analyst review: level >= Medium and no reviewer.
    pub fn review_queue(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let limit = if limit == 0 { 100 } else { limit.min(1000) };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, kind, level, source, endpoint, description,
                    metadata_json, requires_review, reviewed_by, review_action, review_notes
             FROM security_events
             WHERE requires_review = 1 AND reviewed_by IS NULL
             ORDER BY timestamp DESC, id
             LIMIT ?1",
        )?;
        let events = stmt
            .query_map([limit], Self::row_to_event)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    pub fn dashboard(&self, now: DateTime<Utc>) -> Result<DashboardStats> {
        let conn = self.conn.lock();

        let total_events: i64 =
            conn.query_row("SELECT COUNT(*) FROM security_events", [], |row| row.get(0))?;

        let day_ago = (now - Duration::hours(24)).timestamp();
        let events_last_24h: i64 = conn.query_row(
            "SELECT COUNT(*) FROM security_events WHERE timestamp > ?1",
            params![day_ago],
            |row| row.get(0),
        )?;

        let mut by_kind = HashMap::new();
        {
            let mut stmt =
                conn.prepare_cached("SELECT kind, COUNT(*) FROM security_events GROUP BY kind")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                by_kind.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
            }
        }

        let mut by_level = HashMap::new();
        {
            let mut stmt =
                conn.prepare_cached("SELECT level, COUNT(*) FROM security_events GROUP BY level")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let level = ThreatLevel::from_code(row.get::<_, i64>(0)?)
                    .map(|l| l.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                by_level.insert(level, row.get::<_, i64>(1)?);
            }
        }

        let pending_reviews: i64 = conn.query_row(
            "SELECT COUNT(*) FROM security_events WHERE requires_review = 1 AND reviewed_by IS NULL",
            [],
            |row| row.get(0),
        )?;

        let blocked_sources: i64 = conn.query_row(
            "SELECT COUNT(*) FROM blocked_sources WHERE unblocked_at IS NULL",
            [],
            |row| row.get(0),
        )?;

        let recent = {
            let mut stmt = conn.prepare_cached(
                "SELECT id, timestamp, kind, level, source, endpoint, description,
                        metadata_json, requires_review, reviewed_by, review_action, review_notes
                 FROM security_events ORDER BY timestamp DESC, id LIMIT 10",
            )?;
            let rows: Vec<StoredEvent> = stmt
                .query_map([], Self::row_to_event)?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        Ok(DashboardStats {
            total_events,
            events_last_24h,
            by_kind,
            by_level,
            pending_reviews,
            blocked_sources,
            recent,
        })
    }

    pub fn source_risk_profile(
        &self,
        source: &str,
        window_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<SourceRiskProfile> {
        let conn = self.conn.lock();
        let cutoff = (now - Duration::hours(window_hours)).timestamp();

        let total_events: i64 = conn.query_row(
            "SELECT COUNT(*) FROM security_events WHERE source = ?1 AND timestamp > ?2",
            params![source, cutoff],
            |row| row.get(0),
        )?;

        let mut by_level = HashMap::new();
        {
            let mut stmt = conn.prepare_cached(
                "SELECT level, COUNT(*) FROM security_events
                 WHERE source = ?1 AND timestamp > ?2 GROUP BY level",
            )?;
            let mut rows = stmt.query(params![source, cutoff])?;
            while let Some(row) = rows.next()? {
                let level = ThreatLevel::from_code(row.get::<_, i64>(0)?)
                    .map(|l| l.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                by_level.insert(level, row.get::<_, i64>(1)?);
            }
        }

        let mut by_kind = HashMap::new();
        {
            let mut stmt = conn.prepare_cached(
                "SELECT kind, COUNT(*) FROM security_events
                 WHERE source = ?1 AND timestamp > ?2 GROUP BY kind",
            )?;
            let mut rows = stmt.query(params![source, cutoff])?;
            while let Some(row) = rows.next()? {
                by_kind.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)?);
            }
        }

        let currently_blocked: bool = conn
            .query_row(
                "SELECT 1 FROM blocked_sources WHERE source = ?1 AND unblocked_at IS NULL",
                params![source],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();

        Ok(SourceRiskProfile {
            source: source.to_string(),
            window_hours,
            total_events,
            by_level,
            by_kind,
            currently_blocked,
        })
    }

    pub fn is_blocked(&self, source: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM blocked_sources WHERE source = ?1 AND unblocked_at IS NULL",
                params![source],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// All currently blocked sources, newest first.
    pub fn blocked_sources(&self) -> Result<Vec<BlockedSource>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT source, blocked_at, reason, level, auto, unblocked_at, unblocked_by
             FROM blocked_sources
             WHERE unblocked_at IS NULL
             ORDER BY blocked_at DESC",
        )?;
        let sources = stmt
            .query_map([], Self::row_to_blocked)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(sources)
    }

    pub fn audit_trail(
        &self,
        actor: Option<&str>,
        resource: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEntry>> {
        let limit = if limit == 0 { 100 } else { limit.min(1000) };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, actor, action, resource, success, metadata_json
             FROM audit_trail
             WHERE (?1 IS NULL OR actor = ?1)
               AND (?2 IS NULL OR resource = ?2)
             ORDER BY timestamp DESC, id
             LIMIT ?3 OFFSET ?4",
        )?;
        let entries = stmt
            .query_map(params![actor, resource, limit, offset], Self::row_to_audit)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }

    pub fn counts(&self) -> Result<(i64, i64, i64)> {
        let conn = self.conn.lock();
        let events: i64 =
            conn.query_row("SELECT COUNT(*) FROM security_events", [], |row| row.get(0))?;
        let accesses: i64 =
            conn.query_row("SELECT COUNT(*) FROM api_access", [], |row| row.get(0))?;
        let audits: i64 =
            conn.query_row("SELECT COUNT(*) FROM audit_trail", [], |row| row.get(0))?;
        Ok((events, accesses, audits))
    }

    // --- row converters ----------------------------------------------------

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<StoredEvent> {
        let id: String = row.get(0)?;
        let ts: i64 = row.get(1)?;
        let kind_str: String = row.get(2)?;
        let level: i64 = row.get(3)?;
        let source: String = row.get(4)?;
        let endpoint: String = row.get(5)?;
        let description: String = row.get(6)?;
        let metadata_json: String = row.get(7)?;
        let requires_review: i64 = row.get(8)?;

        let metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        Ok(StoredEvent {
            event: SecurityEvent {
                id,
                timestamp: Utc.timestamp_opt(ts, 0).single().unwrap_or_default(),
                kind: ThreatKind::from_str(&kind_str).unwrap_or(ThreatKind::SystemAnomaly),
                level: ThreatLevel::from_code(level).unwrap_or(ThreatLevel::Info),
                source,
                endpoint,
                description,
                metadata,
                requires_review: requires_review != 0,
            },
            reviewed_by: row.get(9)?,
            review_action: row.get(10)?,
            review_notes: row.get(11)?,
        })
    }

    fn row_to_blocked(row: &rusqlite::Row) -> rusqlite::Result<BlockedSource> {
        let blocked_at: i64 = row.get(1)?;
        let level: i64 = row.get(3)?;
        let auto: i64 = row.get(4)?;
        let unblocked_at: Option<i64> = row.get(5)?;
        Ok(BlockedSource {
            source: row.get(0)?,
            blocked_at: Utc.timestamp_opt(blocked_at, 0).single().unwrap_or_default(),
            reason: row.get(2)?,
            level: ThreatLevel::from_code(level).unwrap_or(ThreatLevel::High),
            auto: auto != 0,
            unblocked_at: unblocked_at
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            unblocked_by: row.get(6)?,
        })
    }

    fn row_to_audit(row: &rusqlite::Row) -> rusqlite::Result<AuditEntry> {
        let ts: i64 = row.get(1)?;
        let action_str: String = row.get(3)?;
        let success: i64 = row.get(5)?;
        let metadata_json: String = row.get(6)?;
        let metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(AuditEntry {
            id: row.get(0)?,
            timestamp: Utc.timestamp_opt(ts, 0).single().unwrap_or_default(),
            actor: row.get(2)?,
            action: AuditAction::from_str(&action_str).unwrap_or(AuditAction::DataAccess),
            resource: row.get(4)?,
            success: success != 0,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (EventStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = EventStore::new(temp_file.path().to_str().unwrap()).unwrap();
        (store, temp_file)
    }

    fn event(kind: ThreatKind, level: ThreatLevel, source: &str) -> SecurityEvent {
        SecurityEvent::new(
            kind,
            level,
            source,
            "/v1/decision",
            "test event".to_string(),
            json!({ "n": 1 }),
        )
    }

    #[test]
    fn test_event_round_trip() {
        let (store, _temp) = create_test_store();
        let ev = event(ThreatKind::BruteForce, ThreatLevel::Critical, "attacker");
        store.store_event(&ev).unwrap();

        let got = store
            .recent_events(&EventFilter {
                source: Some("attacker".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event.id, ev.id);
        assert_eq!(got[0].event.kind, ThreatKind::BruteForce);
        assert_eq!(got[0].event.level, ThreatLevel::Critical);
        assert_eq!(got[0].event.metadata, json!({ "n": 1 }));
        assert!(got[0].event.requires_review);
        assert!(got[0].reviewed_by.is_none());
    }

    #[test]
    fn test_recent_events_filters() {
        let (store, _temp) = create_test_store();
        store
            .store_event(&event(ThreatKind::ApiAbuse, ThreatLevel::Medium, "a"))
            .unwrap();
        store
            .store_event(&event(ThreatKind::BruteForce, ThreatLevel::High, "a"))
            .unwrap();
        store
            .store_event(&event(ThreatKind::ApiAbuse, ThreatLevel::Info, "b"))
            .unwrap();

        let high = store
            .recent_events(&EventFilter {
                min_level: Some(ThreatLevel::High),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(high.len(), 1);

        let abuse = store
            .recent_events(&EventFilter {
                kind: Some(ThreatKind::ApiAbuse),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(abuse.len(), 2);

        let b = store
            .recent_events(&EventFilter {
                source: Some("b".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].event.level, ThreatLevel::Info);
    }

    #[test]
    fn test_review_queue_and_idempotent_review() {
        let (store, _temp) = create_test_store();
        let ev = event(ThreatKind::DataExfiltration, ThreatLevel::High, "a");
        store.store_event(&ev).unwrap();
        store
            .store_event(&event(ThreatKind::SystemAnomaly, ThreatLevel::Info, "a"))
            .unwrap();

        // Info events never enter the queue.
        let queue = store.review_queue(10).unwrap();
        assert_eq!(queue.len(), 1);

        let changed = store
            .review_event(&ev.id, "analyst_1", "investigate", Some("checking"))
            .unwrap();
        assert_eq!(changed, Some(true));

        // Second review is a no-op; the first reviewer stands.
        let changed = store
            .review_event(&ev.id, "analyst_2", "dismiss", None)
            .unwrap();
        assert_eq!(changed, Some(false));
        let got = store.get_event(&ev.id).unwrap().unwrap();
        assert_eq!(got.reviewed_by.as_deref(), Some("analyst_1"));

        // Unknown events report as missing.
        assert_eq!(store.review_event("nope", "a", "dismiss", None).unwrap(), None);

        assert!(store.review_queue(10).unwrap().is_empty());
    }

    #[test]
    fn test_clear_review_queue() {
        let (store, _temp) = create_test_store();
        for _ in 0..3 {
            store
                .store_event(&event(ThreatKind::ApiAbuse, ThreatLevel::Medium, "a"))
                .unwrap();
        }
        assert_eq!(store.clear_review_queue("system").unwrap(), 3);
        assert_eq!(store.clear_review_queue("system").unwrap(), 0);
        assert!(store.review_queue(10).unwrap().is_empty());
    }

    #[test]
    fn test_single_active_block_invariant() {
        let (store, _temp) = create_test_store();
        let now = Utc::now();

        assert!(store
            .block_source("bad", "brute force", ThreatLevel::Critical, true, now)
            .unwrap());
        // Second block attempt is a no-op.
        assert!(!store
            .block_source("bad", "again", ThreatLevel::High, false, now)
            .unwrap());
        assert!(store.is_blocked("bad").unwrap());
        assert_eq!(store.blocked_sources().unwrap().len(), 1);

        assert!(store.unblock_source("bad", "analyst_1", now).unwrap());
        // Unblocking a non-blocked source is a no-op.
        assert!(!store.unblock_source("bad", "analyst_1", now).unwrap());
        assert!(!store.is_blocked("bad").unwrap());

        // A fresh block after unblock creates a new row.
        assert!(store
            .block_source("bad", "relapse", ThreatLevel::Critical, true, now)
            .unwrap());
        assert_eq!(store.blocked_sources().unwrap().len(), 1);
        let blocked = &store.blocked_sources().unwrap()[0];
        assert_eq!(blocked.reason, "relapse");
        assert!(blocked.auto);
    }

    #[test]
    fn test_dashboard_aggregates() {
        let (store, _temp) = create_test_store();
        let now = Utc::now();
        store
            .store_event(&event(ThreatKind::ApiAbuse, ThreatLevel::Medium, "a"))
            .unwrap();
        store
            .store_event(&event(ThreatKind::ApiAbuse, ThreatLevel::High, "a"))
            .unwrap();
        store
            .store_event(&event(ThreatKind::BruteForce, ThreatLevel::Critical, "b"))
            .unwrap();
        store
            .block_source("b", "brute force", ThreatLevel::Critical, true, now)
            .unwrap();

        let stats = store.dashboard(now).unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_last_24h, 3);
        assert_eq!(stats.by_kind["api_abuse"], 2);
        assert_eq!(stats.by_kind["brute_force"], 1);
        assert_eq!(stats.by_level["critical"], 1);
        assert_eq!(stats.pending_reviews, 3);
        assert_eq!(stats.blocked_sources, 1);
        assert_eq!(stats.recent.len(), 3);
    }

    #[test]
    fn test_source_risk_profile() {
        let (store, _temp) = create_test_store();
        let now = Utc::now();
        store
            .store_event(&event(ThreatKind::BruteForce, ThreatLevel::High, "risky"))
            .unwrap();
        store
            .store_event(&event(ThreatKind::BruteForce, ThreatLevel::Critical, "risky"))
            .unwrap();
        store
            .store_event(&event(ThreatKind::ApiAbuse, ThreatLevel::Medium, "other"))
            .unwrap();
        store
            .block_source("risky", "brute force", ThreatLevel::Critical, true, now)
            .unwrap();

        let profile = store.source_risk_profile("risky", 24, now).unwrap();
        assert_eq!(profile.total_events, 2);
        assert_eq!(profile.by_kind["brute_force"], 2);
        assert_eq!(profile.by_level["critical"], 1);
        assert!(profile.currently_blocked);

        let other = store.source_risk_profile("other", 24, now).unwrap();
        assert_eq!(other.total_events, 1);
        assert!(!other.currently_blocked);
    }

    #[test]
    fn test_api_access_and_counts() {
        let (store, _temp) = create_test_store();
        let now = Utc::now();
        store
            .record_api_access("src", "/v1/decision", "POST", 200, 3.5, now)
            .unwrap();
        store
            .record_api_access("src", "/v1/decision", "POST", 429, 0.2, now)
            .unwrap();

        let (events, accesses, audits) = store.counts().unwrap();
        assert_eq!(events, 0);
        assert_eq!(accesses, 2);
        assert_eq!(audits, 0);
    }

    #[test]
    fn test_audit_trail_pagination() {
        let (store, _temp) = create_test_store();
        for i in 0..5 {
            let entry = AuditEntry::new(
                if i % 2 == 0 { "analyst_1" } else { "system" },
                AuditAction::ReviewEvent,
                &format!("event:{}", i),
                true,
            );
            store.record_audit(&entry).unwrap();
        }

        let all = store.audit_trail(None, None, 10, 0).unwrap();
        assert_eq!(all.len(), 5);

        let analyst = store.audit_trail(Some("analyst_1"), None, 10, 0).unwrap();
        assert_eq!(analyst.len(), 3);

        let by_resource = store.audit_trail(None, Some("event:1"), 10, 0).unwrap();
        assert_eq!(by_resource.len(), 1);
        assert_eq!(by_resource[0].actor, "system");

        let page = store.audit_trail(None, None, 2, 2).unwrap();
        assert_eq!(page.len(), 2);
    }
}
