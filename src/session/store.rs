//! Persistent session store.
//!
//! Sessions survive restarts: two SQLite tables, `session_behaviors` and
//! `session_events`, in their own database file. Updates for one session
//! are serialised by a per-session guard; a 60-second read-through cache
//! fronts `get` and is invalidated inside the write critical section so it
//! can never serve a stale row.

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

CREATE TABLE IF NOT EXISTS session_behaviors (
    session_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_activity INTEGER NOT NULL,
    transaction_count INTEGER NOT NULL,
    total_amount REAL NOT NULL,
    new_beneficiary_count INTEGER NOT NULL,
    risk_score INTEGER NOT NULL,
    is_terminated INTEGER NOT NULL,
    termination_reason TEXT,
    terminated_by TEXT,
    first_location TEXT,
    anomalies_json TEXT NOT NULL,
    metadata_json TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_session_behaviors_account
    ON session_behaviors(account_id);
CREATE INDEX IF NOT EXISTS idx_session_behaviors_risk
    ON session_behaviors(risk_score DESC);
CREATE INDEX IF NOT EXISTS idx_session_behaviors_terminated
    ON session_behaviors(is_terminated);
CREATE INDEX IF NOT EXISTS idx_session_behaviors_created
    ON session_behaviors(created_at DESC);

CREATE TABLE IF NOT EXISTS session_events (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    risk_delta INTEGER NOT NULL,
    data_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_events_session
    ON session_events(session_id, timestamp);
"#;

const CACHE_TTL_SECS: i64 = 60;

/// One logical user session: a multi-transaction arc under a caller-supplied
/// identifier.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub transaction_count: u32,
    pub total_amount: f64,
    pub new_beneficiary_count: u32,
    pub risk_score: u32,
    pub terminated: bool,
    pub termination_reason: Option<String>,
    pub terminated_by: Option<String>,
    /// First location observed in the session, for the geolocation signal.
    pub first_location: Option<String>,
    pub anomalies: Vec<String>,
    pub metadata: serde_json::Value,
}

/// Append-only per-session log entry.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub id: String,
    pub session_id: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub risk_delta: i64,
    pub data: serde_json::Value,
}

/// Result of recording one transaction: the post-update snapshot and the id
/// of the appended `transaction` event (used to attach the risk delta once
/// the scorer has run).
#[derive(Debug, Clone)]
pub struct RecordedTransaction {
    pub session: Session,
    pub event_id: String,
    pub created: bool,
}

pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cache: Mutex<HashMap<String, (Session, DateTime<Utc>)>>,
}

impl SessionStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open session store at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize session store schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM session_behaviors", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📒 Session store initialized at {} ({} sessions)", db_path, count);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            guards: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn guard_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock();
        guards
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cache_put(&self, session: &Session, now: DateTime<Utc>) {
        self.cache
            .lock()
            .insert(session.session_id.clone(), (session.clone(), now));
    }

    /// Record one transaction against a session, creating it on first use.
    /// Calls for the same session are serialised; a terminated session is
    /// returned unchanged and never re-opened.
    pub fn record_transaction(
        &self,
        session_id: &str,
        account_id: &str,
        amount: f64,
        is_new_beneficiary: bool,
        location: &str,
        metadata: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<RecordedTransaction> {
        let guard = self.guard_for(session_id);
        let _serialised = guard.lock();

        let existing = self.load(session_id)?;

        if let Some(session) = &existing {
            if session.terminated {
                return Ok(RecordedTransaction {
                    session: session.clone(),
                    event_id: String::new(),
                    created: false,
                });
            }
        }

        let conn = self.conn.lock();
        let created = existing.is_none();

        if created {
            conn.execute(
                "INSERT INTO session_behaviors
                 (session_id, account_id, created_at, last_activity, transaction_count,
                  total_amount, new_beneficiary_count, risk_score, is_terminated,
                  first_location, anomalies_json, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, 0, 0.0, 0, 0, 0, ?5, '[]', ?6)",
                params![
                    session_id,
                    account_id,
                    now.timestamp(),
                    now.timestamp(),
                    location,
                    serde_json::to_string(metadata)?,
                ],
            )?;
            Self::append_event_locked(
                &conn,
                session_id,
                "session_start",
                now,
                0,
                &serde_json::json!({ "account_id": account_id }),
            )?;
        }

        conn.execute(
            "UPDATE session_behaviors SET
                transaction_count = transaction_count + 1,
                total_amount = total_amount + ?1,
                new_beneficiary_count = new_beneficiary_count + ?2,
                last_activity = ?3
             WHERE session_id = ?4",
            params![
                amount,
                is_new_beneficiary as i64,
                now.timestamp(),
                session_id
            ],
        )?;

        let event_id = Self::append_event_locked(
            &conn,
            session_id,
            "transaction",
            now,
            0,
            &serde_json::json!({
                "amount": amount,
                "is_new_beneficiary": is_new_beneficiary,
                "location": location,
            }),
        )?;

        let session = Self::load_locked(&conn, session_id)?
            .context("session row vanished during record_transaction")?;
        drop(conn);

        // Cache update happens inside the per-session guard, atomically with
        // the store update from any reader's point of view.
        self.cache_put(&session, now);

        Ok(RecordedTransaction {
            session,
            event_id,
            created,
        })
    }

    /// Persist the scorer's output for a session and stamp the risk delta
    /// onto the transaction event that produced it.
    pub fn update_risk(
        &self,
        session_id: &str,
        risk_score: u32,
        anomalies: &[String],
        event_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let guard = self.guard_for(session_id);
        let _serialised = guard.lock();

        let conn = self.conn.lock();
        let previous: Option<i64> = conn
            .query_row(
                "SELECT risk_score FROM session_behaviors WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(previous) = previous else {
            warn!(session_id, "update_risk for unknown session");
            return Ok(());
        };

        conn.execute(
            "UPDATE session_behaviors SET risk_score = ?1, anomalies_json = ?2
             WHERE session_id = ?3",
            params![
                risk_score as i64,
                serde_json::to_string(anomalies)?,
                session_id
            ],
        )?;

        if let Some(event_id) = event_id {
            conn.execute(
                "UPDATE session_events SET risk_delta = ?1 WHERE id = ?2",
                params![risk_score as i64 - previous, event_id],
            )?;
        }

        let session = Self::load_locked(&conn, session_id)?;
        drop(conn);
        if let Some(session) = session {
            self.cache_put(&session, now);
        }

        Ok(())
    }

    /// Terminate a session. Returns false when it is absent or already
    /// terminated; repeating the call is safe.
    pub fn terminate(
        &self,
        session_id: &str,
        reason: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let guard = self.guard_for(session_id);
        let _serialised = guard.lock();

        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE session_behaviors
             SET is_terminated = 1, termination_reason = ?1, terminated_by = ?2,
                 last_activity = ?3
             WHERE session_id = ?4 AND is_terminated = 0",
            params![reason, actor, now.timestamp(), session_id],
        )?;

        if changed > 0 {
            Self::append_event_locked(
                &conn,
                session_id,
                "session_terminated",
                now,
                0,
                &serde_json::json!({ "reason": reason, "actor": actor }),
            )?;
            info!(session_id, reason, actor, "🛑 Session terminated");
        }

        let session = Self::load_locked(&conn, session_id)?;
        drop(conn);
        if let Some(session) = session {
            self.cache_put(&session, now);
        }

        Ok(changed > 0)
    }

    /// Mark sessions with no activity since `older_than` as expired. Safe to
    /// call repeatedly.
    pub fn cleanup(&self, older_than: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let stale: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT session_id FROM session_behaviors
                 WHERE is_terminated = 0 AND last_activity < ?1",
            )?;
            let ids = stmt
                .query_map(params![older_than.timestamp()], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            ids
        };

        let mut expired = 0usize;
        for session_id in stale {
            if self.terminate(&session_id, "expired", "system", now)? {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "🧹 Expired idle sessions");
        }
        Ok(expired)
    }

    /// Fetch a session, through the 60-second cache. Expired entries are
    /// dropped on read and re-filled from the store.
    pub fn get(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<Session>> {
        {
            let mut cache = self.cache.lock();
            if let Some((session, inserted)) = cache.get(session_id) {
                if now - *inserted < Duration::seconds(CACHE_TTL_SECS) {
                    return Ok(Some(session.clone()));
                }
                cache.remove(session_id);
            }
        }

        let session = self.load(session_id)?;
        if let Some(session) = &session {
            self.cache_put(session, now);
        }
        Ok(session)
    }

    pub fn list_active(&self, limit: usize) -> Result<Vec<Session>> {
        let limit = if limit == 0 { 100 } else { limit.min(1000) };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM session_behaviors
             WHERE is_terminated = 0
             ORDER BY last_activity DESC
             LIMIT ?1",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([limit], Self::row_to_session)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(sessions)
    }

    pub fn list_by_account(&self, account_id: &str, active_only: bool) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM session_behaviors
             WHERE account_id = ?1 AND (?2 = 0 OR is_terminated = 0)
             ORDER BY created_at DESC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map(params![account_id, active_only as i64], Self::row_to_session)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(sessions)
    }

    pub fn list_suspicious(&self, min_risk: u32) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM session_behaviors
             WHERE risk_score >= ?1
             ORDER BY risk_score DESC, last_activity DESC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([min_risk as i64], Self::row_to_session)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(sessions)
    }

    pub fn events(&self, session_id: &str) -> Result<Vec<SessionEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, kind, timestamp, risk_delta, data_json
             FROM session_events
             WHERE session_id = ?1
             ORDER BY timestamp, rowid",
        )?;
        let events = stmt
            .query_map(params![session_id], |row| {
                let ts: i64 = row.get(3)?;
                let data_json: String = row.get(5)?;
                let data = serde_json::from_str(&data_json)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                Ok(SessionEvent {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    kind: row.get(2)?,
                    timestamp: Utc.timestamp_opt(ts, 0).single().unwrap_or_default(),
                    risk_delta: row.get(4)?,
                    data,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM session_behaviors", [], |row| row.get(0))?)
    }

    // --- internals ---------------------------------------------------------

    fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        Self::load_locked(&conn, session_id)
    }

    fn load_locked(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM session_behaviors WHERE session_id = ?1",
            SESSION_COLUMNS
        ))?;
        let mut rows = stmt.query(params![session_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_session(row)?)),
            None => Ok(None),
        }
    }

    fn append_event_locked(
        conn: &Connection,
        session_id: &str,
        kind: &str,
        now: DateTime<Utc>,
        risk_delta: i64,
        data: &serde_json::Value,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO session_events (id, session_id, kind, timestamp, risk_delta, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                session_id,
                kind,
                now.timestamp(),
                risk_delta,
                serde_json::to_string(data)?,
            ],
        )?;
        Ok(id)
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        let created_at: i64 = row.get(2)?;
        let last_activity: i64 = row.get(3)?;
        let terminated: i64 = row.get(8)?;
        let anomalies_json: String = row.get(12)?;
        let metadata_json: String = row.get(13)?;

        let anomalies = serde_json::from_str(&anomalies_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let metadata = serde_json::from_str(&metadata_json)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        Ok(Session {
            session_id: row.get(0)?,
            account_id: row.get(1)?,
            created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_default(),
            last_activity: Utc
                .timestamp_opt(last_activity, 0)
                .single()
                .unwrap_or_default(),
            transaction_count: row.get::<_, i64>(4)? as u32,
            total_amount: row.get(5)?,
            new_beneficiary_count: row.get::<_, i64>(6)? as u32,
            risk_score: row.get::<_, i64>(7)? as u32,
            terminated: terminated != 0,
            termination_reason: row.get(9)?,
            terminated_by: row.get(10)?,
            first_location: row.get(11)?,
            anomalies,
            metadata,
        })
    }
}

const SESSION_COLUMNS: &str = "session_id, account_id, created_at, last_activity, \
     transaction_count, total_amount, new_beneficiary_count, risk_score, \
     is_terminated, termination_reason, terminated_by, first_location, \
     anomalies_json, metadata_json";
