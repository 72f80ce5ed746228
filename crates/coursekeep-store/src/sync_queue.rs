//! Durable queue of state-changing actions awaiting application.
//!
//! Every runtime action, online or offline, is written here first and applied
//! by the sync processor, which is the only caller that marks entries synced.
//! Entries stay `pending` after exhausting their retries; they are excluded
//! from [`SyncQueueRepo::dequeue_batch`] but still counted by
//! [`SyncQueueRepo::status`] until an operator re-arms them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use coursekeep_core::ids::{PackageId, SessionId};
use coursekeep_core::sync::ActionKind;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_ts};

const ENTRY_COLUMNS: &str = "id, session_id, package_id, kind, payload, created_at, recorded_at,
     synced, synced_at, retry_count, last_error, next_attempt_at";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub id: i64,
    pub session_id: SessionId,
    pub package_id: PackageId,
    pub kind: ActionKind,
    pub payload: Value,
    pub created_at: String,
    /// When the client performed the action; equals `created_at` for
    /// actions recorded online.
    pub recorded_at: String,
    pub synced: bool,
    pub synced_at: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: String,
}

/// An action to append.
#[derive(Clone, Debug)]
pub struct NewSyncEntry {
    pub session_id: SessionId,
    pub package_id: PackageId,
    pub kind: ActionKind,
    pub payload: Value,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Unsynced entries, exhausted ones included.
    pub pending: u64,
    pub synced: u64,
    /// Pending entries that reached the retry limit.
    pub exhausted: u64,
    /// Pending entries per action kind.
    pub by_kind: BTreeMap<ActionKind, u64>,
}

pub struct SyncQueueRepo {
    db: Database,
}

impl SyncQueueRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one pending entry and return its id.
    #[instrument(skip(self, payload), fields(session_id = %session_id, kind = %kind))]
    pub fn enqueue(
        &self,
        session_id: &SessionId,
        package_id: &PackageId,
        kind: ActionKind,
        payload: &Value,
        recorded_at: Option<DateTime<Utc>>,
    ) -> Result<i64, StoreError> {
        let entry = NewSyncEntry {
            session_id: session_id.clone(),
            package_id: package_id.clone(),
            kind,
            payload: payload.clone(),
            recorded_at,
        };
        let now = Utc::now();
        let id = self.db.with_conn(|conn| insert_entry(conn, &entry, now))?;
        debug!(entry_id = id, "sync entry enqueued");
        Ok(id)
    }

    /// Append several entries atomically, in slice order.
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    pub fn enqueue_batch(&self, entries: &[NewSyncEntry]) -> Result<Vec<i64>, StoreError> {
        let now = Utc::now();
        self.db.with_tx(|conn| {
            entries
                .iter()
                .map(|entry| insert_entry(conn, entry, now))
                .collect()
        })
    }

    /// Oldest-first entries eligible for an attempt at `now`.
    ///
    /// An entry is held back while an earlier pending, non-exhausted entry of
    /// the same session is waiting out its backoff, so per-session order is
    /// kept across passes. Initialize entries are never held: they depend on
    /// no earlier action, and the entries they precede may be failing only
    /// because the session does not exist yet.
    #[instrument(skip(self))]
    pub fn dequeue_batch(
        &self,
        limit: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncEntry>, StoreError> {
        self.dequeue(None, limit, max_retries, now)
    }

    /// [`dequeue_batch`](Self::dequeue_batch) restricted to one session.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn dequeue_session(
        &self,
        session_id: &SessionId,
        limit: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncEntry>, StoreError> {
        self.dequeue(Some(session_id), limit, max_retries, now)
    }

    fn dequeue(
        &self,
        session_id: Option<&SessionId>,
        limit: u32,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncEntry>, StoreError> {
        let now = format_ts(now);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue q
                 WHERE q.synced = 0
                   AND (?5 IS NULL OR q.session_id = ?5)
                   AND q.retry_count < ?1
                   AND q.next_attempt_at <= ?2
                   AND (q.kind = ?4 OR NOT EXISTS (
                       SELECT 1 FROM sync_queue p
                       WHERE p.session_id = q.session_id
                         AND p.synced = 0
                         AND p.retry_count < ?1
                         AND p.next_attempt_at > ?2
                         AND (p.created_at < q.created_at
                              OR (p.created_at = q.created_at AND p.id < q.id))
                   ))
                 ORDER BY q.created_at ASC, q.id ASC
                 LIMIT ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![
                max_retries,
                now,
                limit,
                ActionKind::Initialize.to_string(),
                session_id.map(SessionId::as_str),
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    /// Mark an entry synced. Returns `false` if it was already synced.
    #[instrument(skip(self), fields(entry_id = id))]
    pub fn mark_synced(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let at = format_ts(at);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sync_queue SET synced = 1, synced_at = ?1, last_error = NULL
                 WHERE id = ?2 AND synced = 0",
                rusqlite::params![at, id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Record a failed attempt and return the new retry count.
    #[instrument(skip(self, error), fields(entry_id = id))]
    pub fn increment_retry(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let next = format_ts(next_attempt_at);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sync_queue
                 SET retry_count = retry_count + 1, last_error = ?1, next_attempt_at = ?2
                 WHERE id = ?3 AND synced = 0",
                rusqlite::params![error, next, id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("pending sync entry {id}")));
            }
            let count: u32 = conn.query_row(
                "SELECT retry_count FROM sync_queue WHERE id = ?1",
                [id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    pub fn status(&self, max_retries: u32) -> Result<QueueStatus, StoreError> {
        self.db.with_conn(|conn| {
            let (pending, synced, exhausted): (i64, i64, i64) = conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN synced = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN synced = 0 AND retry_count >= ?1 THEN 1 ELSE 0 END), 0)
                 FROM sync_queue",
                [max_retries],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            let mut by_kind: BTreeMap<ActionKind, u64> =
                ActionKind::ALL.iter().map(|kind| (*kind, 0)).collect();
            let mut stmt = conn.prepare(
                "SELECT kind, COUNT(*) FROM sync_queue WHERE synced = 0 GROUP BY kind",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let kind: String = row_helpers::get(row, 0, "sync_queue", "kind")?;
                let count: i64 = row_helpers::get(row, 1, "sync_queue", "kind")?;
                let kind: ActionKind = row_helpers::parse_enum(&kind, "sync_queue", "kind")?;
                let _ = by_kind.insert(kind, count as u64);
            }

            Ok(QueueStatus {
                pending: pending as u64,
                synced: synced as u64,
                exhausted: exhausted as u64,
                by_kind,
            })
        })
    }

    /// Pending entries that reached the retry limit, oldest first.
    pub fn exhausted(&self, max_retries: u32) -> Result<Vec<SyncEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_queue
                 WHERE synced = 0 AND retry_count >= ?1
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query([max_retries])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }

    /// Re-arm a pending entry for immediate retry. Returns `false` for
    /// unknown or already-synced entries.
    #[instrument(skip(self), fields(entry_id = id))]
    pub fn reset_retries(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let at = format_ts(at);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sync_queue SET retry_count = 0, next_attempt_at = ?1
                 WHERE id = ?2 AND synced = 0",
                rusqlite::params![at, id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Re-arm every unsynced entry of `entry`'s session queued before it,
    /// exhausted ones included. Returns how many were re-armed.
    #[instrument(skip(self, entry), fields(entry_id = entry.id, session_id = %entry.session_id))]
    pub fn rearm_earlier(&self, entry: &SyncEntry, at: DateTime<Utc>) -> Result<usize, StoreError> {
        let at = format_ts(at);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sync_queue SET retry_count = 0, next_attempt_at = ?1
                 WHERE session_id = ?2
                   AND synced = 0
                   AND (created_at < ?3 OR (created_at = ?3 AND id < ?4))",
                rusqlite::params![at, entry.session_id.as_str(), entry.created_at, entry.id],
            )?;
            Ok(changed)
        })
    }

    pub fn get(&self, id: i64) -> Result<SyncEntry, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"))?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => row_to_entry(row),
                None => Err(StoreError::NotFound(format!("sync entry {id}"))),
            }
        })
    }

    /// Package of the first initialize queued for this session, synced or
    /// not. Lets callers address a session whose row does not exist yet.
    pub fn initialized_package(&self, session_id: &SessionId) -> Result<Option<PackageId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT package_id FROM sync_queue WHERE session_id = ?1 AND kind = ?2
                 ORDER BY created_at ASC, id ASC LIMIT 1",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                session_id.as_str(),
                ActionKind::Initialize.to_string()
            ])?;
            match rows.next()? {
                Some(row) => Ok(Some(PackageId::from_raw(row_helpers::get::<String>(
                    row,
                    0,
                    "sync_queue",
                    "package_id",
                )?))),
                None => Ok(None),
            }
        })
    }

    pub fn pending_count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE synced = 0",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

fn insert_entry(conn: &Connection, entry: &NewSyncEntry, now: DateTime<Utc>) -> Result<i64, StoreError> {
    let created_at = format_ts(now);
    let recorded_at = format_ts(entry.recorded_at.unwrap_or(now));
    let payload = serde_json::to_string(&entry.payload)?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO sync_queue (session_id, package_id, kind, payload, created_at, recorded_at, next_attempt_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5)",
    )?;
    stmt.execute(rusqlite::params![
        entry.session_id.as_str(),
        entry.package_id.as_str(),
        entry.kind.to_string(),
        payload,
        created_at,
        recorded_at,
    ])?;
    Ok(conn.last_insert_rowid())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<SyncEntry, StoreError> {
    const T: &str = "sync_queue";
    let kind: String = row_helpers::get(row, 3, T, "kind")?;
    let payload: String = row_helpers::get(row, 4, T, "payload")?;
    let synced: i64 = row_helpers::get(row, 7, T, "synced")?;

    Ok(SyncEntry {
        id: row_helpers::get(row, 0, T, "id")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        package_id: PackageId::from_raw(row_helpers::get::<String>(row, 2, T, "package_id")?),
        kind: row_helpers::parse_enum(&kind, T, "kind")?,
        payload: row_helpers::parse_json(&payload, T, "payload")?,
        created_at: row_helpers::get(row, 5, T, "created_at")?,
        recorded_at: row_helpers::get(row, 6, T, "recorded_at")?,
        synced: synced != 0,
        synced_at: row_helpers::get_opt(row, 8, T, "synced_at")?,
        retry_count: row_helpers::get(row, 9, T, "retry_count")?,
        last_error: row_helpers::get_opt(row, 10, T, "last_error")?,
        next_attempt_at: row_helpers::get(row, 11, T, "next_attempt_at")?,
    })
}
