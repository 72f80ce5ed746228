//! Append-only record log: one row per `(session, dotted path, value)` write.
//!
//! Rows are never updated. The row with the highest `written_at` (ties broken
//! by insertion order) is authoritative for a path, and [`RecordRepo::read_all`]
//! rebuilds the full tree by replaying every row in that order.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use coursekeep_core::cmi::{self, CmiNode};
use coursekeep_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_ts};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRow {
    pub id: i64,
    pub session_id: SessionId,
    pub path: String,
    pub value: String,
    pub written_at: String,
}

pub struct RecordRepo {
    db: Database,
}

impl RecordRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one record written now.
    pub fn write(&self, session_id: &SessionId, path: &str, value: &str) -> Result<i64, StoreError> {
        self.write_at(session_id, path, value, Utc::now())
    }

    /// Append one record with an explicit write time.
    #[instrument(skip(self, value), fields(session_id = %session_id))]
    pub fn write_at(
        &self,
        session_id: &SessionId,
        path: &str,
        value: &str,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        cmi::parse_path(path)?;
        let written_at = format_ts(at);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (session_id, path, value, written_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![session_id.as_str(), path, value, written_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Append a batch of records in one transaction. Every path is validated
    /// before anything is written.
    #[instrument(skip(self, entries), fields(session_id = %session_id, count = entries.len()))]
    pub fn write_many(
        &self,
        session_id: &SessionId,
        entries: &[(String, String)],
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        for (path, _) in entries {
            cmi::parse_path(path)?;
        }
        let written_at = format_ts(at);
        self.db
            .with_tx(|conn| insert_records(conn, session_id, entries, &written_at))
    }

    /// Latest value written at exactly `path`.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn read_latest(&self, session_id: &SessionId, path: &str) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT value FROM records WHERE session_id = ?1 AND path = ?2
                 ORDER BY written_at DESC, id DESC LIMIT 1",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), path])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_helpers::get(row, 0, "records", "value")?)),
                None => Ok(None),
            }
        })
    }

    /// Every record of the session, oldest first.
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<RecordRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, path, value, written_at FROM records
                 WHERE session_id = ?1 ORDER BY written_at ASC, id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(RecordRow {
                    id: row_helpers::get(row, 0, "records", "id")?,
                    session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "records", "session_id")?),
                    path: row_helpers::get(row, 2, "records", "path")?,
                    value: row_helpers::get(row, 3, "records", "value")?,
                    written_at: row_helpers::get(row, 4, "records", "written_at")?,
                });
            }
            Ok(results)
        })
    }

    /// Rebuild the session's full tree. Malformed stored paths are skipped.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn read_all(&self, session_id: &SessionId) -> Result<CmiNode, StoreError> {
        let mut tree = CmiNode::empty_object();
        for record in self.list(session_id)? {
            if let Err(error) = tree.insert(&record.path, record.value) {
                warn!(record_id = record.id, %error, "skipping malformed record path");
            }
        }
        Ok(tree)
    }

    pub fn count(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE session_id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

/// Insert pre-validated records on an open connection.
pub(crate) fn insert_records(
    conn: &Connection,
    session_id: &SessionId,
    entries: &[(String, String)],
    written_at: &str,
) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO records (session_id, path, value, written_at) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (path, value) in entries {
        stmt.execute(rusqlite::params![session_id.as_str(), path, value, written_at])?;
    }
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use coursekeep_core::ids::PackageId;
    use serde_json::json;

    fn setup() -> (Database, RecordRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let sessions = SessionRepo::new(db.clone());
        let id = SessionId::new();
        sessions
            .create(&id, &PackageId::from_raw("pkg"), None, Utc::now())
            .unwrap();
        (db.clone(), RecordRepo::new(db), id)
    }

    #[test]
    fn read_latest_returns_last_write() {
        let (_, repo, id) = setup();
        let base = Utc::now();
        for (i, status) in ["not attempted", "incomplete", "completed"].iter().enumerate() {
            repo.write_at(&id, "core.lesson_status", status, base + chrono::Duration::seconds(i as i64))
                .unwrap();
        }
        assert_eq!(
            repo.read_latest(&id, "core.lesson_status").unwrap().as_deref(),
            Some("completed")
        );
        assert_eq!(repo.count(&id).unwrap(), 3);
    }

    #[test]
    fn read_latest_ignores_insertion_order() {
        let (_, repo, id) = setup();
        let base = Utc::now();
        repo.write_at(&id, "location", "late", base + chrono::Duration::seconds(10)).unwrap();
        repo.write_at(&id, "location", "early", base).unwrap();
        assert_eq!(repo.read_latest(&id, "location").unwrap().as_deref(), Some("late"));
    }

    #[test]
    fn same_timestamp_ties_break_by_insertion() {
        let (_, repo, id) = setup();
        let at = Utc::now();
        repo.write_at(&id, "location", "first", at).unwrap();
        repo.write_at(&id, "location", "second", at).unwrap();
        assert_eq!(repo.read_latest(&id, "location").unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn read_latest_absent_path() {
        let (_, repo, id) = setup();
        assert_eq!(repo.read_latest(&id, "score.raw").unwrap(), None);
    }

    #[test]
    fn write_rejects_malformed_path() {
        let (_, repo, id) = setup();
        assert!(matches!(repo.write(&id, "core..status", "x"), Err(StoreError::Path(_))));
        assert!(matches!(repo.write(&id, "", "x"), Err(StoreError::Path(_))));
        assert_eq!(repo.count(&id).unwrap(), 0);
    }

    #[test]
    fn write_many_is_all_or_nothing_on_bad_path() {
        let (_, repo, id) = setup();
        let entries = vec![
            ("score.raw".to_string(), "85".to_string()),
            ("bad.".to_string(), "x".to_string()),
        ];
        assert!(repo.write_many(&id, &entries, Utc::now()).is_err());
        assert_eq!(repo.count(&id).unwrap(), 0);
    }

    #[test]
    fn read_all_rebuilds_tree_in_time_order() {
        let (_, repo, id) = setup();
        let base = Utc::now();
        let later = base + chrono::Duration::seconds(1);
        // Written out of order: the later raw score must win.
        repo.write_at(&id, "score.raw", "90", later).unwrap();
        repo.write_many(
            &id,
            &[
                ("score.raw".into(), "70".into()),
                ("interactions.1.id".into(), "q2".into()),
                ("interactions.0.id".into(), "q1".into()),
                ("completion_status".into(), "completed".into()),
            ],
            base,
        )
        .unwrap();

        let tree = repo.read_all(&id).unwrap().to_json();
        assert_eq!(
            tree,
            json!({
                "score": {"raw": "90"},
                "interactions": [{"id": "q1"}, {"id": "q2"}],
                "completion_status": "completed"
            })
        );
    }

    #[test]
    fn read_all_skips_malformed_stored_paths() {
        let (db, repo, id) = setup();
        repo.write(&id, "location", "p1").unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (session_id, path, value, written_at) VALUES (?1, 'a..b', 'x', ?2)",
                rusqlite::params![id.as_str(), format_ts(Utc::now())],
            )?;
            Ok(())
        })
        .unwrap();

        let tree = repo.read_all(&id).unwrap();
        assert_eq!(tree.to_json(), json!({"location": "p1"}));
    }

    #[test]
    fn read_all_empty_session() {
        let (_, repo, id) = setup();
        assert!(repo.read_all(&id).unwrap().is_empty());
    }

    mod properties {
        use super::*;
        use std::collections::HashMap;

        use proptest::prelude::*;

        const PATHS: [&str; 4] = ["location", "score.raw", "score.max", "suspend_data"];

        fn write() -> impl Strategy<Value = (usize, i64, String)> {
            (0..PATHS.len(), 0i64..5, "[a-z0-9]{1,6}")
        }

        proptest! {
            #[test]
            fn read_latest_matches_newest_write(writes in prop::collection::vec(write(), 1..40)) {
                let (_, repo, id) = setup();
                let base = Utc::now();
                // path -> (offset, value); later insertion wins a tie.
                let mut newest: HashMap<&str, (i64, String)> = HashMap::new();
                for (path, offset, value) in &writes {
                    let path = PATHS[*path];
                    repo.write_at(&id, path, value, base + chrono::Duration::seconds(*offset)).unwrap();
                    let replace = newest.get(path).map_or(true, |(seen, _)| offset >= seen);
                    if replace {
                        let _ = newest.insert(path, (*offset, value.clone()));
                    }
                }

                for path in PATHS {
                    let expected = newest.get(path).map(|(_, value)| value.clone());
                    prop_assert_eq!(repo.read_latest(&id, path).unwrap(), expected);
                }
                prop_assert_eq!(repo.count(&id).unwrap(), writes.len() as u64);
            }
        }
    }
}
