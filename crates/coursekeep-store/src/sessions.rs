use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use coursekeep_core::ids::{LearnerId, PackageId, SessionId};
use coursekeep_core::summary::{SuccessStatus, SummaryUpdate};
use coursekeep_core::SessionState;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_ts};

const SESSION_COLUMNS: &str = "id, package_id, learner_id, state, completed, success_status,
     score_raw, score_min, score_max, session_time, total_time, suspend_data, location,
     created_at, last_accessed_at, updated_at";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionId,
    pub package_id: PackageId,
    pub learner_id: Option<LearnerId>,
    pub state: SessionState,
    pub completed: bool,
    pub success_status: SuccessStatus,
    pub score_raw: Option<f64>,
    pub score_min: Option<f64>,
    pub score_max: Option<f64>,
    pub session_time: Option<String>,
    pub total_time: Option<String>,
    pub suspend_data: Option<String>,
    pub location: Option<String>,
    pub created_at: String,
    pub last_accessed_at: String,
    pub updated_at: String,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a session in the `created` state. Returns `false` when a
    /// session with this id already exists; the existing row is untouched.
    #[instrument(skip(self), fields(session_id = %id, package_id = %package_id))]
    pub fn create(
        &self,
        id: &SessionId,
        package_id: &PackageId,
        learner_id: Option<&LearnerId>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = format_ts(at);
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO sessions (id, package_id, learner_id, state, created_at, last_accessed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?5)
                 ON CONFLICT(id) DO NOTHING",
                rusqlite::params![
                    id.as_str(),
                    package_id.as_str(),
                    learner_id.map(LearnerId::as_str),
                    SessionState::Created.to_string(),
                    now,
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    pub fn find(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row).map(Some),
                None => Ok(None),
            }
        })
    }

    pub fn exists(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(found != 0)
        })
    }

    /// Sessions of a package, oldest first.
    #[instrument(skip(self), fields(package_id = %package_id))]
    pub fn list_by_package(&self, package_id: &PackageId) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE package_id = ?1
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let mut rows = stmt.query([package_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Merge derived summary fields into the row. Fields the update does not
    /// carry keep their stored value.
    #[instrument(skip(self, update), fields(session_id = %id))]
    pub fn apply_summary(
        &self,
        id: &SessionId,
        update: &SummaryUpdate,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now = format_ts(at);
        self.db.with_conn(|conn| apply_summary_in(conn, id, update, &now))
    }

    #[instrument(skip(self), fields(session_id = %id, state = %state))]
    pub fn set_state(
        &self,
        id: &SessionId,
        state: SessionState,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now = format_ts(at);
        self.db.with_conn(|conn| set_state_in(conn, id, state, &now))
    }

    /// Record a read access.
    pub fn touch(&self, id: &SessionId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let now = format_ts(at);
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET last_accessed_at = ?1 WHERE id = ?2",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Delete every session of a package; records and interactions follow
    /// through the foreign-key cascade. Queue entries are kept.
    #[instrument(skip(self), fields(package_id = %package_id))]
    pub fn delete_by_package(&self, package_id: &PackageId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM sessions WHERE package_id = ?1",
                [package_id.as_str()],
            )?;
            Ok(deleted)
        })
    }
}

pub(crate) fn apply_summary_in(
    conn: &Connection,
    id: &SessionId,
    update: &SummaryUpdate,
    now: &str,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE sessions SET
            completed = COALESCE(?1, completed),
            success_status = COALESCE(?2, success_status),
            score_raw = COALESCE(?3, score_raw),
            score_min = COALESCE(?4, score_min),
            score_max = COALESCE(?5, score_max),
            session_time = COALESCE(?6, session_time),
            total_time = COALESCE(?7, total_time),
            suspend_data = COALESCE(?8, suspend_data),
            location = COALESCE(?9, location),
            updated_at = ?10
         WHERE id = ?11",
        rusqlite::params![
            update.completed.map(i64::from),
            update.success_status.map(|s| s.to_string()),
            update.score_raw,
            update.score_min,
            update.score_max,
            update.session_time,
            update.total_time,
            update.suspend_data,
            update.location,
            now,
            id.as_str(),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("session {id}")));
    }
    Ok(())
}

pub(crate) fn set_state_in(
    conn: &Connection,
    id: &SessionId,
    state: SessionState,
    now: &str,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE sessions SET state = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![state.to_string(), now, id.as_str()],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound(format!("session {id}")));
    }
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    const T: &str = "sessions";
    let state: String = row_helpers::get(row, 3, T, "state")?;
    let completed: i64 = row_helpers::get(row, 4, T, "completed")?;
    let success: String = row_helpers::get(row, 5, T, "success_status")?;

    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        package_id: PackageId::from_raw(row_helpers::get::<String>(row, 1, T, "package_id")?),
        learner_id: row_helpers::get_opt::<String>(row, 2, T, "learner_id")?.map(LearnerId::from_raw),
        state: row_helpers::parse_enum(&state, T, "state")?,
        completed: completed != 0,
        success_status: row_helpers::parse_enum(&success, T, "success_status")?,
        score_raw: row_helpers::get_opt(row, 6, T, "score_raw")?,
        score_min: row_helpers::get_opt(row, 7, T, "score_min")?,
        score_max: row_helpers::get_opt(row, 8, T, "score_max")?,
        session_time: row_helpers::get_opt(row, 9, T, "session_time")?,
        total_time: row_helpers::get_opt(row, 10, T, "total_time")?,
        suspend_data: row_helpers::get_opt(row, 11, T, "suspend_data")?,
        location: row_helpers::get_opt(row, 12, T, "location")?,
        created_at: row_helpers::get(row, 13, T, "created_at")?,
        last_accessed_at: row_helpers::get(row, 14, T, "last_accessed_at")?,
        updated_at: row_helpers::get(row, 15, T, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordRepo;

    fn setup() -> (Database, SessionRepo, PackageId) {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        (db, repo, PackageId::from_raw("golf-101"))
    }

    fn new_session(repo: &SessionRepo, package: &PackageId) -> SessionId {
        let id = SessionId::new();
        assert!(repo.create(&id, package, None, Utc::now()).unwrap());
        id
    }

    #[test]
    fn create_and_get() {
        let (_, repo, package) = setup();
        let learner = LearnerId::from_raw("learner-7");
        let id = SessionId::new();
        repo.create(&id, &package, Some(&learner), Utc::now()).unwrap();

        let session = repo.get(&id).unwrap();
        assert_eq!(session.package_id, package);
        assert_eq!(session.learner_id, Some(learner));
        assert_eq!(session.state, SessionState::Created);
        assert!(!session.completed);
        assert_eq!(session.success_status, SuccessStatus::Unknown);
        assert_eq!(session.score_raw, None);
    }

    #[test]
    fn create_existing_id_is_noop() {
        let (_, repo, package) = setup();
        let id = new_session(&repo, &package);
        repo.set_state(&id, SessionState::Active, Utc::now()).unwrap();

        assert!(!repo.create(&id, &package, None, Utc::now()).unwrap());
        assert_eq!(repo.get(&id).unwrap().state, SessionState::Active);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_, repo, _) = setup();
        let err = repo.get(&SessionId::from_raw("sess_missing")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!repo.exists(&SessionId::from_raw("sess_missing")).unwrap());
    }

    #[test]
    fn apply_summary_keeps_absent_fields() {
        let (_, repo, package) = setup();
        let id = new_session(&repo, &package);

        let first = SummaryUpdate {
            completed: Some(false),
            score_raw: Some(40.0),
            suspend_data: Some("page=2".into()),
            ..Default::default()
        };
        repo.apply_summary(&id, &first, Utc::now()).unwrap();

        let second = SummaryUpdate {
            completed: Some(true),
            success_status: Some(SuccessStatus::Passed),
            ..Default::default()
        };
        repo.apply_summary(&id, &second, Utc::now()).unwrap();

        let session = repo.get(&id).unwrap();
        assert!(session.completed);
        assert_eq!(session.success_status, SuccessStatus::Passed);
        assert_eq!(session.score_raw, Some(40.0));
        assert_eq!(session.suspend_data.as_deref(), Some("page=2"));
    }

    #[test]
    fn apply_summary_unknown_session() {
        let (_, repo, _) = setup();
        let err = repo
            .apply_summary(&SessionId::from_raw("sess_nope"), &SummaryUpdate::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_by_package_filters() {
        let (_, repo, package) = setup();
        let other = PackageId::from_raw("other");
        let a = new_session(&repo, &package);
        let b = new_session(&repo, &package);
        new_session(&repo, &other);

        let ids: Vec<SessionId> = repo
            .list_by_package(&package)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));
    }

    #[test]
    fn delete_by_package_cascades_to_records() {
        let (db, repo, package) = setup();
        let records = RecordRepo::new(db.clone());
        let id = new_session(&repo, &package);
        records.write(&id, "core.lesson_status", "passed").unwrap();

        assert_eq!(repo.delete_by_package(&package).unwrap(), 1);
        assert!(!repo.exists(&id).unwrap());
        assert_eq!(records.count(&id).unwrap(), 0);
    }

    #[test]
    fn touch_updates_last_access() {
        let (_, repo, package) = setup();
        let id = new_session(&repo, &package);
        let before = repo.get(&id).unwrap().last_accessed_at;

        let later = Utc::now() + chrono::Duration::seconds(5);
        repo.touch(&id, later).unwrap();
        let after = repo.get(&id).unwrap().last_accessed_at;
        assert!(after > before);
        assert_eq!(after, format_ts(later));
    }
}
