use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use coursekeep_core::ids::SessionId;
use coursekeep_core::interaction::InteractionUpdate;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_ts};

const UPSERT_SQL: &str =
    "INSERT INTO interactions (session_id, interaction_id, kind, timestamp, correct_responses,
                               learner_response, result, latency, description, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
     ON CONFLICT(session_id, interaction_id) DO UPDATE SET
        kind = COALESCE(excluded.kind, kind),
        timestamp = COALESCE(excluded.timestamp, timestamp),
        correct_responses = COALESCE(excluded.correct_responses, correct_responses),
        learner_response = COALESCE(excluded.learner_response, learner_response),
        result = COALESCE(excluded.result, result),
        latency = COALESCE(excluded.latency, latency),
        description = COALESCE(excluded.description, description),
        updated_at = excluded.updated_at";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRow {
    pub session_id: SessionId,
    pub interaction_id: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub timestamp: Option<String>,
    /// JSON array of correct-response patterns.
    pub correct_responses: Option<String>,
    pub learner_response: Option<String>,
    pub result: Option<String>,
    pub latency: Option<String>,
    pub description: Option<String>,
    pub updated_at: String,
}

pub struct InteractionRepo {
    db: Database,
}

impl InteractionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or merge one interaction. Fields the update leaves unset keep
    /// their stored value (a retried question usually resends only the new
    /// response and result).
    #[instrument(skip(self, update), fields(session_id = %session_id, interaction_id = %update.id))]
    pub fn upsert(
        &self,
        session_id: &SessionId,
        update: &InteractionUpdate,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now = format_ts(at);
        self.db.with_conn(|conn| upsert_one(conn, session_id, update, &now))
    }

    #[instrument(skip(self, updates), fields(session_id = %session_id, count = updates.len()))]
    pub fn upsert_many(
        &self,
        session_id: &SessionId,
        updates: &[InteractionUpdate],
        at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let now = format_ts(at);
        self.db.with_tx(|conn| {
            for update in updates {
                upsert_one(conn, session_id, update, &now)?;
            }
            Ok(updates.len())
        })
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<InteractionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, interaction_id, kind, timestamp, correct_responses,
                        learner_response, result, latency, description, updated_at
                 FROM interactions WHERE session_id = ?1 ORDER BY interaction_id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_interaction(row)?);
            }
            Ok(results)
        })
    }
}

pub(crate) fn upsert_one(
    conn: &Connection,
    session_id: &SessionId,
    update: &InteractionUpdate,
    now: &str,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(UPSERT_SQL)?;
    stmt.execute(rusqlite::params![
        session_id.as_str(),
        update.id,
        update.kind,
        update.timestamp,
        update.correct_responses,
        update.learner_response,
        update.result,
        update.latency,
        update.description,
        now,
    ])?;
    Ok(())
}

fn row_to_interaction(row: &rusqlite::Row<'_>) -> Result<InteractionRow, StoreError> {
    const T: &str = "interactions";
    Ok(InteractionRow {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "session_id")?),
        interaction_id: row_helpers::get(row, 1, T, "interaction_id")?,
        kind: row_helpers::get_opt(row, 2, T, "kind")?,
        timestamp: row_helpers::get_opt(row, 3, T, "timestamp")?,
        correct_responses: row_helpers::get_opt(row, 4, T, "correct_responses")?,
        learner_response: row_helpers::get_opt(row, 5, T, "learner_response")?,
        result: row_helpers::get_opt(row, 6, T, "result")?,
        latency: row_helpers::get_opt(row, 7, T, "latency")?,
        description: row_helpers::get_opt(row, 8, T, "description")?,
        updated_at: row_helpers::get(row, 9, T, "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use coursekeep_core::ids::PackageId;

    fn setup() -> (InteractionRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let id = SessionId::new();
        SessionRepo::new(db.clone())
            .create(&id, &PackageId::from_raw("pkg"), None, Utc::now())
            .unwrap();
        (InteractionRepo::new(db), id)
    }

    fn question(id: &str) -> InteractionUpdate {
        InteractionUpdate {
            id: id.to_string(),
            kind: Some("choice".into()),
            learner_response: Some("a".into()),
            result: Some("wrong".into()),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_inserts_then_merges() {
        let (repo, session) = setup();
        repo.upsert(&session, &question("q1"), Utc::now()).unwrap();

        let retry = InteractionUpdate {
            id: "q1".into(),
            learner_response: Some("b".into()),
            result: Some("correct".into()),
            ..Default::default()
        };
        repo.upsert(&session, &retry, Utc::now()).unwrap();

        let rows = repo.list(&session).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind.as_deref(), Some("choice"));
        assert_eq!(rows[0].learner_response.as_deref(), Some("b"));
        assert_eq!(rows[0].result.as_deref(), Some("correct"));
    }

    #[test]
    fn upsert_many_keys_by_interaction_id() {
        let (repo, session) = setup();
        let written = repo
            .upsert_many(&session, &[question("q1"), question("q2"), question("q1")], Utc::now())
            .unwrap();
        assert_eq!(written, 3);

        let ids: Vec<String> = repo
            .list(&session)
            .unwrap()
            .into_iter()
            .map(|r| r.interaction_id)
            .collect();
        assert_eq!(ids, vec!["q1", "q2"]);
    }

    #[test]
    fn upsert_many_empty_is_noop() {
        let (repo, session) = setup();
        assert_eq!(repo.upsert_many(&session, &[], Utc::now()).unwrap(), 0);
        assert!(repo.list(&session).unwrap().is_empty());
    }

    #[test]
    fn row_serializes_kind_as_type() {
        let (repo, session) = setup();
        repo.upsert(&session, &question("q1"), Utc::now()).unwrap();
        let json = serde_json::to_value(&repo.list(&session).unwrap()[0]).unwrap();
        assert_eq!(json["type"], "choice");
        assert_eq!(json["interaction_id"], "q1");
    }
}
