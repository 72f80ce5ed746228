//! One commit as a single unit of work: summary merge, record appends,
//! interaction upserts and the state change land together or not at all.

use chrono::{DateTime, Utc};
use tracing::instrument;

use coursekeep_core::cmi;
use coursekeep_core::ids::SessionId;
use coursekeep_core::interaction::InteractionUpdate;
use coursekeep_core::summary::SummaryUpdate;
use coursekeep_core::SessionState;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::format_ts;
use crate::{interactions, records, sessions};

/// Everything one commit writes. `None` parts are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommitWrite<'a> {
    pub summary: Option<&'a SummaryUpdate>,
    pub records: &'a [(String, String)],
    pub interactions: &'a [InteractionUpdate],
    pub state: Option<SessionState>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitCounts {
    pub records: usize,
    pub interactions: usize,
}

pub struct CommitRepo {
    db: Database,
}

impl CommitRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validate every record path, then write all parts in one transaction.
    #[instrument(skip(self, write), fields(session_id = %session_id, records = write.records.len()))]
    pub fn apply(
        &self,
        session_id: &SessionId,
        write: &CommitWrite<'_>,
        at: DateTime<Utc>,
    ) -> Result<CommitCounts, StoreError> {
        for (path, _) in write.records {
            cmi::parse_path(path)?;
        }
        let now = format_ts(at);
        self.db.with_tx(|conn| {
            if let Some(summary) = write.summary {
                sessions::apply_summary_in(conn, session_id, summary, &now)?;
            }
            let records = records::insert_records(conn, session_id, write.records, &now)?;
            for update in write.interactions {
                interactions::upsert_one(conn, session_id, update, &now)?;
            }
            if let Some(state) = write.state {
                sessions::set_state_in(conn, session_id, state, &now)?;
            }
            Ok(CommitCounts {
                records,
                interactions: write.interactions.len(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursekeep_core::ids::PackageId;

    use crate::interactions::InteractionRepo;
    use crate::records::RecordRepo;
    use crate::sessions::SessionRepo;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let id = SessionId::from_raw("sess_commit");
        SessionRepo::new(db.clone())
            .create(&id, &PackageId::from_raw("pkg"), None, Utc::now())
            .unwrap();
        (db, id)
    }

    fn completed() -> SummaryUpdate {
        SummaryUpdate {
            completed: Some(true),
            score_raw: Some(90.0),
            ..SummaryUpdate::default()
        }
    }

    fn question(id: &str) -> InteractionUpdate {
        InteractionUpdate {
            id: id.to_string(),
            result: Some("correct".into()),
            ..InteractionUpdate::default()
        }
    }

    #[test]
    fn applies_every_part() {
        let (db, id) = setup();
        let summary = completed();
        let records = vec![("location".to_string(), "p2".to_string())];
        let updates = vec![question("q1")];
        let counts = CommitRepo::new(db.clone())
            .apply(
                &id,
                &CommitWrite {
                    summary: Some(&summary),
                    records: &records,
                    interactions: &updates,
                    state: Some(SessionState::Committed),
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(counts, CommitCounts { records: 1, interactions: 1 });

        let session = SessionRepo::new(db.clone()).get(&id).unwrap();
        assert!(session.completed);
        assert_eq!(session.state, SessionState::Committed);
        assert_eq!(
            RecordRepo::new(db.clone()).read_latest(&id, "location").unwrap().as_deref(),
            Some("p2")
        );
        assert_eq!(InteractionRepo::new(db).list(&id).unwrap().len(), 1);
    }

    #[test]
    fn invalid_path_writes_nothing() {
        let (db, id) = setup();
        let summary = completed();
        let records = vec![
            ("completion_status".to_string(), "completed".to_string()),
            ("objectives.100000".to_string(), "x".to_string()),
        ];
        let err = CommitRepo::new(db.clone())
            .apply(
                &id,
                &CommitWrite {
                    summary: Some(&summary),
                    records: &records,
                    ..CommitWrite::default()
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Path(_)));

        let session = SessionRepo::new(db.clone()).get(&id).unwrap();
        assert!(!session.completed);
        assert_eq!(RecordRepo::new(db).count(&id).unwrap(), 0);
    }

    #[test]
    fn failure_mid_commit_rolls_back_summary_and_records() {
        let (db, id) = setup();
        db.with_conn(|conn| {
            conn.execute_batch("DROP TABLE interactions")?;
            Ok(())
        })
        .unwrap();

        let summary = completed();
        let records = vec![("location".to_string(), "p9".to_string())];
        let updates = vec![question("q1")];
        let result = CommitRepo::new(db.clone()).apply(
            &id,
            &CommitWrite {
                summary: Some(&summary),
                records: &records,
                interactions: &updates,
                state: Some(SessionState::Committed),
            },
            Utc::now(),
        );
        assert!(result.is_err());

        let session = SessionRepo::new(db.clone()).get(&id).unwrap();
        assert!(!session.completed);
        assert_eq!(session.score_raw, None);
        assert_eq!(session.state, SessionState::Created);
        assert_eq!(RecordRepo::new(db).count(&id).unwrap(), 0);
    }

    #[test]
    fn unknown_session_is_not_found() {
        let (db, _) = setup();
        let summary = completed();
        let err = CommitRepo::new(db)
            .apply(
                &SessionId::from_raw("sess_ghost"),
                &CommitWrite {
                    summary: Some(&summary),
                    ..CommitWrite::default()
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
