//! Session state machine: initialize, commit, terminate and resume.
//!
//! Every mutation here is reached through the sync processor (via
//! [`crate::sink::LocalSink`]), so offline replays and online calls share one
//! code path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use coursekeep_core::cmi::{self, CmiNode};
use coursekeep_core::ids::{LearnerId, PackageId, SessionId};
use coursekeep_core::interaction::extract_interactions;
use coursekeep_core::summary::{cmi_root, SummaryUpdate};
use coursekeep_core::LifecycleEvent;
use coursekeep_store::commits::{CommitRepo, CommitWrite};
use coursekeep_store::interactions::{InteractionRepo, InteractionRow};
use coursekeep_store::records::RecordRepo;
use coursekeep_store::sessions::{SessionRepo, SessionRow};
use coursekeep_store::Database;

use crate::error::EngineError;

/// Everything a player needs to resume a session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub session: SessionRow,
    pub cmi: Value,
    pub interactions: Vec<InteractionRow>,
}

pub struct SessionRuntime {
    sessions: SessionRepo,
    records: RecordRepo,
    interactions: InteractionRepo,
    commits: CommitRepo,
}

impl SessionRuntime {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            records: RecordRepo::new(db.clone()),
            interactions: InteractionRepo::new(db.clone()),
            commits: CommitRepo::new(db),
        }
    }

    /// Create a new session under a fresh id.
    pub fn initialize(
        &self,
        package_id: &PackageId,
        learner_id: Option<&LearnerId>,
    ) -> Result<SessionId, EngineError> {
        let id = SessionId::new();
        self.initialize_with_id(&id, package_id, learner_id, Utc::now())?;
        Ok(id)
    }

    /// Create the session `id` and move it to `active`. Replaying an
    /// initialize that was already applied changes nothing and returns
    /// `false`.
    #[instrument(skip(self), fields(session_id = %id, package_id = %package_id))]
    pub fn initialize_with_id(
        &self,
        id: &SessionId,
        package_id: &PackageId,
        learner_id: Option<&LearnerId>,
        at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let created = self.sessions.create(id, package_id, learner_id, at)?;
        let row = self.sessions.get(id)?;
        let next = row.state.apply(LifecycleEvent::Initialize);
        if next != row.state {
            self.sessions.set_state(id, next, at)?;
        }
        if created {
            info!("session initialized");
        } else {
            debug!(state = %row.state, "initialize replayed on existing session");
        }
        Ok(created)
    }

    pub fn commit(&self, id: &SessionId, payload: &Value) -> Result<(), EngineError> {
        self.commit_at(id, payload, Utc::now())
    }

    /// Apply a commit recorded at `at`.
    ///
    /// The payload is validated and flattened before anything is written,
    /// and the whole commit is written in one transaction. Summary fields
    /// are merged unless the session is already terminated; records and
    /// interactions are always persisted.
    #[instrument(skip(self, payload), fields(session_id = %id))]
    pub fn commit_at(&self, id: &SessionId, payload: &Value, at: DateTime<Utc>) -> Result<(), EngineError> {
        self.apply_commit(id, payload, at, false)
    }

    pub fn terminate(&self, id: &SessionId, final_payload: &Value) -> Result<(), EngineError> {
        self.terminate_at(id, final_payload, Utc::now())
    }

    /// A non-empty payload is committed together with the state change.
    /// Terminating twice is a no-op.
    #[instrument(skip(self, final_payload), fields(session_id = %id))]
    pub fn terminate_at(
        &self,
        id: &SessionId,
        final_payload: &Value,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if has_content(final_payload) {
            return self.apply_commit(id, final_payload, at, true);
        }
        let row = self.sessions.get(id)?;
        let next = row.state.apply(LifecycleEvent::Terminate);
        if next != row.state {
            self.sessions.set_state(id, next, at)?;
            info!("session terminated");
        }
        Ok(())
    }

    fn apply_commit(
        &self,
        id: &SessionId,
        payload: &Value,
        at: DateTime<Utc>,
        terminate: bool,
    ) -> Result<(), EngineError> {
        let row = self.sessions.get(id)?;
        let root = cmi_root(payload);
        if !root.is_object() {
            return Err(EngineError::Validation(
                "commit payload must be a JSON object".into(),
            ));
        }

        let summary = SummaryUpdate::derive(payload);
        let flattened = cmi::flatten(root, "")?;
        let interactions = extract_interactions(payload);

        let mut next = row.state.apply(LifecycleEvent::Commit);
        if terminate {
            next = next.apply(LifecycleEvent::Terminate);
        }
        let write = CommitWrite {
            summary: (row.state.accepts_summary_updates() && !summary.is_empty()).then_some(&summary),
            records: &flattened,
            interactions: &interactions,
            state: (next != row.state).then_some(next),
        };
        let counts = self.commits.apply(id, &write, at)?;
        debug!(records = counts.records, interactions = counts.interactions, "commit applied");
        if terminate && next != row.state {
            info!("session terminated");
        }
        Ok(())
    }

    /// Session summary, rebuilt tree and interactions, or `None` for an
    /// unknown session. Touches the last-access time.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn load_initial_data(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, EngineError> {
        if !self.sessions.exists(id)? {
            return Ok(None);
        }
        self.sessions.touch(id, Utc::now())?;
        let session = self.sessions.get(id)?;
        let cmi = self.records.read_all(id)?.to_json();
        let interactions = self.interactions.list(id)?;
        Ok(Some(SessionSnapshot {
            session,
            cmi,
            interactions,
        }))
    }

    /// Write a single element. Goes through the commit path, so summary
    /// fields it touches are updated too.
    pub fn set_value(&self, id: &SessionId, path: &str, value: &str) -> Result<(), EngineError> {
        let payload = single_value_payload(path, value)?;
        self.commit(id, &payload)
    }

    pub fn get_value(&self, id: &SessionId, path: &str) -> Result<Option<String>, EngineError> {
        if !self.sessions.exists(id)? {
            return Err(EngineError::NotFound(format!("session {id}")));
        }
        Ok(self.records.read_latest(id, path)?)
    }

    pub fn session(&self, id: &SessionId) -> Result<SessionRow, EngineError> {
        Ok(self.sessions.get(id)?)
    }

    pub fn exists(&self, id: &SessionId) -> Result<bool, EngineError> {
        Ok(self.sessions.exists(id)?)
    }

    pub fn package_sessions(&self, package_id: &PackageId) -> Result<Vec<SessionRow>, EngineError> {
        Ok(self.sessions.list_by_package(package_id)?)
    }

    /// Remove every session of a package along with its records and
    /// interactions.
    #[instrument(skip(self), fields(package_id = %package_id))]
    pub fn delete_package_sessions(&self, package_id: &PackageId) -> Result<usize, EngineError> {
        let deleted = self.sessions.delete_by_package(package_id)?;
        info!(deleted, "package sessions deleted");
        Ok(deleted)
    }
}

/// The one-leaf commit payload that writes `value` at `path`.
pub fn single_value_payload(path: &str, value: &str) -> Result<Value, EngineError> {
    let mut tree = CmiNode::empty_object();
    tree.insert(path, value)?;
    Ok(tree.to_json())
}

fn has_content(payload: &Value) -> bool {
    match payload {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}
