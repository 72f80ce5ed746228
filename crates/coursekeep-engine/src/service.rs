//! Online and offline entry points.
//!
//! Every state-changing call is enqueued first and then applied by the sync
//! processor: online calls drain the queue before returning, uploads drain in
//! the background. Reads go straight to the session runtime.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument};

use coursekeep_core::cmi;
use coursekeep_core::ids::{LearnerId, PackageId, SessionId};
use coursekeep_core::summary::cmi_root;
use coursekeep_core::sync::ActionKind;
use coursekeep_store::sessions::SessionRow;
use coursekeep_store::sync_queue::{QueueStatus, SyncEntry, SyncQueueRepo};
use coursekeep_store::Database;

use crate::error::EngineError;
use crate::processor::TriggerOutcome;
use crate::registry::PackageRegistry;
use crate::runtime::{single_value_payload, SessionRuntime, SessionSnapshot};
use crate::scheduler::SyncScheduler;
use crate::upload::UploadBatch;

/// Result of an online action.
#[derive(Clone, Debug, Serialize)]
pub struct ActionReceipt {
    pub session_id: SessionId,
    pub entry_id: i64,
    /// Whether the action was applied before returning. Only the session's
    /// own queue is drained for this, so `false` means this action or an
    /// earlier one of the same session failed or is backing off. The action
    /// stays queued and is retried; `error` is set when it failed itself.
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UploadReceipt {
    pub session_id: SessionId,
    pub accepted: usize,
    pub entry_ids: Vec<i64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncStatus {
    #[serde(flatten)]
    pub queue: QueueStatus,
    pub processing: bool,
    pub scheduler_running: bool,
    pub sink: String,
    pub max_retries: u32,
}

pub struct TrackingService {
    runtime: Arc<SessionRuntime>,
    queue: SyncQueueRepo,
    scheduler: Arc<SyncScheduler>,
    registry: Arc<dyn PackageRegistry>,
    max_upload_actions: usize,
}

impl TrackingService {
    pub fn new(
        db: Database,
        runtime: Arc<SessionRuntime>,
        scheduler: Arc<SyncScheduler>,
        registry: Arc<dyn PackageRegistry>,
        max_upload_actions: usize,
    ) -> Self {
        Self {
            runtime,
            queue: SyncQueueRepo::new(db),
            scheduler,
            registry,
            max_upload_actions,
        }
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    /// Start a session for a known package. The id is chosen here so the
    /// queued initialize replays onto the same session.
    #[instrument(skip(self), fields(package_id = %package_id))]
    pub async fn initialize(
        &self,
        package_id: &PackageId,
        learner_id: Option<&LearnerId>,
    ) -> Result<ActionReceipt, EngineError> {
        if !self.registry.exists(package_id) {
            return Err(EngineError::NotFound(format!("package {package_id}")));
        }
        let session_id = SessionId::new();
        let payload = json!({ "learner_id": learner_id });
        self.enqueue_and_drain(&session_id, package_id, ActionKind::Initialize, &payload)
            .await
    }

    #[instrument(skip(self, payload), fields(session_id = %session_id))]
    pub async fn commit(&self, session_id: &SessionId, payload: &Value) -> Result<ActionReceipt, EngineError> {
        let package_id = self.known_package(session_id)?;
        validate_tree(payload)?;
        self.enqueue_and_drain(session_id, &package_id, ActionKind::Commit, payload)
            .await
    }

    #[instrument(skip(self, payload), fields(session_id = %session_id))]
    pub async fn terminate(&self, session_id: &SessionId, payload: &Value) -> Result<ActionReceipt, EngineError> {
        let package_id = self.known_package(session_id)?;
        if !payload.is_null() {
            validate_tree(payload)?;
        }
        self.enqueue_and_drain(session_id, &package_id, ActionKind::Terminate, payload)
            .await
    }

    /// Single-element write, queued as a one-leaf commit.
    pub async fn set_value(
        &self,
        session_id: &SessionId,
        path: &str,
        value: &str,
    ) -> Result<ActionReceipt, EngineError> {
        let payload = single_value_payload(path, value)?;
        self.commit(session_id, &payload).await
    }

    pub fn get_value(&self, session_id: &SessionId, path: &str) -> Result<Option<String>, EngineError> {
        self.runtime.get_value(session_id, path)
    }

    pub fn load_initial_data(&self, session_id: &SessionId) -> Result<SessionSnapshot, EngineError> {
        self.runtime
            .load_initial_data(session_id)?
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
    }

    pub fn package_sessions(&self, package_id: &PackageId) -> Result<Vec<SessionRow>, EngineError> {
        self.runtime.package_sessions(package_id)
    }

    pub fn delete_package_sessions(&self, package_id: &PackageId) -> Result<usize, EngineError> {
        self.runtime.delete_package_sessions(package_id)
    }

    /// Queue an offline batch atomically and start a pass in the background.
    #[instrument(skip(self, batch), fields(session_id = %batch.session_id, actions = batch.actions.len()))]
    pub fn upload(&self, batch: UploadBatch) -> Result<UploadReceipt, EngineError> {
        let session_id = SessionId::from_raw(batch.session_id.clone());
        let entries = batch.into_entries(self.max_upload_actions)?;
        if let Some(first) = entries.first() {
            let initializes = entries.iter().any(|e| e.kind == ActionKind::Initialize);
            if initializes && !self.registry.exists(&first.package_id) {
                return Err(EngineError::NotFound(format!("package {}", first.package_id)));
            }
        }

        let entry_ids = self.queue.enqueue_batch(&entries)?;
        info!(accepted = entry_ids.len(), "offline batch queued");

        let processor = Arc::clone(self.scheduler.processor());
        tokio::spawn(async move {
            processor.drain_now().await;
        });

        Ok(UploadReceipt {
            session_id,
            accepted: entry_ids.len(),
            entry_ids,
        })
    }

    pub fn status(&self) -> Result<SyncStatus, EngineError> {
        let processor = self.scheduler.processor();
        let max_retries = processor.config().max_retries;
        Ok(SyncStatus {
            queue: self.queue.status(max_retries)?,
            processing: processor.is_processing(),
            scheduler_running: self.scheduler.is_running(),
            sink: processor.sink_name().to_string(),
            max_retries,
        })
    }

    pub async fn trigger(&self) -> TriggerOutcome {
        self.scheduler.trigger_once().await
    }

    pub fn start_scheduler(&self) -> bool {
        self.scheduler.start()
    }

    pub fn stop_scheduler(&self) -> bool {
        self.scheduler.stop()
    }

    pub fn exhausted(&self) -> Result<Vec<SyncEntry>, EngineError> {
        let max_retries = self.scheduler.processor().config().max_retries;
        Ok(self.queue.exhausted(max_retries)?)
    }

    /// Re-arm a pending entry so the next pass retries it.
    #[instrument(skip(self))]
    pub fn retry_entry(&self, entry_id: i64) -> Result<SyncEntry, EngineError> {
        if !self.queue.reset_retries(entry_id, Utc::now())? {
            let entry = self.queue.get(entry_id)?;
            return Err(EngineError::Validation(format!(
                "sync entry {} is already synced",
                entry.id
            )));
        }
        info!("sync entry re-armed");
        Ok(self.queue.get(entry_id)?)
    }

    /// Package of a session that exists locally or has a queued initialize.
    fn known_package(&self, session_id: &SessionId) -> Result<PackageId, EngineError> {
        match self.runtime.session(session_id) {
            Ok(row) => return Ok(row.package_id),
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.queue
            .initialized_package(session_id)?
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
    }

    async fn enqueue_and_drain(
        &self,
        session_id: &SessionId,
        package_id: &PackageId,
        kind: ActionKind,
        payload: &Value,
    ) -> Result<ActionReceipt, EngineError> {
        let entry_id = self.queue.enqueue(session_id, package_id, kind, payload, None)?;
        let processor = self.scheduler.processor();
        let entry = loop {
            let report = processor.drain_session_now(session_id).await;
            let entry = self.queue.get(entry_id)?;
            // A session with more than one batch of pending entries needs
            // several passes; stop as soon as one makes no progress.
            if entry.synced || report.synced == 0 || report.failed > 0 {
                break entry;
            }
        };
        Ok(ActionReceipt {
            session_id: session_id.clone(),
            entry_id,
            applied: entry.synced,
            error: entry.last_error,
        })
    }
}

/// Reject payloads that could never be applied, before they are queued.
fn validate_tree(payload: &Value) -> Result<(), EngineError> {
    let root = cmi_root(payload);
    if !root.is_object() {
        return Err(EngineError::Validation("payload must be a JSON object".into()));
    }
    cmi::flatten(root, "")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use coursekeep_core::SessionState;

    use crate::processor::{ProcessorConfig, SyncProcessor};
    use crate::registry::OpenRegistry;
    use crate::sink::{LocalSink, SinkAction, SyncSink};

    fn local_service(db: &Database) -> TrackingService {
        let runtime = Arc::new(SessionRuntime::new(db.clone()));
        let sink = Arc::new(LocalSink::new(runtime.clone()));
        let processor = Arc::new(SyncProcessor::new(db.clone(), sink, ProcessorConfig::default()));
        let scheduler = Arc::new(SyncScheduler::new(processor, Duration::from_secs(60)));
        TrackingService::new(db.clone(), runtime, scheduler, Arc::new(OpenRegistry), 100)
    }

    struct ClosedRegistry;

    impl PackageRegistry for ClosedRegistry {
        fn exists(&self, _package_id: &PackageId) -> bool {
            false
        }
    }

    struct FlakySink {
        fail: parking_lot::Mutex<bool>,
    }

    #[async_trait]
    impl SyncSink for FlakySink {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn apply_initialize(&self, _action: SinkAction<'_>) -> Result<(), EngineError> {
            if *self.fail.lock() {
                return Err(EngineError::Sink("upstream down".into()));
            }
            Ok(())
        }
        async fn apply_commit(&self, action: SinkAction<'_>) -> Result<(), EngineError> {
            self.apply_initialize(action).await
        }
        async fn apply_terminate(&self, action: SinkAction<'_>) -> Result<(), EngineError> {
            self.apply_initialize(action).await
        }
    }

    #[tokio::test]
    async fn online_lifecycle_goes_through_queue() {
        let db = Database::in_memory().unwrap();
        let service = local_service(&db);

        let init = service
            .initialize(&PackageId::from_raw("golf-101"), Some(&LearnerId::from_raw("l1")))
            .await
            .unwrap();
        assert!(init.applied);
        let session = init.session_id;

        let commit = service
            .commit(&session, &json!({"completion_status": "completed", "score": {"raw": 85}}))
            .await
            .unwrap();
        assert!(commit.applied);

        service.set_value(&session, "location", "page-9").await.unwrap();
        assert_eq!(service.get_value(&session, "location").unwrap().as_deref(), Some("page-9"));

        service.terminate(&session, &Value::Null).await.unwrap();

        let snapshot = service.load_initial_data(&session).unwrap();
        assert_eq!(snapshot.session.state, SessionState::Terminated);
        assert!(snapshot.session.completed);
        assert_eq!(snapshot.session.score_raw, Some(85.0));
        assert_eq!(snapshot.session.location.as_deref(), Some("page-9"));

        let status = service.status().unwrap();
        assert_eq!(status.queue.pending, 0);
        assert_eq!(status.queue.synced, 4);
        assert_eq!(status.sink, "local");
    }

    #[tokio::test]
    async fn commit_unknown_session_is_not_found() {
        let db = Database::in_memory().unwrap();
        let service = local_service(&db);
        let err = service
            .commit(&SessionId::from_raw("sess_ghost"), &json!({"location": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(service.status().unwrap().queue.pending, 0);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_queueing() {
        let db = Database::in_memory().unwrap();
        let service = local_service(&db);
        let init = service.initialize(&PackageId::from_raw("p"), None).await.unwrap();

        assert!(matches!(
            service.commit(&init.session_id, &json!("just a string")).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            service.set_value(&init.session_id, "a..b", "x").await,
            Err(EngineError::Validation(_))
        ));
        assert_eq!(service.status().unwrap().queue.synced, 1);
    }

    #[tokio::test]
    async fn out_of_range_index_is_rejected_before_queueing() {
        let db = Database::in_memory().unwrap();
        let service = local_service(&db);
        let init = service.initialize(&PackageId::from_raw("p"), None).await.unwrap();

        let err = service
            .commit(
                &init.session_id,
                &json!({"completion_status": "completed", "objectives": {"100000": "x"}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("out of range")));

        let status = service.status().unwrap();
        assert_eq!(status.queue.pending, 0);
        assert_eq!(status.queue.synced, 1);
        let snapshot = service.load_initial_data(&init.session_id).unwrap();
        assert!(!snapshot.session.completed);
        assert_eq!(snapshot.cmi, json!({}));
    }

    fn small_batch_service(db: &Database) -> TrackingService {
        let runtime = Arc::new(SessionRuntime::new(db.clone()));
        let sink = Arc::new(LocalSink::new(runtime.clone()));
        let config = ProcessorConfig {
            batch_size: 2,
            backoff_base: Duration::ZERO,
            ..ProcessorConfig::default()
        };
        let processor = Arc::new(SyncProcessor::new(db.clone(), sink, config));
        let scheduler = Arc::new(SyncScheduler::new(processor, Duration::from_secs(60)));
        TrackingService::new(db.clone(), runtime, scheduler, Arc::new(OpenRegistry), 100)
    }

    fn queue_raw(db: &Database, session: &str, kind: ActionKind, payload: Value) -> i64 {
        SyncQueueRepo::new(db.clone())
            .enqueue(
                &SessionId::from_raw(session),
                &PackageId::from_raw("p"),
                kind,
                &payload,
                None,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn online_action_is_not_crowded_out_by_other_sessions() {
        let db = Database::in_memory().unwrap();
        let service = small_batch_service(&db);
        let stuck: Vec<i64> = (0..3)
            .map(|n| queue_raw(&db, &format!("sess_stuck_{n}"), ActionKind::Commit, json!({})))
            .collect();

        let init = service.initialize(&PackageId::from_raw("p"), None).await.unwrap();
        assert!(init.applied);
        let commit = service
            .commit(&init.session_id, &json!({"location": "p2"}))
            .await
            .unwrap();
        assert!(commit.applied);

        // Other sessions' entries were not attempted on the online path.
        let queue = SyncQueueRepo::new(db);
        for id in stuck {
            assert_eq!(queue.get(id).unwrap().retry_count, 0);
        }
    }

    #[tokio::test]
    async fn online_action_behind_long_session_backlog_is_applied() {
        let db = Database::in_memory().unwrap();
        let service = small_batch_service(&db);
        queue_raw(&db, "sess_backlog", ActionKind::Initialize, json!({}));
        queue_raw(&db, "sess_backlog", ActionKind::Commit, json!({"location": "p1"}));
        queue_raw(&db, "sess_backlog", ActionKind::Commit, json!({"location": "p2"}));

        let id = SessionId::from_raw("sess_backlog");
        let receipt = service.commit(&id, &json!({"location": "p3"})).await.unwrap();
        assert!(receipt.applied);
        assert_eq!(service.get_value(&id, "location").unwrap().as_deref(), Some("p3"));
        assert_eq!(service.status().unwrap().queue.pending, 0);
    }

    #[tokio::test]
    async fn unknown_package_is_not_found() {
        let db = Database::in_memory().unwrap();
        let runtime = Arc::new(SessionRuntime::new(db.clone()));
        let sink = Arc::new(LocalSink::new(runtime.clone()));
        let processor = Arc::new(SyncProcessor::new(db.clone(), sink, ProcessorConfig::default()));
        let scheduler = Arc::new(SyncScheduler::new(processor, Duration::from_secs(60)));
        let service = TrackingService::new(db, runtime, scheduler, Arc::new(ClosedRegistry), 100);

        let err = service.initialize(&PackageId::from_raw("nope"), None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(ref m) if m.contains("package")));
    }

    #[tokio::test]
    async fn failed_online_action_stays_queued() {
        let db = Database::in_memory().unwrap();
        let runtime = Arc::new(SessionRuntime::new(db.clone()));
        let sink = Arc::new(FlakySink {
            fail: parking_lot::Mutex::new(true),
        });
        let config = ProcessorConfig {
            backoff_base: Duration::ZERO,
            ..ProcessorConfig::default()
        };
        let processor = Arc::new(SyncProcessor::new(db.clone(), sink.clone(), config));
        let scheduler = Arc::new(SyncScheduler::new(processor, Duration::from_secs(60)));
        let service = TrackingService::new(db, runtime, scheduler, Arc::new(OpenRegistry), 100);

        let receipt = service.initialize(&PackageId::from_raw("p"), None).await.unwrap();
        assert!(!receipt.applied);
        assert_eq!(receipt.error.as_deref(), Some("sink error: upstream down"));

        // The session is addressable through its queued initialize.
        let commit = service
            .commit(&receipt.session_id, &json!({"location": "p1"}))
            .await
            .unwrap();
        assert!(!commit.applied);
        assert_eq!(service.status().unwrap().queue.pending, 2);

        *sink.fail.lock() = false;
        match service.trigger().await {
            TriggerOutcome::Completed(report) => assert_eq!(report.synced, 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(service.status().unwrap().queue.pending, 0);
    }

    #[tokio::test]
    async fn upload_then_trigger_drains_everything() {
        let db = Database::in_memory().unwrap();
        let service = local_service(&db);

        let batch: UploadBatch = serde_json::from_value(json!({
            "session_id": "sess_offline_1",
            "package_id": "golf-101",
            "actions": [
                {"kind": "initialize", "payload": {"learner_id": "l9"}, "timestamp": "2024-03-01T10:00:00Z"},
                {"kind": "commit", "payload": {"core": {"lesson_status": "passed"}}, "timestamp": "2024-03-01T10:05:00Z"},
                {"kind": "terminate", "timestamp": "2024-03-01T10:06:00Z"}
            ]
        }))
        .unwrap();

        let receipt = service.upload(batch).unwrap();
        assert_eq!(receipt.accepted, 3);
        // The background pass has not run yet on this single-threaded runtime.
        assert_eq!(service.status().unwrap().queue.pending, 3);

        service.scheduler().processor().drain_now().await;
        let status = service.status().unwrap();
        assert_eq!(status.queue.pending, 0);
        assert_eq!(status.queue.synced, 3);

        let snapshot = service
            .load_initial_data(&SessionId::from_raw("sess_offline_1"))
            .unwrap();
        assert_eq!(snapshot.session.state, SessionState::Terminated);
        assert!(snapshot.session.completed);
        assert_eq!(snapshot.session.created_at, "2024-03-01T10:00:00.000000Z");
    }

    #[tokio::test]
    async fn upload_rejects_oversized_batch() {
        let db = Database::in_memory().unwrap();
        let runtime = Arc::new(SessionRuntime::new(db.clone()));
        let sink = Arc::new(LocalSink::new(runtime.clone()));
        let processor = Arc::new(SyncProcessor::new(db.clone(), sink, ProcessorConfig::default()));
        let scheduler = Arc::new(SyncScheduler::new(processor, Duration::from_secs(60)));
        let service = TrackingService::new(db, runtime, scheduler, Arc::new(OpenRegistry), 2);

        let batch: UploadBatch = serde_json::from_value(json!({
            "session_id": "s", "package_id": "p",
            "actions": [{"kind": "commit"}, {"kind": "commit"}, {"kind": "commit"}]
        }))
        .unwrap();
        assert!(matches!(service.upload(batch), Err(EngineError::Capacity(_))));
        assert_eq!(service.status().unwrap().queue.pending, 0);
    }

    #[tokio::test]
    async fn retry_entry_rearms_exhausted_entry() {
        let db = Database::in_memory().unwrap();
        let runtime = Arc::new(SessionRuntime::new(db.clone()));
        let sink = Arc::new(FlakySink {
            fail: parking_lot::Mutex::new(true),
        });
        let config = ProcessorConfig {
            max_retries: 1,
            backoff_base: Duration::ZERO,
            ..ProcessorConfig::default()
        };
        let processor = Arc::new(SyncProcessor::new(db.clone(), sink.clone(), config));
        let scheduler = Arc::new(SyncScheduler::new(processor, Duration::from_secs(60)));
        let service = TrackingService::new(db, runtime, scheduler, Arc::new(OpenRegistry), 100);

        let receipt = service.initialize(&PackageId::from_raw("p"), None).await.unwrap();
        let exhausted = service.exhausted().unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].id, receipt.entry_id);

        *sink.fail.lock() = false;
        let entry = service.retry_entry(receipt.entry_id).unwrap();
        assert_eq!(entry.retry_count, 0);
        service.trigger().await;
        assert!(service.exhausted().unwrap().is_empty());

        assert!(matches!(
            service.retry_entry(receipt.entry_id),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(service.retry_entry(4242), Err(EngineError::NotFound(_))));
    }
}
