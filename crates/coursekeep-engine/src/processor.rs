//! Batch drain of the sync queue.
//!
//! - At most one pass runs at a time (single-flight `tokio::sync::Mutex`)
//! - Each sink call is bounded by `sink_timeout`
//! - Failures become retry increments with exponential backoff, never errors
//!   for the caller
//! - Once an entry of a session fails, the session's later entries in the
//!   same pass are deferred so actions are never applied out of order
//! - An initialize is never deferred. When it succeeds, the session's
//!   earlier unsynced entries are re-armed, since they may have failed only
//!   because the session did not exist yet

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use coursekeep_core::ids::SessionId;
use coursekeep_core::sync::ActionKind;
use coursekeep_settings::SyncSettings;
use coursekeep_store::sync_queue::{SyncEntry, SyncQueueRepo};
use coursekeep_store::Database;

use crate::error::EngineError;
use crate::sink::{SinkAction, SyncSink};

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub batch_size: u32,
    pub max_retries: u32,
    pub sink_timeout: Duration,
    /// First retry delay. Zero makes a failed entry eligible on the next pass.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for ProcessorConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            max_retries: settings.max_retries,
            sink_timeout: Duration::from_millis(settings.sink_timeout_ms),
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
        }
    }
}

/// Outcome counts of one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub attempted: u32,
    pub synced: u32,
    pub failed: u32,
    /// Entries skipped because an earlier entry of their session failed.
    pub deferred: u32,
    /// Entries that reached the retry limit during this pass.
    pub exhausted: Vec<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Completed(PassReport),
    AlreadyInProgress,
}

/// Delay before attempt `attempt + 1`, given `attempt` failures so far:
/// `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }
    let shift = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << shift).min(max)
}

pub struct SyncProcessor {
    queue: SyncQueueRepo,
    sink: Arc<dyn SyncSink>,
    config: ProcessorConfig,
    guard: Mutex<()>,
    processing: AtomicBool,
}

impl SyncProcessor {
    pub fn new(db: Database, sink: Arc<dyn SyncSink>, config: ProcessorConfig) -> Self {
        Self {
            queue: SyncQueueRepo::new(db),
            sink,
            config,
            guard: Mutex::new(()),
            processing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }

    /// Whether a pass is running right now.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// Run a pass unless one is already running.
    pub async fn trigger(&self) -> TriggerOutcome {
        match self.guard.try_lock() {
            Ok(_guard) => TriggerOutcome::Completed(self.run_pass(None).await),
            Err(_) => {
                debug!("sync pass already in progress");
                TriggerOutcome::AlreadyInProgress
            }
        }
    }

    /// Wait for any running pass, then run one. Used on the online path so a
    /// freshly enqueued action is applied before the response is sent.
    pub async fn drain_now(&self) -> PassReport {
        let _guard = self.guard.lock().await;
        self.run_pass(None).await
    }

    /// [`drain_now`](Self::drain_now) over one session's entries only, so a
    /// backlog of other sessions cannot crowd the caller's action out of the
    /// batch.
    pub async fn drain_session_now(&self, session_id: &SessionId) -> PassReport {
        let _guard = self.guard.lock().await;
        self.run_pass(Some(session_id)).await
    }

    #[instrument(skip(self, scope), fields(sink = self.sink.name(), session_id = scope.map(SessionId::as_str)))]
    async fn run_pass(&self, scope: Option<&SessionId>) -> PassReport {
        let report = {
            let _flag = ProcessingFlag::raise(&self.processing);
            self.drain_batch(scope, Utc::now()).await
        };

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                deferred = report.deferred,
                "sync pass complete"
            );
        }
        report
    }

    async fn drain_batch(&self, scope: Option<&SessionId>, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();
        let (limit, max_retries) = (self.config.batch_size, self.config.max_retries);
        let dequeued = match scope {
            Some(session_id) => self.queue.dequeue_session(session_id, limit, max_retries, now),
            None => self.queue.dequeue_batch(limit, max_retries, now),
        };
        let entries = match dequeued {
            Ok(entries) => entries,
            Err(error) => {
                warn!(%error, "failed to read sync queue");
                return report;
            }
        };

        let mut blocked: HashSet<SessionId> = HashSet::new();
        for entry in entries {
            let is_initialize = entry.kind == ActionKind::Initialize;
            if !is_initialize && blocked.contains(&entry.session_id) {
                report.deferred += 1;
                continue;
            }
            report.attempted += 1;

            match self.apply(&entry).await {
                Ok(()) => {
                    match self.queue.mark_synced(entry.id, Utc::now()) {
                        Ok(true) => report.synced += 1,
                        Ok(false) => debug!(entry_id = entry.id, "sync entry was already synced"),
                        Err(error) => warn!(entry_id = entry.id, %error, "failed to mark sync entry synced"),
                    }
                    if is_initialize && self.rearm_earlier(&entry) > 0 {
                        // Re-armed entries run next pass; nothing later may overtake them.
                        let _ = blocked.insert(entry.session_id.clone());
                    }
                }
                Err(error) => {
                    report.failed += 1;
                    let _ = blocked.insert(entry.session_id.clone());
                    if self.record_failure(&entry, &error) {
                        report.exhausted.push(entry.id);
                    }
                }
            }
        }
        report
    }

    async fn apply(&self, entry: &SyncEntry) -> Result<(), EngineError> {
        let recorded_at = DateTime::parse_from_rfc3339(&entry.recorded_at)
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let action = SinkAction {
            session_id: &entry.session_id,
            package_id: &entry.package_id,
            payload: &entry.payload,
            recorded_at,
        };

        match tokio::time::timeout(self.config.sink_timeout, self.sink.apply(entry.kind, action)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(EngineError::Sink(format!(
                "{} sink timed out after {:?}",
                self.sink.name(),
                self.config.sink_timeout
            ))),
        }
    }

    fn rearm_earlier(&self, entry: &SyncEntry) -> usize {
        match self.queue.rearm_earlier(entry, Utc::now()) {
            Ok(0) => 0,
            Ok(rearmed) => {
                info!(
                    entry_id = entry.id,
                    session_id = %entry.session_id,
                    rearmed,
                    "re-armed entries queued before initialize"
                );
                rearmed
            }
            Err(error) => {
                warn!(entry_id = entry.id, %error, "failed to re-arm earlier sync entries");
                0
            }
        }
    }

    /// Returns `true` when the entry has now exhausted its retries.
    fn record_failure(&self, entry: &SyncEntry, error: &EngineError) -> bool {
        let attempt = entry.retry_count + 1;
        let delay = backoff_delay(self.config.backoff_base, self.config.backoff_max, attempt);
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        match self.queue.increment_retry(entry.id, &error.to_string(), next_attempt_at) {
            Ok(retries) if retries >= self.config.max_retries => {
                warn!(
                    entry_id = entry.id,
                    session_id = %entry.session_id,
                    kind = %entry.kind,
                    retries,
                    %error,
                    "sync entry exhausted"
                );
                true
            }
            Ok(retries) => {
                warn!(
                    entry_id = entry.id,
                    session_id = %entry.session_id,
                    kind = %entry.kind,
                    retries,
                    retry_in_ms = delay.as_millis() as u64,
                    %error,
                    "sync entry failed"
                );
                false
            }
            Err(store_error) => {
                warn!(entry_id = entry.id, error = %store_error, "failed to record sync failure");
                false
            }
        }
    }
}

/// Clears the processing flag even if the pass future is dropped.
struct ProcessingFlag<'a>(&'a AtomicBool);

impl<'a> ProcessingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ProcessingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
