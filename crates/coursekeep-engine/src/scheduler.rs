//! Timer-driven sync passes, owned by the composition root.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::processor::{SyncProcessor, TriggerOutcome};

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs [`SyncProcessor::trigger`] every `interval` while started.
///
/// Stopping cancels the timer only. A pass that is already running finishes
/// on its own; [`SyncScheduler::shutdown`] additionally waits for it.
pub struct SyncScheduler {
    processor: Arc<SyncProcessor>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl SyncScheduler {
    pub fn new(processor: Arc<SyncProcessor>, interval: Duration) -> Self {
        Self {
            processor,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn processor(&self) -> &Arc<SyncProcessor> {
        &self.processor
    }

    /// Start the timer. The first pass runs immediately. Returns `false` if
    /// the timer was already running. Must be called inside a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let processor = Arc::clone(&self.processor);
        let interval = self.interval;
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let TriggerOutcome::AlreadyInProgress = processor.trigger().await {
                            debug!("scheduled sync skipped, pass in progress");
                        }
                    }
                }
            }
            debug!("sync timer stopped");
        });

        *running = Some(Running { token, handle });
        info!(interval_secs = interval.as_secs(), "sync scheduler started");
        true
    }

    /// Stop scheduling new passes. Returns `false` if the timer was not
    /// running.
    pub fn stop(&self) -> bool {
        match self.running.lock().take() {
            Some(running) => {
                running.token.cancel();
                info!("sync scheduler stopped");
                true
            }
            None => false,
        }
    }

    /// Stop the timer and wait for an in-flight scheduled pass to finish.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.token.cancel();
            let _ = running.handle.await;
            info!("sync scheduler shut down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.token.is_cancelled())
    }

    /// Run one pass now, outside the timer.
    pub async fn trigger_once(&self) -> TriggerOutcome {
        self.processor.trigger().await
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.token.cancel();
        }
    }
}
