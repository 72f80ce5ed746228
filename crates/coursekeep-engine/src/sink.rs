//! Destinations the sync processor applies queued actions to.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use coursekeep_core::ids::{LearnerId, PackageId, SessionId};
use coursekeep_core::sync::ActionKind;

use crate::error::EngineError;
use crate::runtime::SessionRuntime;

/// One queued action as handed to a sink.
#[derive(Clone, Copy, Debug)]
pub struct SinkAction<'a> {
    pub session_id: &'a SessionId,
    pub package_id: &'a PackageId,
    pub payload: &'a Value,
    pub recorded_at: DateTime<Utc>,
}

/// Applies initialize/commit/terminate actions to a system of record.
#[async_trait]
pub trait SyncSink: Send + Sync {
    fn name(&self) -> &str;

    async fn apply_initialize(&self, action: SinkAction<'_>) -> Result<(), EngineError>;

    async fn apply_commit(&self, action: SinkAction<'_>) -> Result<(), EngineError>;

    async fn apply_terminate(&self, action: SinkAction<'_>) -> Result<(), EngineError>;

    /// Dispatch by action kind.
    async fn apply(&self, kind: ActionKind, action: SinkAction<'_>) -> Result<(), EngineError> {
        match kind {
            ActionKind::Initialize => self.apply_initialize(action).await,
            ActionKind::Commit => self.apply_commit(action).await,
            ActionKind::Terminate => self.apply_terminate(action).await,
        }
    }
}

/// Applies actions through the local session state machine.
pub struct LocalSink {
    runtime: Arc<SessionRuntime>,
}

impl LocalSink {
    pub fn new(runtime: Arc<SessionRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl SyncSink for LocalSink {
    fn name(&self) -> &str {
        "local"
    }

    async fn apply_initialize(&self, action: SinkAction<'_>) -> Result<(), EngineError> {
        let learner = action
            .payload
            .get("learner_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(LearnerId::from_raw);
        self.runtime
            .initialize_with_id(action.session_id, action.package_id, learner.as_ref(), action.recorded_at)
            .map(|_| ())
    }

    async fn apply_commit(&self, action: SinkAction<'_>) -> Result<(), EngineError> {
        self.runtime
            .commit_at(action.session_id, action.payload, action.recorded_at)
    }

    async fn apply_terminate(&self, action: SinkAction<'_>) -> Result<(), EngineError> {
        self.runtime
            .terminate_at(action.session_id, action.payload, action.recorded_at)
    }
}

/// Forwards actions to an upstream system of record over HTTP.
///
/// Each action is `POST {base_url}/{initialize|commit|terminate}` with body
/// `{session_id, package_id, payload, recorded_at}`. Any non-2xx status is a
/// sink failure and the entry is retried.
pub struct HttpSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSink {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("coursekeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Sink(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, kind: ActionKind, action: SinkAction<'_>) -> Result<(), EngineError> {
        let url = format!("{}/{kind}", self.base_url);
        let body = json!({
            "session_id": action.session_id,
            "package_id": action.package_id,
            "payload": action.payload,
            "recorded_at": action.recorded_at,
        });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Sink(format!("{kind} request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let detail: String = text.chars().take(200).collect();
        Err(EngineError::Sink(format!("upstream returned {status} for {kind}: {detail}")))
    }
}

#[async_trait]
impl SyncSink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn apply_initialize(&self, action: SinkAction<'_>) -> Result<(), EngineError> {
        self.post(ActionKind::Initialize, action).await
    }

    async fn apply_commit(&self, action: SinkAction<'_>) -> Result<(), EngineError> {
        self.post(ActionKind::Commit, action).await
    }

    async fn apply_terminate(&self, action: SinkAction<'_>) -> Result<(), EngineError> {
        self.post(ActionKind::Terminate, action).await
    }
}
