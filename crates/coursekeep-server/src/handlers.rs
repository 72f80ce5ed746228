//! Route handlers. Each one decodes its request, calls the tracking service
//! and wraps the result in the response envelope.

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use coursekeep_core::ids::{LearnerId, PackageId, SessionId};
use coursekeep_engine::service::{ActionReceipt, SyncStatus, UploadReceipt};
use coursekeep_engine::{SessionSnapshot, TriggerOutcome, UploadBatch};
use coursekeep_store::sessions::SessionRow;
use coursekeep_store::sync_queue::SyncEntry;
use coursekeep_telemetry::{LogQuery, LogRecord};

use crate::response::{ApiError, ApiResponse, ApiResult};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub pending: u64,
    pub scheduler_running: bool,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> ApiResult<HealthBody> {
    let status = state.service.status()?;
    Ok(ApiResponse::ok(HealthBody {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        pending: status.queue.pending,
        scheduler_running: status.scheduler_running,
    }))
}

// ── Sessions ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InitializeRequest {
    pub package_id: String,
    #[serde(default)]
    pub learner_id: Option<String>,
}

/// POST /api/sessions
pub async fn initialize(
    State(state): State<AppState>,
    body: Result<Json<InitializeRequest>, JsonRejection>,
) -> Result<(StatusCode, ApiResponse<ActionReceipt>), ApiError> {
    let Json(req) = body?;
    if req.package_id.trim().is_empty() {
        return Err(ApiError::validation("package_id is required"));
    }
    let package_id = PackageId::from_raw(req.package_id);
    let learner_id = req.learner_id.map(LearnerId::from_raw);

    let receipt = state
        .service
        .initialize(&package_id, learner_id.as_ref())
        .await?;
    Ok((accepted_or_created(&receipt), ApiResponse::ok(receipt)))
}

/// GET /api/sessions/{id}
pub async fn load_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SessionSnapshot> {
    let snapshot = state.service.load_initial_data(&SessionId::from_raw(id))?;
    Ok(ApiResponse::ok(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub data: Value,
}

/// POST /api/sessions/{id}/commit
pub async fn commit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<CommitRequest>, JsonRejection>,
) -> Result<(StatusCode, ApiResponse<ActionReceipt>), ApiError> {
    let Json(req) = body?;
    let receipt = state.service.commit(&SessionId::from_raw(id), &req.data).await?;
    Ok((applied_status(&receipt), ApiResponse::ok(receipt)))
}

/// POST /api/sessions/{id}/terminate
///
/// The body is optional; `{"data": {...}}` is committed before the session
/// is closed.
pub async fn terminate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, ApiResponse<ActionReceipt>), ApiError> {
    let data = optional_data(&body)?;
    let receipt = state.service.terminate(&SessionId::from_raw(id), &data).await?;
    Ok((applied_status(&receipt), ApiResponse::ok(receipt)))
}

#[derive(Debug, Deserialize)]
pub struct ValueQuery {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ValueBody {
    pub path: String,
    pub value: Option<String>,
}

/// GET /api/sessions/{id}/value?path=
pub async fn get_value(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<ValueQuery>, QueryRejection>,
) -> ApiResult<ValueBody> {
    let Query(q) = query?;
    let value = state.service.get_value(&SessionId::from_raw(id), &q.path)?;
    Ok(ApiResponse::ok(ValueBody { path: q.path, value }))
}

#[derive(Debug, Deserialize)]
pub struct SetValueRequest {
    pub path: String,
    pub value: Value,
}

/// PUT /api/sessions/{id}/value
pub async fn set_value(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<SetValueRequest>, JsonRejection>,
) -> Result<(StatusCode, ApiResponse<ActionReceipt>), ApiError> {
    let Json(req) = body?;
    let value = match req.value {
        Value::String(s) => s,
        v @ (Value::Number(_) | Value::Bool(_)) => v.to_string(),
        _ => return Err(ApiError::validation("value must be a string, number or boolean")),
    };
    let receipt = state
        .service
        .set_value(&SessionId::from_raw(id), &req.path, &value)
        .await?;
    Ok((applied_status(&receipt), ApiResponse::ok(receipt)))
}

// ── Packages ───────────────────────────────────────────────────────────

/// GET /api/packages/{id}/sessions
pub async fn package_sessions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<SessionRow>> {
    let sessions = state.service.package_sessions(&PackageId::from_raw(id))?;
    Ok(ApiResponse::ok(sessions))
}

/// DELETE /api/packages/{id}/sessions
pub async fn delete_package_sessions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let deleted = state.service.delete_package_sessions(&PackageId::from_raw(id))?;
    Ok(ApiResponse::ok(json!({ "deleted": deleted })))
}

// ── Sync ───────────────────────────────────────────────────────────────

/// POST /api/sync/upload
pub async fn upload(
    State(state): State<AppState>,
    body: Result<Json<UploadBatch>, JsonRejection>,
) -> Result<(StatusCode, ApiResponse<UploadReceipt>), ApiError> {
    let Json(batch) = body?;
    let receipt = state.service.upload(batch)?;
    Ok((StatusCode::ACCEPTED, ApiResponse::ok(receipt)))
}

/// GET /api/sync/status
pub async fn sync_status(State(state): State<AppState>) -> ApiResult<SyncStatus> {
    Ok(ApiResponse::ok(state.service.status()?))
}

/// POST /api/sync/trigger
pub async fn sync_trigger(State(state): State<AppState>) -> ApiResult<TriggerOutcome> {
    Ok(ApiResponse::ok(state.service.trigger().await))
}

/// POST /api/sync/start
pub async fn sync_start(State(state): State<AppState>) -> ApiResult<Value> {
    let started = state.service.start_scheduler();
    Ok(ApiResponse::ok(json!({ "started": started, "running": true })))
}

/// POST /api/sync/stop
pub async fn sync_stop(State(state): State<AppState>) -> ApiResult<Value> {
    let stopped = state.service.stop_scheduler();
    Ok(ApiResponse::ok(json!({ "stopped": stopped, "running": false })))
}

/// GET /api/sync/exhausted
pub async fn sync_exhausted(State(state): State<AppState>) -> ApiResult<Vec<SyncEntry>> {
    Ok(ApiResponse::ok(state.service.exhausted()?))
}

/// POST /api/sync/entries/{id}/retry
pub async fn retry_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<SyncEntry> {
    Ok(ApiResponse::ok(state.service.retry_entry(id)?))
}

// ── Logs ───────────────────────────────────────────────────────────────

/// GET /api/logs
pub async fn logs(
    State(state): State<AppState>,
    query: Result<Query<LogQuery>, QueryRejection>,
) -> ApiResult<Vec<LogRecord>> {
    let Query(q) = query?;
    let sink = state
        .log_sink
        .as_ref()
        .ok_or_else(|| ApiError::not_found("log persistence is disabled"))?;
    let records = sink
        .query(&q)
        .map_err(|e| ApiError::internal(format!("log query failed: {e}")))?;
    Ok(ApiResponse::ok(records))
}

/// GET /api/sync/entries/{id}/exhaustions
///
/// Every time the entry ran out of retries, newest first.
pub async fn entry_exhaustions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Vec<LogRecord>> {
    let sink = state
        .log_sink
        .as_ref()
        .ok_or_else(|| ApiError::not_found("log persistence is disabled"))?;
    let records = sink
        .exhausted_history(id)
        .map_err(|e| ApiError::internal(format!("log query failed: {e}")))?;
    Ok(ApiResponse::ok(records))
}

/// Queued-but-unapplied actions are reported as 202.
fn applied_status(receipt: &ActionReceipt) -> StatusCode {
    if receipt.applied {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    }
}

fn accepted_or_created(receipt: &ActionReceipt) -> StatusCode {
    if receipt.applied {
        StatusCode::CREATED
    } else {
        StatusCode::ACCEPTED
    }
}

/// `data` of an optional `{"data": ...}` body; an empty body is `null`.
fn optional_data(body: &[u8]) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    let parsed: Value = serde_json::from_slice(body)
        .map_err(|e| ApiError::validation(format!("invalid JSON body: {e}")))?;
    match parsed {
        Value::Object(mut map) => Ok(map.remove("data").unwrap_or(Value::Null)),
        _ => Err(ApiError::validation("body must be a JSON object")),
    }
}
