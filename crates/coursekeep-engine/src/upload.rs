//! Offline action batches uploaded by clients that were disconnected.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use coursekeep_core::ids::{PackageId, SessionId};
use coursekeep_core::sync::ActionKind;
use coursekeep_store::sync_queue::NewSyncEntry;

use crate::error::EngineError;

/// `{session_id, package_id, actions: [{kind, payload, timestamp}]}`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UploadBatch {
    pub session_id: String,
    pub package_id: String,
    #[serde(default)]
    pub actions: Vec<UploadAction>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UploadAction {
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// RFC 3339 string or epoch milliseconds. Defaults to arrival time.
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl UploadBatch {
    /// Check the batch and turn it into queue entries, in upload order.
    pub fn into_entries(self, max_actions: usize) -> Result<Vec<NewSyncEntry>, EngineError> {
        if self.session_id.trim().is_empty() {
            return Err(EngineError::Validation("session_id is required".into()));
        }
        if self.package_id.trim().is_empty() {
            return Err(EngineError::Validation("package_id is required".into()));
        }
        if self.actions.is_empty() {
            return Err(EngineError::Validation("actions must not be empty".into()));
        }
        if self.actions.len() > max_actions {
            return Err(EngineError::Capacity(format!(
                "{} actions in batch, limit is {max_actions}",
                self.actions.len()
            )));
        }

        let session_id = SessionId::from_raw(self.session_id);
        let package_id = PackageId::from_raw(self.package_id);
        self.actions
            .into_iter()
            .enumerate()
            .map(|(index, action)| {
                let kind: ActionKind = action
                    .kind
                    .parse()
                    .map_err(|e: String| EngineError::Validation(format!("actions[{index}]: {e}")))?;
                let payload = match action.payload {
                    Value::Null => Value::Object(Default::default()),
                    obj @ Value::Object(_) => obj,
                    _ => {
                        return Err(EngineError::Validation(format!(
                            "actions[{index}]: payload must be an object"
                        )))
                    }
                };
                let recorded_at = action
                    .timestamp
                    .as_ref()
                    .map(|ts| parse_timestamp(ts).ok_or_else(|| {
                        EngineError::Validation(format!("actions[{index}]: invalid timestamp {ts}"))
                    }))
                    .transpose()?;
                Ok(NewSyncEntry {
                    session_id: session_id.clone(),
                    package_id: package_id.clone(),
                    kind,
                    payload,
                    recorded_at,
                })
            })
            .collect()
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        _ => None,
    }
}
