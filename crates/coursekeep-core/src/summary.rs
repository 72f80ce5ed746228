//! Session summary derivation from commit payloads.
//!
//! Two payload shapes are understood. The newer, namespaced shape keeps
//! status fields at the top level (`completion_status`, `success_status`,
//! `score.raw`, `session_time`, ...). The older shape nests them under
//! `core` (`core.lesson_status`, `core.score.raw`, `core.session_time`, ...).
//! Per field, the newer shape wins whenever it is present. A payload wrapped
//! as `{"cmi": {...}}` is read from the inner object.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessStatus {
    Passed,
    Failed,
    Completed,
    Incomplete,
    Unknown,
}

impl std::fmt::Display for SuccessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Completed => write!(f, "completed"),
            Self::Incomplete => write!(f, "incomplete"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for SuccessStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "incomplete" => Ok(Self::Incomplete),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown success status: {other}")),
        }
    }
}

/// Summary fields carried by one commit. `None` means "not present in the
/// payload": the stored value is kept.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SummaryUpdate {
    pub completed: Option<bool>,
    pub success_status: Option<SuccessStatus>,
    pub score_raw: Option<f64>,
    pub score_min: Option<f64>,
    pub score_max: Option<f64>,
    pub session_time: Option<String>,
    pub total_time: Option<String>,
    pub suspend_data: Option<String>,
    pub location: Option<String>,
}

impl SummaryUpdate {
    pub fn derive(payload: &Value) -> Self {
        let root = cmi_root(payload);
        let core = root.get("core");

        let completion = text(root.get("completion_status"));
        let success = text(root.get("success_status"));
        let lesson_status = text(core.and_then(|c| c.get("lesson_status")));

        let completed = match (&completion, &lesson_status) {
            (None, None) => None,
            (c, l) => Some(
                c.as_deref() == Some("completed")
                    || matches!(l.as_deref(), Some("completed" | "passed")),
            ),
        };

        Self {
            completed,
            success_status: derive_success(
                success.as_deref(),
                completion.as_deref(),
                lesson_status.as_deref(),
            ),
            score_raw: score_field(root, core, "raw"),
            score_min: score_field(root, core, "min"),
            score_max: score_field(root, core, "max"),
            session_time: prefer(root, core, "session_time", "session_time"),
            total_time: prefer(root, core, "total_time", "total_time"),
            suspend_data: text(root.get("suspend_data")),
            location: prefer(root, core, "location", "lesson_location"),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Unwrap `{"cmi": {...}}` payloads.
pub fn cmi_root(payload: &Value) -> &Value {
    match payload.get("cmi") {
        Some(inner) if inner.is_object() => inner,
        _ => payload,
    }
}

fn derive_success(
    success: Option<&str>,
    completion: Option<&str>,
    lesson_status: Option<&str>,
) -> Option<SuccessStatus> {
    if success.is_none() && completion.is_none() && lesson_status.is_none() {
        return None;
    }
    let status = match (success, completion, lesson_status) {
        (Some("passed"), _, _) => SuccessStatus::Passed,
        (Some("failed"), _, _) => SuccessStatus::Failed,
        (_, Some("completed"), _) => SuccessStatus::Completed,
        (_, Some("incomplete"), _) => SuccessStatus::Incomplete,
        (_, _, Some(legacy)) => legacy.parse().unwrap_or(SuccessStatus::Unknown),
        _ => SuccessStatus::Unknown,
    };
    Some(status)
}

fn prefer(root: &Value, core: Option<&Value>, newer: &str, legacy: &str) -> Option<String> {
    text(root.get(newer)).or_else(|| text(core.and_then(|c| c.get(legacy))))
}

fn score_field(root: &Value, core: Option<&Value>, field: &str) -> Option<f64> {
    number(root.get("score").and_then(|s| s.get(field)))
        .or_else(|| number(core.and_then(|c| c.get("score")).and_then(|s| s.get(field))))
}

/// Scalar leaves as text. Empty strings count as absent.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numbers, or numeric strings (flattened records are all strings).
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
