//! Interaction entries carried inside commit payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::summary::cmi_root;

/// One interaction as extracted from a payload, ready to be upserted by
/// `(session_id, id)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionUpdate {
    pub id: String,
    pub kind: Option<String>,
    pub timestamp: Option<String>,
    /// Correct-response patterns, serialized as a JSON array of strings.
    pub correct_responses: Option<String>,
    pub learner_response: Option<String>,
    pub result: Option<String>,
    pub latency: Option<String>,
    pub description: Option<String>,
}

/// Extract interactions from a payload. `interactions` may be an array or an
/// index-keyed object. Entries without an `id` are skipped.
pub fn extract_interactions(payload: &Value) -> Vec<InteractionUpdate> {
    let entries: Vec<&Value> = match cmi_root(payload).get("interactions") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Object(map)) => index_ordered(map),
        _ => return Vec::new(),
    };

    entries.into_iter().filter_map(parse_entry).collect()
}

/// Values of an index-keyed object in numeric key order (`"2"` before
/// `"10"`). Non-numeric keys follow, in key order.
fn index_ordered(map: &serde_json::Map<String, Value>) -> Vec<&Value> {
    let mut entries: Vec<(Option<usize>, &String, &Value)> = map
        .iter()
        .map(|(key, value)| (key.parse::<usize>().ok(), key, value))
        .collect();
    entries.sort_by(|a, b| match (a.0, b.0) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.1.cmp(b.1),
    });
    entries.into_iter().map(|(_, _, value)| value).collect()
}

fn parse_entry(entry: &Value) -> Option<InteractionUpdate> {
    let id = field(entry, &["id"])?;
    Some(InteractionUpdate {
        id,
        kind: field(entry, &["type"]),
        // `time` is the older shape's name for the same field.
        timestamp: field(entry, &["timestamp", "time"]),
        correct_responses: correct_responses(entry.get("correct_responses")),
        learner_response: field(entry, &["learner_response", "student_response"]),
        result: field(entry, &["result"]),
        latency: field(entry, &["latency"]),
        description: field(entry, &["description"]),
    })
}

fn field(entry: &Value, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match entry.get(*name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

fn correct_responses(value: Option<&Value>) -> Option<String> {
    let items: Vec<&Value> = match value? {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => index_ordered(map),
        _ => return None,
    };
    let patterns: Vec<String> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            other => field(other, &["pattern"]),
        })
        .collect();
    if patterns.is_empty() {
        return None;
    }
    serde_json::to_string(&patterns).ok()
}
