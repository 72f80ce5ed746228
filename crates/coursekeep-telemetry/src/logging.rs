//! Warn+ events persisted to SQLite.
//!
//! Sync failures are logged with `session_id`, `entry_id`, `kind`, `retries`
//! and `error` fields. Those get their own columns so the history of one
//! queue entry can be queried directly; any other event field is kept as a
//! JSON object.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Message logged when a sync entry reaches its retry limit.
pub const SYNC_EXHAUSTED: &str = "sync entry exhausted";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        session_id TEXT,
        entry_id INTEGER,
        kind TEXT,
        retries INTEGER,
        error TEXT,
        fields TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_entry ON logs(entry_id);
    CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
    CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

const COLUMNS: &str =
    "id, timestamp, level, target, message, session_id, entry_id, kind, retries, error, fields";

/// Most to least severe.
const LEVELS: [&str; 5] = ["ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub session_id: Option<String>,
    pub entry_id: Option<i64>,
    pub kind: Option<String>,
    pub retries: Option<u32>,
    pub error: Option<String>,
    /// Remaining event fields.
    pub fields: Option<Value>,
}

/// Filters for [`SqliteLogSink::query`]. Every field is optional and they
/// combine with AND. Results are newest first.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogQuery {
    /// Severity floor: `warn` also returns errors.
    pub level: Option<String>,
    pub session_id: Option<String>,
    pub entry_id: Option<i64>,
    pub kind: Option<String>,
    /// Exact event message, such as [`SYNC_EXHAUSTED`].
    pub message: Option<String>,
    /// RFC3339 lower bound on the event time.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    /// Exhaustion events of one queue entry.
    pub fn exhausted(entry_id: i64) -> Self {
        Self {
            entry_id: Some(entry_id),
            message: Some(SYNC_EXHAUSTED.to_string()),
            ..Self::default()
        }
    }

    fn filter(&self) -> Filter {
        let mut filter = Filter::default();
        if let Some(level) = &self.level {
            let slots: Vec<String> = severities_at_least(level)
                .into_iter()
                .map(|l| filter.bind(l))
                .collect();
            filter.and(format!("level IN ({})", slots.join(", ")));
        }
        if let Some(session_id) = &self.session_id {
            let slot = filter.bind(session_id.clone());
            filter.and(format!("session_id = {slot}"));
        }
        if let Some(entry_id) = self.entry_id {
            let slot = filter.bind(entry_id);
            filter.and(format!("entry_id = {slot}"));
        }
        if let Some(kind) = &self.kind {
            let slot = filter.bind(kind.to_lowercase());
            filter.and(format!("kind = {slot}"));
        }
        if let Some(message) = &self.message {
            let slot = filter.bind(message.clone());
            filter.and(format!("message = {slot}"));
        }
        if let Some(since) = &self.since {
            let slot = filter.bind(normalize_ts(since));
            filter.and(format!("timestamp >= {slot}"));
        }
        filter
    }
}

/// WHERE clauses with positional parameters.
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl Filter {
    fn bind(&mut self, value: impl ToSql + 'static) -> String {
        self.params.push(Box::new(value));
        format!("?{}", self.params.len())
    }

    fn and(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// `level` and everything more severe. An unknown level matches itself only.
fn severities_at_least(level: &str) -> Vec<String> {
    let level = level.to_uppercase();
    match LEVELS.iter().position(|l| *l == level) {
        Some(pos) => LEVELS[..=pos].iter().map(|l| (*l).to_string()).collect(),
        None => vec![level],
    }
}

/// Stored timestamps carry microseconds; bring `since` to the same form so
/// text comparison matches time order.
fn normalize_ts(ts: &str) -> String {
    DateTime::parse_from_rfc3339(ts)
        .map(|t| format_ts(t.with_timezone(&Utc)))
        .unwrap_or_else(|_| ts.to_string())
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite sink for warn+ events, so sink failures and exhausted sync entries
/// stay inspectable across restarts.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, timestamp: &str, level: &str, target: &str, event: EventFields) {
        let fields = (!event.rest.is_empty())
            .then(|| Value::Object(event.rest).to_string());
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, session_id, entry_id, kind, retries, error, fields)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                timestamp,
                level,
                target,
                event.message.unwrap_or_default(),
                event.session_id,
                event.entry_id,
                event.kind,
                event.retries,
                event.error,
                fields,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let filter = q.filter();
        let limit = q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let sql = format!(
            "SELECT {COLUMNS} FROM logs{} ORDER BY id DESC LIMIT {limit}",
            filter.sql()
        );

        let params: Vec<&dyn ToSql> = filter.params.iter().map(|p| p.as_ref()).collect();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), |row| {
            let fields: Option<String> = row.get(10)?;
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                session_id: row.get(5)?,
                entry_id: row.get(6)?,
                kind: row.get(7)?,
                retries: row.get(8)?,
                error: row.get(9)?,
                fields: fields.and_then(|f| serde_json::from_str(&f).ok()),
            })
        })?;
        rows.collect()
    }

    /// Every time `entry_id` exhausted its retries, newest first. An entry
    /// re-armed by an operator can exhaust more than once.
    pub fn exhausted_history(&self, entry_id: i64) -> Result<Vec<LogRecord>, rusqlite::Error> {
        self.query(&LogQuery {
            limit: Some(MAX_LIMIT),
            ..LogQuery::exhausted(entry_id)
        })
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// tracing layer writing warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Fields of one event or span, split into the indexed sync columns and
/// everything else.
#[derive(Debug, Default)]
struct EventFields {
    message: Option<String>,
    session_id: Option<String>,
    entry_id: Option<i64>,
    kind: Option<String>,
    retries: Option<u32>,
    error: Option<String>,
    rest: serde_json::Map<String, Value>,
}

impl EventFields {
    fn text(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "session_id" => self.session_id = Some(value),
            "kind" => self.kind = Some(value),
            "error" => self.error = Some(value),
            "entry_id" => match value.parse() {
                Ok(id) => self.entry_id = Some(id),
                Err(_) => self.other(name, Value::String(value)),
            },
            _ => self.other(name, Value::String(value)),
        }
    }

    fn other(&mut self, name: &str, value: Value) {
        let _ = self.rest.insert(name.to_string(), value);
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        let text = match field.name() {
            "message" => text,
            _ => text.trim_matches('"').to_string(),
        };
        self.text(field.name(), text);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        match field.name() {
            "entry_id" => self.entry_id = Some(value),
            "retries" => self.retries = u32::try_from(value).ok(),
            name => self.other(name, value.into()),
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "entry_id" => self.entry_id = i64::try_from(value).ok(),
            "retries" => self.retries = u32::try_from(value).ok(),
            name => self.other(name, value.into()),
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.other(field.name(), Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.other(field.name(), Value::Bool(value));
    }
}

/// Ids recorded on a span, inherited by events inside it.
struct SpanIds {
    session_id: Option<String>,
    entry_id: Option<i64>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if fields.session_id.is_none() && fields.entry_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanIds {
                session_id: fields.session_id,
                entry_id: fields.entry_id,
            });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        // Innermost span first, so the closest id wins.
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if fields.session_id.is_some() && fields.entry_id.is_some() {
                    break;
                }
                if let Some(ids) = span.extensions().get::<SpanIds>() {
                    if fields.session_id.is_none() {
                        fields.session_id.clone_from(&ids.session_id);
                    }
                    if fields.entry_id.is_none() {
                        fields.entry_id = ids.entry_id;
                    }
                }
            }
        }

        self.sink.insert(
            &format_ts(Utc::now()),
            &level.to_string().to_uppercase(),
            event.metadata().target(),
            fields,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(f: impl FnOnce()) -> Arc<SqliteLogSink> {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, f);
        sink
    }

    fn at(sink: &SqliteLogSink, ts: &str, level: &str, message: &str, entry_id: Option<i64>) {
        sink.insert(
            ts,
            level,
            "coursekeep_engine::processor",
            EventFields {
                message: Some(message.to_string()),
                entry_id,
                ..EventFields::default()
            },
        );
    }

    #[test]
    fn sync_failure_fields_get_their_own_columns() {
        let sink = capture(|| {
            tracing::info!(entry_id = 1_i64, "not persisted");
            tracing::warn!(
                entry_id = 7_i64,
                session_id = "sess_1",
                kind = "commit",
                retries = 3_u32,
                error = "sink error: upstream down",
                "sync entry exhausted"
            );
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.level, "WARN");
        assert_eq!(record.message, SYNC_EXHAUSTED);
        assert_eq!(record.session_id.as_deref(), Some("sess_1"));
        assert_eq!(record.entry_id, Some(7));
        assert_eq!(record.kind.as_deref(), Some("commit"));
        assert_eq!(record.retries, Some(3));
        assert_eq!(record.error.as_deref(), Some("sink error: upstream down"));
        assert_eq!(record.fields, None);
    }

    #[test]
    fn other_fields_are_kept_as_json() {
        let sink = capture(|| {
            tracing::warn!(entry_id = 2_i64, retries = 1_u32, retry_in_ms = 500_u64, "sync entry failed");
        });
        let records = sink.query(&LogQuery::default()).unwrap();
        let record = &records[0];
        assert_eq!(record.retries, Some(1));
        assert_eq!(record.fields, Some(json!({"retry_in_ms": 500})));
    }

    #[test]
    fn ids_are_inherited_from_enclosing_spans() {
        let sink = capture(|| {
            let outer = tracing::info_span!("drain", session_id = "sess_span");
            let _outer = outer.enter();
            let inner = tracing::info_span!("mark_synced", entry_id = 42_i64);
            let _inner = inner.enter();
            tracing::error!("database is locked");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        let record = &records[0];
        assert_eq!(record.session_id.as_deref(), Some("sess_span"));
        assert_eq!(record.entry_id, Some(42));
    }

    #[test]
    fn exhausted_history_is_per_entry() {
        let sink = capture(|| {
            tracing::warn!(entry_id = 7_i64, retries = 1_u32, "sync entry failed");
            tracing::warn!(entry_id = 7_i64, retries = 2_u32, "sync entry exhausted");
            tracing::warn!(entry_id = 8_i64, retries = 2_u32, "sync entry exhausted");
            tracing::warn!(entry_id = 7_i64, retries = 2_u32, "sync entry exhausted");
        });

        let history = sink.exhausted_history(7).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.entry_id == Some(7)));
        assert!(history[0].id > history[1].id);
        assert!(sink.exhausted_history(9).unwrap().is_empty());
    }

    #[test]
    fn level_is_a_severity_floor() {
        let sink = SqliteLogSink::in_memory().unwrap();
        at(&sink, "2026-02-14T12:00:00.000000Z", "WARN", "sync entry failed", None);
        at(&sink, "2026-02-14T12:00:01.000000Z", "ERROR", "request failed", None);

        let level = |l: &str| {
            sink.query(&LogQuery {
                level: Some(l.into()),
                ..LogQuery::default()
            })
            .unwrap()
            .len()
        };
        assert_eq!(level("warn"), 2);
        assert_eq!(level("error"), 1);
        assert_eq!(level("info"), 2);
        assert_eq!(level("loud"), 0);
    }

    #[test]
    fn filters_combine() {
        let sink = capture(|| {
            tracing::warn!(session_id = "sess_a", entry_id = 1_i64, kind = "initialize", "sync entry failed");
            tracing::warn!(session_id = "sess_a", entry_id = 2_i64, kind = "commit", "sync entry failed");
            tracing::warn!(session_id = "sess_b", entry_id = 3_i64, kind = "commit", "sync entry failed");
        });

        let commits_of_a = sink
            .query(&LogQuery {
                session_id: Some("sess_a".into()),
                kind: Some("Commit".into()),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(commits_of_a.len(), 1);
        assert_eq!(commits_of_a[0].entry_id, Some(2));

        let entry = sink
            .query(&LogQuery {
                entry_id: Some(3),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(entry[0].session_id.as_deref(), Some("sess_b"));
    }

    #[test]
    fn since_accepts_second_precision_and_limit_caps() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..10 {
            at(&sink, &format!("2026-02-14T12:00:{i:02}.000000Z"), "WARN", &format!("msg {i}"), None);
        }

        let since = sink
            .query(&LogQuery {
                since: Some("2026-02-14T12:00:08Z".into()),
                ..LogQuery::default()
            })
            .unwrap();
        let messages: Vec<&str> = since.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["msg 9", "msg 8"]);

        let limited = sink
            .query(&LogQuery {
                limit: Some(3),
                ..LogQuery::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 3);
        assert_eq!(limited[0].message, "msg 9");
    }

    #[test]
    fn file_backed_sink_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("coursekeep-logs.db");
        {
            let sink = SqliteLogSink::new(&path).unwrap();
            at(&sink, "2026-02-14T12:00:00.000000Z", "WARN", SYNC_EXHAUSTED, Some(5));
        }
        let reopened = SqliteLogSink::new(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
        assert_eq!(reopened.exhausted_history(5).unwrap().len(), 1);
    }
}
