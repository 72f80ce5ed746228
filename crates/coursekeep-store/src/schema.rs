/// SQL DDL for the coursekeep database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    package_id TEXT NOT NULL,
    learner_id TEXT,
    state TEXT NOT NULL DEFAULT 'created',
    completed INTEGER NOT NULL DEFAULT 0,
    success_status TEXT NOT NULL DEFAULT 'unknown',
    score_raw REAL,
    score_min REAL,
    score_max REAL,
    session_time TEXT,
    total_time TEXT,
    suspend_data TEXT,
    location TEXT,
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS interactions (
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    interaction_id TEXT NOT NULL,
    kind TEXT,
    timestamp TEXT,
    correct_responses TEXT,
    learner_response TEXT,
    result TEXT,
    latency TEXT,
    description TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (session_id, interaction_id)
);

-- No foreign key: entries may reference a session that does not exist yet.
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    package_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_package ON sessions(package_id);
CREATE INDEX IF NOT EXISTS idx_records_session_path ON records(session_id, path, written_at);
CREATE INDEX IF NOT EXISTS idx_records_session_time ON records(session_id, written_at);
CREATE INDEX IF NOT EXISTS idx_sync_queue_pending ON sync_queue(synced, created_at);
CREATE INDEX IF NOT EXISTS idx_sync_queue_session ON sync_queue(session_id, synced);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
