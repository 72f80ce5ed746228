//! Settings type definitions.
//!
//! JSON field names are camelCase. Every section is `#[serde(default)]`, so a
//! settings file only needs the keys it changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub sync: SyncSettings,
    pub packages: PackageSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.sync.batch_size == 0 {
            return Err(SettingsError::InvalidValue(
                "sync.batchSize must be at least 1".into(),
            ));
        }
        if self.sync.max_retries == 0 {
            return Err(SettingsError::InvalidValue(
                "sync.maxRetries must be at least 1".into(),
            ));
        }
        if self.sync.interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "sync.intervalSecs must be at least 1".into(),
            ));
        }
        if self.sync.mode == SyncMode::Forward && self.sync.upstream_url.is_none() {
            return Err(SettingsError::InvalidValue(
                "sync.upstreamUrl is required when sync.mode is \"forward\"".into(),
            ));
        }
        if self.server.max_upload_actions == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxUploadActions must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP boundary settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    pub port: u16,
    /// Request bodies above this size are rejected with 413.
    pub max_body_bytes: usize,
    /// Upper bound on actions in one offline upload batch.
    pub max_upload_actions: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9380,
            max_body_bytes: 4 * 1024 * 1024,
            max_upload_actions: 500,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// SQLite database path. Relative paths resolve against `~/.coursekeep`.
    pub db_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: "database/coursekeep.db".to_string(),
        }
    }
}

/// Where the sync processor applies queued actions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Apply through the local session state machine.
    #[default]
    Local,
    /// Forward to an upstream system of record over HTTP.
    Forward,
}

/// Sync queue processing settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub mode: SyncMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
    /// Entries drained per pass.
    pub batch_size: u32,
    /// Failed attempts after which an entry is left for an operator.
    pub max_retries: u32,
    /// Timer interval between scheduled passes.
    pub interval_secs: u64,
    /// Per-call bound on a sink application.
    pub sink_timeout_ms: u64,
    /// First retry delay; doubles per attempt. 0 retries on the next pass.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Start the timer when the server boots.
    pub auto_start: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::Local,
            upstream_url: None,
            batch_size: 50,
            max_retries: 5,
            interval_secs: 30,
            sink_timeout_ms: 10_000,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
            auto_start: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageSettings {
    /// Directory holding one sub-directory per extracted package. When unset,
    /// any package id is accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` wins when set.
    pub level: String,
    /// Persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    /// Relative paths resolve against `~/.coursekeep`.
    pub log_db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: "database/coursekeep-logs.db".to_string(),
        }
    }
}

/// `~/.coursekeep`, falling back to `/tmp/.coursekeep` without `HOME`.
pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".coursekeep")
}

/// Resolve a configured path against [`home_dir`] unless it is absolute.
pub fn resolve_path(raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home_dir().join(path)
    }
}
