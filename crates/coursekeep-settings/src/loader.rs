//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `COURSEKEEP_*` environment overrides
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{home_dir, Settings, SyncMode};

/// `~/.coursekeep/settings.json`.
pub fn settings_path() -> PathBuf {
    home_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error. The result is
/// validated before it is returned.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment variable overrides.
///
/// Invalid values are ignored with a warning and the file/default value is
/// kept.
pub fn apply_env_overrides(settings: &mut Settings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("COURSEKEEP_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u64("COURSEKEEP_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = read_env_u64("COURSEKEEP_MAX_UPLOAD_ACTIONS", 1, 100_000) {
        settings.server.max_upload_actions = v as usize;
    }

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("COURSEKEEP_DB_PATH") {
        settings.storage.db_path = v;
    }
    if let Some(v) = read_env_string("COURSEKEEP_PACKAGES_DIR") {
        settings.packages.dir = Some(v);
    }

    // ── Sync ────────────────────────────────────────────────────────
    if let Some(v) = read_env_string("COURSEKEEP_SYNC_MODE") {
        match v.as_str() {
            "local" => settings.sync.mode = SyncMode::Local,
            "forward" => settings.sync.mode = SyncMode::Forward,
            other => tracing::warn!(value = other, "invalid COURSEKEEP_SYNC_MODE, ignoring"),
        }
    }
    if let Some(v) = read_env_string("COURSEKEEP_UPSTREAM_URL") {
        settings.sync.upstream_url = Some(v);
    }
    if let Some(v) = read_env_u64("COURSEKEEP_SYNC_BATCH_SIZE", 1, 10_000) {
        settings.sync.batch_size = v as u32;
    }
    if let Some(v) = read_env_u64("COURSEKEEP_SYNC_MAX_RETRIES", 1, 1_000) {
        settings.sync.max_retries = v as u32;
    }
    if let Some(v) = read_env_u64("COURSEKEEP_SYNC_INTERVAL_SECS", 1, 86_400) {
        settings.sync.interval_secs = v;
    }
    if let Some(v) = read_env_bool("COURSEKEEP_SYNC_AUTO_START") {
        settings.sync.auto_start = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("COURSEKEEP_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("COURSEKEEP_LOG_TO_SQLITE") {
        settings.logging.log_to_sqlite = v;
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
    }
    result
}
