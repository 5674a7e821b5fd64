//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If `~/.tether/settings.json` exists, deep-merge user values over
//!    defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::TetherSettings;

/// Resolve the path to the settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply environment variable overrides to loaded settings.
///
/// Each env var has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Invalid values are silently ignored (fall back to file/default)
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_WS_URL") {
        settings.connection.ws_url = v;
    }
    if let Some(v) = read_env_u64("TETHER_HEARTBEAT_INTERVAL", 1000, 600_000) {
        settings.connection.heartbeat_interval_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_LIVENESS_TIMEOUT", 1000, 3_600_000) {
        settings.connection.liveness_timeout_ms = v;
    }
    if let Some(v) = read_env_u32("TETHER_MAX_RECONNECT_ATTEMPTS", 1, 1000) {
        settings.connection.reconnect.max_attempts = v;
    }

    // ── Polling ─────────────────────────────────────────────────────
    if let Some(v) = read_env_u64("TETHER_POLL_INTERVAL", 100, 600_000) {
        settings.polling.interval_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_POLL_MAX_DURATION", 1000, 86_400_000) {
        settings.polling.max_duration_ms = v;
    }
    if let Some(v) = read_env_u32("TETHER_POLL_FAILURE_THRESHOLD", 1, 100) {
        settings.polling.failure_threshold = v;
    }

    // ── Coordination ────────────────────────────────────────────────
    if let Some(v) = read_env_u64("TETHER_LEASE_TTL", 1000, 3_600_000) {
        settings.coordination.lease_ttl_ms = v;
    }
    if let Some(v) = read_env_u64("TETHER_LEASE_RENEW_INTERVAL", 100, 3_600_000) {
        settings.coordination.renew_interval_ms = v;
    }

    // ── Tasks ───────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("TETHER_GLOBAL_TASK_LIMIT", 1, 1000) {
        settings.tasks.global_task_limit = v;
    }
    if let Some(v) = read_env_usize("TETHER_CONVERSATION_TASK_LIMIT", 1, 100) {
        settings.tasks.conversation_task_limit = v;
    }

    // ── Reconcile ───────────────────────────────────────────────────
    if let Some(v) = read_env_u64("TETHER_MATCH_WINDOW", 0, 600_000) {
        settings.reconcile.match_window_ms = v;
    }

    // ── Recovery ────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_API_BASE_URL") {
        settings.recovery.api_base_url = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_in_range(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim()
        .parse::<u64>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}

/// Parse a string as a `u32` within an inclusive range.
pub fn parse_u32_in_range(val: &str, min: u32, max: u32) -> Option<u32> {
    val.trim()
        .parse::<u32>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}

/// Parse a string as a `usize` within an inclusive range.
pub fn parse_usize_in_range(val: &str, min: usize, max: usize) -> Option<usize> {
    val.trim()
        .parse::<usize>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_u64_in_range(&v, min, max))
}

fn read_env_u32(name: &str, min: u32, max: u32) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_u32_in_range(&v, min, max))
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_usize_in_range(&v, min, max))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
