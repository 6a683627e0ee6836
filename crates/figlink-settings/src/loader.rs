//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`FiglinkSettings::default()`]
//! 2. If `~/.figlink/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `FIGLINK_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{FiglinkSettings, LogFormat};

/// Resolve the path to the settings file (`~/.figlink/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".figlink").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<FiglinkSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, or the merged result fails validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<FiglinkSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// [`load_settings_from_path`] with an explicit environment lookup.
pub fn load_with_env<F>(path: &Path, env: F) -> Result<FiglinkSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(FiglinkSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: FiglinkSettings = serde_json::from_value(merged)?;
    apply_env_overrides_from(&mut settings, env);
    settings.validate()?;
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

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut FiglinkSettings) {
    apply_env_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply environment overrides read through `env`.
///
/// Each variable has strict parsing rules:
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning (fall back to file/default)
pub fn apply_env_overrides_from<F>(settings: &mut FiglinkSettings, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader(env);

    // ── Client ──────────────────────────────────────────────────────
    if let Some(v) = env.string("FIGLINK_URL") {
        settings.client.url = v;
    }
    if let Some(v) = env.string("FIGLINK_CLIENT_NAME") {
        settings.client.client_name = v;
    }
    if let Some(v) = env.u64("FIGLINK_REQUEST_TIMEOUT_MS", 100, 3_600_000) {
        settings.client.request_timeout_ms = v;
    }
    if let Some(v) = env.u64("FIGLINK_CONNECT_TIMEOUT_MS", 100, 600_000) {
        settings.client.connect_timeout_ms = v;
    }
    if let Some(v) = env.usize("FIGLINK_MAX_FRAME_BYTES", 1024, 64 * 1024 * 1024) {
        settings.client.max_frame_bytes = v;
    }

    // ── Reconnect ───────────────────────────────────────────────────
    if let Some(v) = env.bool("FIGLINK_RECONNECT_ENABLED") {
        settings.reconnect.enabled = v;
    }
    if let Some(v) = env.u64("FIGLINK_RECONNECT_BASE_DELAY_MS", 1, 600_000) {
        settings.reconnect.base_delay_ms = v;
    }
    if let Some(v) = env.u32("FIGLINK_RECONNECT_MAX_ATTEMPTS", 0, 1000) {
        settings.reconnect.max_attempts = v;
    }

    // ── Keepalive ───────────────────────────────────────────────────
    if let Some(v) = env.u64("FIGLINK_KEEPALIVE_INTERVAL_MS", 1000, 600_000) {
        settings.keepalive.interval_ms = v;
    }
    if let Some(v) = env.u32("FIGLINK_KEEPALIVE_MAX_MISSED", 0, 100) {
        settings.keepalive.max_missed = v;
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("FIGLINK_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("FIGLINK_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("FIGLINK_MAX_CONNECTIONS", 1, 10_000) {
        settings.server.max_connections = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("FIGLINK_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("FIGLINK_LOG_FORMAT") {
        match serde_json::from_value::<LogFormat>(Value::String(v.to_lowercase())) {
            Ok(format) => settings.logging.format = format,
            Err(_) => tracing::warn!(key = "FIGLINK_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.0)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.parsed(name, "u32", |v| parse_u32_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
