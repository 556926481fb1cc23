//! Configuration loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerConfig::default()`]
//! 2. If a JSON config file exists, deep-merge its values over the defaults
//! 3. Apply `TIDEWIRE_*` environment variable overrides (highest priority)
//! 4. Validate the result

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::config::{FrameMode, ServerConfig};
use crate::errors::ConfigError;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "TIDEWIRE_CONFIG";

/// Load configuration from an optional file path plus environment overrides.
///
/// A missing file is not an error; defaults are used instead. A file with
/// invalid JSON is.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let env_path = std::env::var(CONFIG_PATH_ENV).ok();
    let path = path.or(env_path.as_deref().map(Path::new));
    let mut config = match path {
        Some(p) => load_config_from_path(p)?,
        None => ServerConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Load configuration from a specific path, without env overrides.
pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
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

/// Apply environment overrides using `lookup` to read variables.
///
/// Unparseable or out-of-range values are ignored and the file/default
/// value is kept.
pub fn apply_env_overrides(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = read_string(&lookup, "TIDEWIRE_HOST") {
        config.host = v;
    }
    if let Some(v) = read_parsed::<u16>(&lookup, "TIDEWIRE_PORT") {
        config.port = v;
    }
    if let Some(v) = read_parsed::<FrameMode>(&lookup, "TIDEWIRE_FRAME_MODE") {
        config.frame_mode = v;
    }
    if let Some(v) = read_parsed::<usize>(&lookup, "TIDEWIRE_WORKER_POOL_SIZE") {
        config.worker_pool_size = v;
    }
    if let Some(v) = read_parsed::<usize>(&lookup, "TIDEWIRE_MAX_CONNECTIONS").filter(|v| *v > 0) {
        config.max_connections = v;
    }
    if let Some(v) = read_parsed::<usize>(&lookup, "TIDEWIRE_MAX_PAYLOAD_LEN")
        .filter(|v| *v <= u32::MAX as usize)
    {
        config.max_payload_len = v;
    }
    if let Some(v) = read_parsed::<u64>(&lookup, "TIDEWIRE_HEARTBEAT_TIMEOUT").filter(|v| *v > 0) {
        config.heartbeat_timeout_secs = v;
    }
    if let Some(v) = read_string(&lookup, "TIDEWIRE_LOG_LEVEL") {
        config.log_level = v;
    }
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

fn read_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = read_string(lookup, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            debug!(key, value = raw, "ignoring unparseable env override");
            None
        }
    }
}
