//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over
//!    the defaults
//! 3. Apply `RELAY_*` environment variable overrides
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{LogFormat, RelaySettings};

/// Load settings, optionally from a file, with env var overrides applied.
pub fn load_settings(path: Option<&Path>) -> Result<RelaySettings> {
    match path {
        Some(path) => load_settings_from_path(path),
        None => {
            let mut settings = RelaySettings::default();
            apply_env_overrides(&mut settings);
            settings.validate()?;
            Ok(settings)
        }
    }
}

/// Load settings from a specific file with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<RelaySettings> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        warn!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
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
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply `RELAY_*` overrides using `lookup` as the variable source.
///
/// Numbers must parse and fall within range; invalid values are ignored
/// with a warning, falling back to file/default values.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };
    let server = &mut settings.server;

    if let Some(v) = env.string("RELAY_HOST") {
        server.host = v;
    }
    if let Some(v) = env.parsed("RELAY_PORT", 0u16, u16::MAX) {
        server.port = v;
    }
    if let Some(v) = env.string("RELAY_WS_PATH") {
        server.ws_path = v;
    }
    if let Some(v) = env.string("RELAY_STATIC_DIR") {
        server.static_dir = PathBuf::from(v);
    }
    if let Some(v) = env.parsed("RELAY_MAILBOX_CAPACITY", 1usize, 1_000_000) {
        server.mailbox_capacity = v;
    }
    if let Some(v) = env.parsed("RELAY_BROADCAST_QUEUE_CAPACITY", 1usize, 1_000_000) {
        server.broadcast_queue_capacity = v;
    }
    if let Some(v) = env.parsed("RELAY_MAX_MESSAGE_SIZE", 1usize, 64 * 1024 * 1024) {
        server.max_message_size = v;
    }
    if let Some(v) = env.parsed("RELAY_IDLE_TIMEOUT_SECS", 1u64, 86_400) {
        server.idle_timeout_secs = Some(v);
    }
    if let Some(v) = env.parsed("RELAY_SHUTDOWN_TIMEOUT_SECS", 0u64, 3_600) {
        server.shutdown_timeout_secs = v;
    }

    let logging = &mut settings.logging;
    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        logging.level = v;
    }
    if let Some(v) = env.string("RELAY_LOG_FORMAT") {
        match v.parse::<LogFormat>() {
            Ok(format) => logging.format = format,
            Err(e) => warn!(key = "RELAY_LOG_FORMAT", value = %v, error = %e, "ignoring env var"),
        }
    }
}

/// Parse `val` as a number within `[min, max]`.
pub fn parse_in_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, min: T, max: T) -> Option<T>
    where
        T: std::str::FromStr + PartialOrd,
    {
        let val = (self.lookup)(name)?;
        let result = parse_in_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn merge_overrides_nested_keys() {
        let merged = deep_merge(
            json!({"server": {"port": 8000, "host": "0.0.0.0"}}),
            json!({"server": {"port": 9000}}),
        );
        assert_eq!(merged["server"]["port"], 9000);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_skips_nulls() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_replaces_arrays_and_primitives() {
        let merged = deep_merge(json!({"a": [1, 2], "b": 1}), json!({"a": [3], "b": "x"}));
        assert_eq!(merged["a"], json!([3]));
        assert_eq!(merged["b"], "x");
    }

    #[test]
    fn merge_adds_new_keys() {
        let merged = deep_merge(json!({"a": 1}), json!({"b": 2}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn overrides_apply() {
        let mut s = RelaySettings::default();
        apply_overrides(
            &mut s,
            lookup_from(&[
                ("RELAY_HOST", "127.0.0.1"),
                ("RELAY_PORT", "9001"),
                ("RELAY_WS_PATH", "/relay"),
                ("RELAY_STATIC_DIR", "/srv/www"),
                ("RELAY_MAILBOX_CAPACITY", "8"),
                ("RELAY_IDLE_TIMEOUT_SECS", "60"),
                ("RELAY_LOG_FORMAT", "json"),
                ("RELAY_LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 9001);
        assert_eq!(s.server.ws_path, "/relay");
        assert_eq!(s.server.static_dir, PathBuf::from("/srv/www"));
        assert_eq!(s.server.mailbox_capacity, 8);
        assert_eq!(s.server.idle_timeout_secs, Some(60));
        assert_eq!(s.logging.format, LogFormat::Json);
        assert_eq!(s.logging.level, "debug");
    }

    #[test]
    fn invalid_overrides_ignored() {
        let mut s = RelaySettings::default();
        apply_overrides(
            &mut s,
            lookup_from(&[
                ("RELAY_PORT", "not-a-port"),
                ("RELAY_MAILBOX_CAPACITY", "0"),
                ("RELAY_LOG_FORMAT", "xml"),
                ("RELAY_HOST", ""),
            ]),
        );
        assert_eq!(s, RelaySettings::default());
    }

    #[test]
    fn parse_in_range_bounds() {
        assert_eq!(parse_in_range("5", 1u32, 10), Some(5));
        assert_eq!(parse_in_range(" 10 ", 1u32, 10), Some(10));
        assert_eq!(parse_in_range("11", 1u32, 10), None);
        assert_eq!(parse_in_range("-1", 0i64, 10), None);
        assert_eq!(parse_in_range("abc", 0u16, 10), None);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(s.server, RelaySettings::default().server);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server": {{"port": 9300, "mailboxCapacity": 4}}, "logging": {{"format": "json"}}}}"#
        )
        .unwrap();
        let s = load_settings_from_path(file.path()).unwrap();
        assert_eq!(s.server.port, 9300);
        assert_eq!(s.server.mailbox_capacity, 4);
        assert_eq!(s.server.ws_path, "/ws");
        assert_eq!(s.logging.format, LogFormat::Json);
    }

    #[test]
    fn invalid_json_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = load_settings_from_path(file.path()).unwrap_err();
        assert!(matches!(err, crate::SettingsError::Json(_)));
    }

    #[test]
    fn invalid_values_in_file_fail_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server": {{"broadcastQueueCapacity": 0}}}}"#).unwrap();
        let err = load_settings_from_path(file.path()).unwrap_err();
        assert!(matches!(err, crate::SettingsError::InvalidValue(_)));
    }
}
