//! `BERTH_*` environment variable overrides.
//!
//! Environment variables sit at the top of the precedence chain. Each one
//! maps to exactly one dotted config path.

use std::collections::HashMap;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources};

#[derive(Debug, Clone, Copy)]
enum Kind {
    Str,
    Int,
    Bool,
}

/// Supported overrides: `(variable, dotted path, value kind)`.
const OVERRIDES: &[(&str, &str, Kind)] = &[
    ("BERTH_LOG_LEVEL", "logging.level", Kind::Str),
    ("BERTH_LOG_FORMAT", "logging.format", Kind::Str),
    ("BERTH_LOG_DIR", "logging.file_dir", Kind::Str),
    ("BERTH_CACHE_DIR", "cache.dir", Kind::Str),
    ("BERTH_CACHE_MAX_BYTES", "cache.max_size_bytes", Kind::Int),
    ("BERTH_DATA_ROOT", "data.root", Kind::Str),
    ("BERTH_GATEWAY_URL", "network.gateway_url", Kind::Str),
    ("BERTH_STORE_DIR", "network.store_dir", Kind::Str),
    ("BERTH_DEPLOYMENT_MODE", "deployment.mode", Kind::Str),
    ("BERTH_ALLOW_LOCAL_PATHS", "development.allow_local_paths", Kind::Bool),
    ("BERTH_START_TIMEOUT_SECS", "timeouts.start_announce_secs", Kind::Int),
    ("BERTH_STOP_GRACE_SECS", "timeouts.stop_grace_secs", Kind::Int),
    ("BERTH_HISTORY_TIMEOUT_SECS", "timeouts.history_fetch_secs", Kind::Int),
];

/// Snapshot the `BERTH_*` variables of the current process.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("BERTH_"))
        .collect()
}

/// Apply overrides from `env` onto the merged tree.
///
/// Returns the number of overrides applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] when a numeric or boolean variable does
/// not parse.
pub fn apply_env_overrides(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env: &HashMap<String, String>,
) -> ConfigResult<usize> {
    let mut applied = 0usize;
    for (var, path, kind) in OVERRIDES {
        let Some(raw) = env.get(*var) else {
            continue;
        };
        let value = parse_value(var, raw, *kind)?;
        set_path(merged, path, value);
        sources.insert((*path).to_owned(), ConfigLayer::Environment);
        applied = applied.saturating_add(1);
    }
    Ok(applied)
}

fn parse_value(var: &str, raw: &str, kind: Kind) -> ConfigResult<toml::Value> {
    let err = |message: &str| ConfigError::EnvError {
        var: var.to_owned(),
        message: message.to_owned(),
    };
    match kind {
        Kind::Str => Ok(toml::Value::String(raw.to_owned())),
        Kind::Int => raw
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .map(toml::Value::Integer)
            .ok_or_else(|| err("expected a non-negative integer")),
        Kind::Bool => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(toml::Value::Boolean(true)),
            "0" | "false" | "no" | "off" => Ok(toml::Value::Boolean(false)),
            _ => Err(err("expected true or false")),
        },
    }
}

/// Set `a.b.c` in `root`, creating intermediate tables.
fn set_path(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let toml::Value::Table(table) = current else {
            return;
        };
        if segments.peek().is_none() {
            table.insert(segment.to_owned(), value);
            return;
        }
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn overrides_are_applied_and_tracked() {
        let mut merged: toml::Value = toml::from_str("[logging]\nlevel = \"info\"").unwrap();
        let mut sources = FieldSources::new();
        let count = apply_env_overrides(
            &mut merged,
            &mut sources,
            &env(&[
                ("BERTH_LOG_LEVEL", "debug"),
                ("BERTH_ALLOW_LOCAL_PATHS", "yes"),
                ("BERTH_CACHE_MAX_BYTES", "1024"),
                ("BERTH_UNRELATED", "x"),
            ]),
        )
        .unwrap();

        assert_eq!(count, 3);
        assert_eq!(merged["logging"]["level"].as_str(), Some("debug"));
        assert_eq!(
            merged["development"]["allow_local_paths"].as_bool(),
            Some(true)
        );
        assert_eq!(merged["cache"]["max_size_bytes"].as_integer(), Some(1024));
        assert_eq!(
            sources.get("logging.level"),
            Some(&ConfigLayer::Environment)
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut sources = FieldSources::new();
        let result = apply_env_overrides(
            &mut merged,
            &mut sources,
            &env(&[("BERTH_START_TIMEOUT_SECS", "-3")]),
        );
        assert!(matches!(result, Err(ConfigError::EnvError { .. })));

        let result = apply_env_overrides(
            &mut merged,
            &mut sources,
            &env(&[("BERTH_ALLOW_LOCAL_PATHS", "maybe")]),
        );
        assert!(matches!(result, Err(ConfigError::EnvError { .. })));
    }
}
