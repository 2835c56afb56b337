//! Deep merge of TOML values.
//!
//! The merge operates on raw [`toml::Value`] trees rather than deserialized
//! structs, so a key missing from an overlay never overrides the base layer.

use std::collections::HashMap;

/// Which configuration layer a value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLayer {
    /// Compiled-in defaults (`defaults.toml`).
    Defaults,
    /// System-wide configuration (`/etc/berth/config.toml`).
    System,
    /// User-level configuration (`$BERTH_HOME/config.toml`).
    User,
    /// A file named on the command line.
    Explicit,
    /// Environment variable override.
    Environment,
}

impl std::fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Defaults => write!(f, "defaults"),
            Self::System => write!(f, "system (/etc/berth/config.toml)"),
            Self::User => write!(f, "user (~/.berth/config.toml)"),
            Self::Explicit => write!(f, "explicit config file"),
            Self::Environment => write!(f, "environment variable"),
        }
    }
}

/// Tracks which layer set each field's value.
pub type FieldSources = HashMap<String, ConfigLayer>;

/// Deep-merge `overlay` into `base`, recording which layer set each leaf
/// field.
///
/// - Tables merge recursively per-field.
/// - Scalars and arrays from the overlay **replace** the base value.
pub fn deep_merge_tracking(
    base: &mut toml::Value,
    overlay: &toml::Value,
    prefix: &str,
    layer: &ConfigLayer,
    sources: &mut FieldSources,
) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let path = join_path(prefix, key);
                if let Some(base_val) = base_table.get_mut(key) {
                    if overlay_val.is_table() {
                        deep_merge_tracking(base_val, overlay_val, &path, layer, sources);
                    } else {
                        *base_val = overlay_val.clone();
                        sources.insert(path, layer.clone());
                    }
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                    record_leaves(overlay_val, &path, layer, sources);
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
            sources.insert(prefix.to_owned(), layer.clone());
        },
    }
}

/// Record every leaf of `val` as coming from `layer`.
pub fn record_leaves(
    val: &toml::Value,
    prefix: &str,
    layer: &ConfigLayer,
    sources: &mut FieldSources,
) {
    if let toml::Value::Table(table) = val {
        for (key, child) in table {
            record_leaves(child, &join_path(prefix, key), layer, sources);
        }
    } else {
        sources.insert(prefix.to_owned(), layer.clone());
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> toml::Value {
        toml::from_str(s).unwrap()
    }

    #[test]
    fn overlay_replaces_only_present_keys() {
        let mut base = parse(
            r"
            [timeouts]
            start_announce_secs = 10
            stop_grace_secs = 5
            ",
        );
        let overlay = parse(
            r"
            [timeouts]
            stop_grace_secs = 1
            ",
        );
        let mut sources = FieldSources::new();
        deep_merge_tracking(&mut base, &overlay, "", &ConfigLayer::User, &mut sources);

        assert_eq!(base["timeouts"]["start_announce_secs"].as_integer(), Some(10));
        assert_eq!(base["timeouts"]["stop_grace_secs"].as_integer(), Some(1));
        assert_eq!(
            sources.get("timeouts.stop_grace_secs"),
            Some(&ConfigLayer::User)
        );
        assert!(!sources.contains_key("timeouts.start_announce_secs"));
    }

    #[test]
    fn new_tables_are_recorded_leaf_by_leaf() {
        let mut base = parse("[components]");
        let overlay = parse(
            r#"
            [components."com.example.sync"]
            restart_on_crash = false
            "#,
        );
        let mut sources = FieldSources::new();
        deep_merge_tracking(&mut base, &overlay, "", &ConfigLayer::System, &mut sources);

        assert_eq!(
            base["components"]["com.example.sync"]["restart_on_crash"].as_bool(),
            Some(false)
        );
        assert_eq!(
            sources.get("components.com.example.sync.restart_on_crash"),
            Some(&ConfigLayer::System)
        );
    }

    #[test]
    fn arrays_are_replaced_not_appended() {
        let mut base = parse(r#"administrators = ["root"]"#);
        let overlay = parse(r#"administrators = ["alice", "bob"]"#);
        let mut sources = FieldSources::new();
        deep_merge_tracking(&mut base, &overlay, "", &ConfigLayer::User, &mut sources);
        assert_eq!(base["administrators"].as_array().map(Vec::len), Some(2));
    }
}
