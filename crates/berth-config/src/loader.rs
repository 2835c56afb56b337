//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `/etc/berth/config.toml` (system)
//! 3. Merge `$BERTH_HOME/config.toml` (user)
//! 4. Merge the explicit file, if any
//! 5. Apply `BERTH_*` overrides
//! 6. Deserialize merged tree → `Config`
//! 7. Validate

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_overrides, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, deep_merge_tracking, record_leaves};
use crate::show::ResolvedConfig;
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Load the configuration with layered file precedence.
///
/// `berth_home` overrides discovery of the user layer; the user file is then
/// `<berth_home>/config.toml`.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, or if the
/// final merged configuration fails validation.
pub fn load(explicit: Option<&Path>, berth_home: Option<&Path>) -> ConfigResult<ResolvedConfig> {
    let env_vars = collect_env_vars();

    let mut merged = defaults_value()?;
    let mut field_sources = FieldSources::new();
    let mut loaded_files = Vec::new();
    record_leaves(&merged, "", &ConfigLayer::Defaults, &mut field_sources);

    let user_path = match berth_home {
        Some(home) => home.join("config.toml"),
        None => user_config_path(env_vars.get("BERTH_HOME").map(String::as_str))?,
    };

    let mut layers = vec![
        (PathBuf::from("/etc/berth/config.toml"), ConfigLayer::System),
        (user_path, ConfigLayer::User),
    ];
    if let Some(path) = explicit {
        layers.push((path.to_path_buf(), ConfigLayer::Explicit));
    }

    for (path, layer) in layers {
        // An explicitly named file must exist.
        let overlay = if layer == ConfigLayer::Explicit {
            Some(read_file(&path)?)
        } else {
            try_load_file(&path)?
        };
        if let Some(overlay) = overlay {
            deep_merge_tracking(&mut merged, &overlay, "", &layer, &mut field_sources);
            loaded_files.push(path.display().to_string());
            info!(path = %path.display(), layer = %layer, "loaded config");
        }
    }

    let env_count = apply_env_overrides(&mut merged, &mut field_sources, &env_vars)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable overrides");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Load a config from one file layered over the embedded defaults.
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed, or the
/// result fails validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let mut merged = defaults_value()?;
    let overlay = read_file(path)?;
    let mut sources = FieldSources::new();
    deep_merge_tracking(&mut merged, &overlay, "", &ConfigLayer::Explicit, &mut sources);

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: path.display().to_string(),
                source: e,
            })?;

    validate::validate(&config)?;
    Ok(config)
}

fn defaults_value() -> ConfigResult<toml::Value> {
    toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
        path: "<embedded defaults>".to_owned(),
        source: e,
    })
}

/// Read and parse a file that must exist.
fn read_file(path: &Path) -> ConfigResult<toml::Value> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_content(path, &content),
        Err(e) => Err(ConfigError::ReadError {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

/// Try to load a file, returning `None` if the file doesn't exist.
///
/// Uses a single read operation to avoid TOCTOU races (no separate
/// exists/metadata checks before reading).
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };
    parse_content(path, &content).map(Some)
}

fn parse_content(path: &Path, content: &str) -> ConfigResult<toml::Value> {
    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }

    toml::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })
}

/// `$BERTH_HOME/config.toml`, else `~/.berth/config.toml`.
fn user_config_path(berth_home: Option<&str>) -> ConfigResult<PathBuf> {
    if let Some(home) = berth_home.filter(|h| Path::new(h).is_absolute()) {
        return Ok(PathBuf::from(home).join("config.toml"));
    }
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".berth").join("config.toml"))
        .ok_or(ConfigError::NoHomeDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeploymentMode;

    #[test]
    fn defaults_match_default_impls() {
        let config: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config, Config::default());
        assert!(validate::validate(&config).is_ok());
    }

    #[test]
    fn user_layer_overrides_defaults() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            r#"
            [restart]
            restart_on_crash = false

            [deployment]
            mode = "multi_client"
            administrators = ["root"]
            "#,
        )
        .unwrap();

        let resolved = load(None, Some(home.path())).unwrap();
        assert!(!resolved.config.restart.restart_on_crash);
        assert!(resolved.config.restart.shutdown_on_idle);
        assert_eq!(resolved.config.deployment.mode, DeploymentMode::MultiClient);
        assert_eq!(
            resolved.field_sources.get("restart.restart_on_crash"),
            Some(&ConfigLayer::User)
        );
        assert!(
            resolved
                .loaded_files
                .iter()
                .any(|f| f.ends_with("config.toml"))
        );
    }

    #[test]
    fn explicit_layer_beats_user_layer() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[timeouts]\nstop_grace_secs = 9\n",
        )
        .unwrap();
        let explicit = home.path().join("explicit.toml");
        std::fs::write(&explicit, "[timeouts]\nstop_grace_secs = 2\n").unwrap();

        let resolved = load(Some(&explicit), Some(home.path())).unwrap();
        assert_eq!(resolved.config.timeouts.stop_grace_secs, 2);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let home = tempfile::tempdir().unwrap();
        let result = load(Some(Path::new("/nonexistent/berth.toml")), Some(home.path()));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn load_file_layers_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        std::fs::write(&path, "[cache]\nmax_size_bytes = 1024\n").unwrap();
        let config = load_file(&path).unwrap();
        assert_eq!(config.cache.max_size_bytes, 1024);
        assert_eq!(config.timeouts.start_announce_secs, 10);
    }

    #[test]
    fn test_try_load_file_missing() {
        let result = try_load_file(Path::new("/nonexistent/config.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_oversized_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("huge.toml");
        let data = "x = \"".to_owned() + &"a".repeat(1_100_000) + "\"";
        std::fs::write(&file_path, data).unwrap();

        let result = try_load_file(&file_path);
        assert!(
            matches!(result, Err(ConfigError::ValidationError { .. })),
            "Expected ValidationError for oversized config, got: {result:?}"
        );
    }

    #[test]
    fn invalid_values_fail_validation() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[timeouts]\nstart_announce_secs = 0\n",
        )
        .unwrap();
        let result = load(None, Some(home.path()));
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }
}
