//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges and that cross-field invariants hold.

use crate::error::{ConfigError, ConfigResult};
use crate::types::{Config, DeploymentMode};

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_cache(config)?;
    validate_timeouts(config)?;
    validate_restart(config)?;
    validate_history(config)?;
    validate_network(config)?;
    validate_deployment(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

/// Smallest cache worth running with (1 MiB).
const MIN_CACHE_BYTES: u64 = 1024 * 1024;

fn validate_cache(config: &Config) -> ConfigResult<()> {
    if config.cache.max_size_bytes < MIN_CACHE_BYTES {
        return Err(invalid(
            "cache.max_size_bytes",
            format!("must be at least {MIN_CACHE_BYTES} bytes"),
        ));
    }
    Ok(())
}

fn validate_timeouts(config: &Config) -> ConfigResult<()> {
    let t = &config.timeouts;
    for (field, value) in [
        ("timeouts.start_announce_secs", t.start_announce_secs),
        ("timeouts.stop_grace_secs", t.stop_grace_secs),
        ("timeouts.control_call_secs", t.control_call_secs),
        ("timeouts.history_fetch_secs", t.history_fetch_secs),
    ] {
        if value == 0 {
            return Err(invalid(field, "timeout must be greater than zero"));
        }
        if value > 3600 {
            return Err(invalid(field, "timeout must not exceed one hour"));
        }
    }
    Ok(())
}

fn validate_restart(config: &Config) -> ConfigResult<()> {
    let r = &config.restart;
    if r.restart_window_secs == 0 {
        return Err(invalid(
            "restart.restart_window_secs",
            "restart window must be greater than zero",
        ));
    }
    let b = &r.backoff;
    if b.initial_delay_ms == 0 {
        return Err(invalid(
            "restart.backoff.initial_delay_ms",
            "initial delay must be greater than zero",
        ));
    }
    if b.max_delay_ms < b.initial_delay_ms {
        return Err(invalid(
            "restart.backoff.max_delay_ms",
            format!(
                "max delay ({}) is below the initial delay ({})",
                b.max_delay_ms, b.initial_delay_ms
            ),
        ));
    }
    if !b.multiplier.is_finite() || b.multiplier < 1.0 {
        return Err(invalid(
            "restart.backoff.multiplier",
            "multiplier must be a finite number >= 1.0",
        ));
    }
    Ok(())
}

fn validate_history(config: &Config) -> ConfigResult<()> {
    if config.history.max_depth == 0 {
        return Err(invalid(
            "history.max_depth",
            "max depth must be greater than zero",
        ));
    }
    Ok(())
}

fn validate_network(config: &Config) -> ConfigResult<()> {
    if let Some(raw) = &config.network.gateway_url {
        let url = url::Url::parse(raw)
            .map_err(|e| invalid("network.gateway_url", format!("'{raw}' is not a URL: {e}")))?;
        let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
        if url.scheme() != "https" && !(url.scheme() == "http" && loopback) {
            return Err(invalid(
                "network.gateway_url",
                "gateway must use https (plain http is only allowed for loopback hosts)",
            ));
        }
    }
    if config.network.max_download_bytes == 0 {
        return Err(invalid(
            "network.max_download_bytes",
            "download limit must be greater than zero",
        ));
    }
    Ok(())
}

fn validate_deployment(config: &Config) -> ConfigResult<()> {
    let d = &config.deployment;
    if d.mode == DeploymentMode::MultiClient && d.administrators.is_empty() {
        return Err(invalid(
            "deployment.administrators",
            "multi-client deployments need at least one administrator",
        ));
    }
    if d.default_scope.is_empty() || d.default_scope.contains(['/', '\\']) {
        return Err(invalid(
            "deployment.default_scope",
            "scope must be a single path segment",
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !matches!(
        l.level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(invalid(
            "logging.level",
            format!(
                "unknown level '{}'; expected trace, debug, info, warn or error",
                l.level
            ),
        ));
    }
    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(invalid(
            "logging.format",
            format!(
                "unknown format '{}'; expected pretty, compact, json or full",
                l.format
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(result: ConfigResult<()>) -> String {
        match result {
            Err(ConfigError::ValidationError { field, .. }) => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn zero_timeouts_rejected() {
        let mut config = Config::default();
        config.timeouts.stop_grace_secs = 0;
        assert_eq!(field_of(validate(&config)), "timeouts.stop_grace_secs");
    }

    #[test]
    fn backoff_bounds_checked() {
        let mut config = Config::default();
        config.restart.backoff.max_delay_ms = 10;
        assert_eq!(field_of(validate(&config)), "restart.backoff.max_delay_ms");

        let mut config = Config::default();
        config.restart.backoff.multiplier = 0.5;
        assert_eq!(field_of(validate(&config)), "restart.backoff.multiplier");
    }

    #[test]
    fn gateway_must_be_https() {
        let mut config = Config::default();
        config.network.gateway_url = Some("http://gateway.example.org".into());
        assert_eq!(field_of(validate(&config)), "network.gateway_url");

        config.network.gateway_url = Some("http://127.0.0.1:8080".into());
        assert!(validate(&config).is_ok());

        config.network.gateway_url = Some("https://gateway.example.org".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn multi_client_requires_administrators() {
        let mut config = Config::default();
        config.deployment.mode = DeploymentMode::MultiClient;
        assert_eq!(field_of(validate(&config)), "deployment.administrators");
        config.deployment.administrators.push("root".into());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        assert_eq!(field_of(validate(&config)), "logging.format");
    }
}
