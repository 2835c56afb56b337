use crate::error::ConfigResult;
use crate::merge::FieldSources;
use crate::types::Config;

/// The effective configuration plus where its values came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The merged, validated configuration.
    pub config: Config,
    /// Layer that set each dotted field path.
    pub field_sources: FieldSources,
    /// Files that contributed, lowest precedence first.
    pub loaded_files: Vec<String>,
}

impl ResolvedConfig {
    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(&self.config)?)
    }

    /// Render `field = value  # layer` lines, sorted by field.
    #[must_use]
    pub fn annotated_sources(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .field_sources
            .iter()
            .map(|(field, layer)| format!("{field}  # {layer}"))
            .collect();
        lines.sort();
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::ConfigLayer;

    #[test]
    fn effective_config_renders_as_toml() {
        let mut sources = FieldSources::new();
        sources.insert("cache.max_size_bytes".into(), ConfigLayer::Defaults);
        let resolved = ResolvedConfig {
            config: Config::default(),
            field_sources: sources,
            loaded_files: Vec::new(),
        };
        let text = resolved.to_toml_string().unwrap();
        assert!(text.contains("[timeouts]"));
        assert!(text.contains("restart_on_crash = true"));
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back, Config::default());
        assert_eq!(
            resolved.annotated_sources(),
            vec!["cache.max_size_bytes  # defaults".to_owned()]
        );
    }
}
