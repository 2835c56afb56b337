use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// File that failed.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A config file is not valid TOML or does not match the schema.
    #[error("failed to parse config {path}: {source}")]
    ParseError {
        /// File (or pseudo-source) that failed.
        path: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A value is out of range or inconsistent with another.
    #[error("invalid config value for {field}: {message}")]
    ValidationError {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// An environment override could not be applied.
    #[error("invalid environment override {var}: {message}")]
    EnvError {
        /// Variable name.
        var: String,
        /// What is wrong with it.
        message: String,
    },

    /// No home directory could be determined.
    #[error("could not determine the home directory")]
    NoHomeDir,

    /// Serializing the effective configuration failed.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
