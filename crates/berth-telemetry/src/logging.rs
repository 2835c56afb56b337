//! Logging configuration and setup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::{self, MakeWriter, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{TelemetryError, TelemetryResult};

/// File rotation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    /// Rotate daily.
    #[default]
    Daily,
    /// Rotate hourly.
    Hourly,
    /// Never rotate.
    Never,
}

impl FileRotation {
    fn to_rotation(self) -> Rotation {
        match self {
            Self::Daily => Rotation::DAILY,
            Self::Hourly => Rotation::HOURLY,
            Self::Never => Rotation::NEVER,
        }
    }
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line format with colors.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
    /// Full single-line format with all fields.
    Full,
}

impl std::str::FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            "full" => Ok(Self::Full),
            other => Err(TelemetryError::ConfigError(format!(
                "unknown log format '{other}'"
            ))),
        }
    }
}

/// Log output target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Log to stdout.
    Stdout,
    /// Log to stderr. Component endpoints are announced on stdout, so the
    /// manager itself defaults to stderr.
    #[default]
    Stderr,
    /// Log to rotating files in this directory.
    File(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (e.g., "info", "debug", "trace").
    #[serde(default = "default_level")]
    pub level: String,
    /// Log format.
    #[serde(default)]
    pub format: LogFormat,
    /// Log target.
    #[serde(default)]
    pub target: LogTarget,
    /// File name prefix when logging to files.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Rotation when logging to files.
    #[serde(default)]
    pub rotation: FileRotation,
    /// Whether to include timestamps.
    #[serde(default = "default_true")]
    pub timestamps: bool,
    /// Whether to include file/line info.
    #[serde(default)]
    pub include_location: bool,
    /// Whether to log span open/close events.
    #[serde(default)]
    pub include_spans: bool,
    /// Whether to use ANSI colors.
    #[serde(default = "default_true")]
    pub ansi: bool,
    /// Directive overrides (e.g., `berth_components=debug`).
    #[serde(default)]
    pub directives: Vec<String>,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_file_prefix() -> String {
    "berth".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            file_prefix: default_file_prefix(),
            rotation: FileRotation::default(),
            timestamps: true,
            include_location: false,
            include_spans: false,
            ansi: true,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Create a new log config with the specified level.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Default config whose level comes from `RUST_LOG` when set.
    #[must_use]
    pub fn from_env_or_default() -> Self {
        match std::env::var("RUST_LOG") {
            Ok(level) if !level.trim().is_empty() => Self::new(level),
            _ => Self::default(),
        }
    }

    /// Set the log format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the log target.
    #[must_use]
    pub fn with_target(mut self, target: LogTarget) -> Self {
        self.target = target;
        self
    }

    /// Log to daily-rotated files in `directory`.
    #[must_use]
    pub fn with_file_logging(mut self, directory: impl Into<PathBuf>) -> Self {
        self.target = LogTarget::File(directory.into());
        self.rotation = FileRotation::Daily;
        self.ansi = false;
        self
    }

    /// Add a directive override.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Disable timestamps.
    #[must_use]
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    /// Enable file/line info.
    #[must_use]
    pub fn with_location(mut self) -> Self {
        self.include_location = true;
        self
    }

    /// Disable ANSI colors.
    #[must_use]
    pub fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }

    /// Build the env filter from config.
    fn build_filter(&self) -> TelemetryResult<EnvFilter> {
        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| TelemetryError::ConfigError(e.to_string()))?;

        for directive in &self.directives {
            filter = filter.add_directive(directive.parse().map_err(
                |e: tracing_subscriber::filter::ParseError| {
                    TelemetryError::ConfigError(e.to_string())
                },
            )?);
        }

        Ok(filter)
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

#[cfg(feature = "config")]
impl From<&berth_config::LoggingSection> for LogConfig {
    fn from(section: &berth_config::LoggingSection) -> Self {
        let mut config = Self::new(section.level.clone())
            .with_format(section.format.parse().unwrap_or(LogFormat::Compact));
        config.directives.clone_from(&section.directives);
        if let Some(dir) = &section.file_dir {
            config = config.with_file_logging(dir);
        }
        config
    }
}

/// Set up logging with the given configuration.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the log directory
/// cannot be created, or a global subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.build_filter()?;

    match &config.target {
        LogTarget::Stdout => install(filter, config, std::io::stdout),
        LogTarget::Stderr => install(filter, config, std::io::stderr),
        LogTarget::File(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                TelemetryError::ConfigError(format!("failed to create log directory: {e}"))
            })?;
            let appender =
                RollingFileAppender::new(config.rotation.to_rotation(), dir, &config.file_prefix);
            install(filter, config, appender)
        },
    }
}

fn install<W>(filter: EnvFilter, config: &LogConfig, writer: W) -> TelemetryResult<()>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(config, writer))
        .try_init()
        .map_err(|e| TelemetryError::InitError(e.to_string()))
}

/// One boxed `fmt` layer for every format/timestamp combination.
fn fmt_layer<S, W>(config: &LogConfig, writer: W) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(config.ansi)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(config.span_events());

    match (config.format, config.timestamps) {
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
        (LogFormat::Pretty, true) => base.pretty().boxed(),
        (LogFormat::Pretty, false) => base.pretty().without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().boxed(),
        (LogFormat::Compact, false) => base.compact().without_time().boxed(),
        (LogFormat::Full, true) => base.boxed(),
        (LogFormat::Full, false) => base.without_time().boxed(),
    }
}
