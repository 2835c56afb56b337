//! Configuration types for Berth.
//!
//! Every struct implements [`Default`] with the same values as the embedded
//! `defaults.toml`, so a bare `[section]` header produces a working
//! configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local artifact cache.
    pub cache: CacheSection,
    /// Independent timeouts for start, stop, control calls and history reads.
    pub timeouts: TimeoutsSection,
    /// Default restart policy and crash-loop guard.
    pub restart: RestartSection,
    /// Per-component policy overrides keyed by component id.
    pub components: HashMap<String, ComponentPolicySection>,
    /// Remote version history traversal.
    pub history: HistorySection,
    /// Content network access.
    pub network: NetworkSection,
    /// Development conveniences.
    pub development: DevelopmentSection,
    /// Single-process or multi-client deployment.
    pub deployment: DeploymentSection,
    /// Component data directories.
    pub data: DataSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

impl Config {
    /// The restart policy in effect for `component_id`.
    #[must_use]
    pub fn policy_for(&self, component_id: &str) -> EffectivePolicy {
        let base = EffectivePolicy {
            restart_on_crash: self.restart.restart_on_crash,
            shutdown_on_idle: self.restart.shutdown_on_idle,
        };
        match self.components.get(component_id) {
            Some(over) => EffectivePolicy {
                restart_on_crash: over.restart_on_crash.unwrap_or(base.restart_on_crash),
                shutdown_on_idle: over.shutdown_on_idle.unwrap_or(base.shutdown_on_idle),
            },
            None => base,
        }
    }
}

/// Restart policy after per-component overrides are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectivePolicy {
    /// Restart the component after an unexpected exit.
    pub restart_on_crash: bool,
    /// Stop the component once nothing references it.
    pub shutdown_on_idle: bool,
}

// ---------------------------------------------------------------------------
// CacheSection
// ---------------------------------------------------------------------------

/// Local artifact cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Size above which least-recently-used artifacts are evicted.
    pub max_size_bytes: u64,
    /// Cache directory. `None` uses `$BERTH_HOME/cache/components`.
    pub dir: Option<String>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_size_bytes: 500 * 1024 * 1024,
            dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutsSection
// ---------------------------------------------------------------------------

/// Timeout budgets. All values are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    /// How long a started component may take to announce its endpoint.
    pub start_announce_secs: u64,
    /// How long a component may take to exit after a stop call.
    pub stop_grace_secs: u64,
    /// Budget for a single status or stop call.
    pub control_call_secs: u64,
    /// Budget for a full remote history traversal.
    pub history_fetch_secs: u64,
}

impl TimeoutsSection {
    /// Start announcement timeout.
    #[must_use]
    pub fn start_announce(&self) -> Duration {
        Duration::from_secs(self.start_announce_secs)
    }

    /// Graceful stop period.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Control call timeout.
    #[must_use]
    pub fn control_call(&self) -> Duration {
        Duration::from_secs(self.control_call_secs)
    }

    /// Remote history timeout.
    #[must_use]
    pub fn history_fetch(&self) -> Duration {
        Duration::from_secs(self.history_fetch_secs)
    }
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            start_announce_secs: 10,
            stop_grace_secs: 5,
            control_call_secs: 3,
            history_fetch_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// RestartSection
// ---------------------------------------------------------------------------

/// Default restart policy and crash-loop guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSection {
    /// Restart a component after an unexpected exit.
    pub restart_on_crash: bool,
    /// Stop a component once its reference count drops to zero.
    pub shutdown_on_idle: bool,
    /// Crashes tolerated inside `restart_window_secs` before giving up.
    pub max_restarts: u32,
    /// Sliding window for `max_restarts`.
    pub restart_window_secs: u64,
    /// A run at least this long resets the crash count.
    pub min_uptime_secs: u64,
    /// Delay between automatic restarts.
    pub backoff: BackoffSection,
}

impl Default for RestartSection {
    fn default() -> Self {
        Self {
            restart_on_crash: true,
            shutdown_on_idle: true,
            max_restarts: 5,
            restart_window_secs: 60,
            min_uptime_secs: 2,
            backoff: BackoffSection::default(),
        }
    }
}

/// How the delay grows between consecutive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always `initial_delay_ms`.
    Fixed,
    /// `initial_delay_ms * multiplier^attempt`.
    Exponential,
    /// `initial_delay_ms * attempt`.
    Linear,
}

/// Restart backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    /// Growth strategy.
    pub strategy: BackoffStrategy,
    /// First delay.
    pub initial_delay_ms: u64,
    /// Upper bound on any delay.
    pub max_delay_ms: u64,
    /// Growth factor for the exponential strategy.
    pub multiplier: f64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Per-component policy override. Unset fields inherit `[restart]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentPolicySection {
    /// Override for `restart.restart_on_crash`.
    pub restart_on_crash: Option<bool>,
    /// Override for `restart.shutdown_on_idle`.
    pub shutdown_on_idle: Option<bool>,
}

// ---------------------------------------------------------------------------
// HistorySection
// ---------------------------------------------------------------------------

/// Remote version history traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// Maximum entries followed in one traversal.
    pub max_depth: u32,
    /// Always consult the remote history, even on a cache hit.
    pub refresh: bool,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            max_depth: 10_000,
            refresh: false,
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkSection
// ---------------------------------------------------------------------------

/// Content network access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// HTTPS gateway of the content network. `None` disables remote access.
    pub gateway_url: Option<String>,
    /// Local content store directory. Used when no gateway is configured.
    pub store_dir: Option<String>,
    /// Upper bound on a single downloaded artifact.
    pub max_download_bytes: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            gateway_url: None,
            store_dir: None,
            max_download_bytes: 512 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// DevelopmentSection
// ---------------------------------------------------------------------------

/// Development conveniences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevelopmentSection {
    /// Accept `file://` artifact sources. These skip integrity hashing.
    pub allow_local_paths: bool,
}

// ---------------------------------------------------------------------------
// DeploymentSection
// ---------------------------------------------------------------------------

/// How many clients share this host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// One user, one host process.
    #[default]
    SingleProcess,
    /// A server host shared by several users.
    MultiClient,
}

/// Deployment settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSection {
    /// Deployment mode.
    pub mode: DeploymentMode,
    /// Users allowed to trigger a host restart in multi-client mode.
    pub administrators: Vec<String>,
    /// Data scope used when a caller does not name one.
    pub default_scope: String,
}

impl Default for DeploymentSection {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::SingleProcess,
            administrators: Vec::new(),
            default_scope: "shared".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// DataSection
// ---------------------------------------------------------------------------

/// Component data directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    /// Root of all data directories. `None` uses `$BERTH_HOME/data`.
    pub root: Option<String>,
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"`, or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["berth_components=debug"]`).
    pub directives: Vec<String>,
    /// Write logs to daily-rotated files in this directory instead of stderr.
    pub file_dir: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
            file_dir: None,
        }
    }
}
