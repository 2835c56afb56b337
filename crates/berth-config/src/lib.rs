#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Layered configuration for Berth.
//!
//! # Usage
//!
//! ```rust,no_run
//! use berth_config::Config;
//!
//! let resolved = Config::load(None).unwrap();
//! println!("cache limit: {} bytes", resolved.config.cache.max_size_bytes);
//! ```
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Environment variables** (`BERTH_*`)
//! 2. **Explicit file** (`--config <path>`)
//! 3. **User** (`$BERTH_HOME/config.toml`, default `~/.berth/config.toml`)
//! 4. **System** (`/etc/berth/config.toml`)
//! 5. **Embedded defaults** (`defaults.toml` compiled into binary)
//!
//! This crate has no dependencies on other internal berth crates. Conversion
//! to domain types happens where the manager is assembled.

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Layered configuration merging.
pub mod merge;
/// Resolved configuration display.
pub mod show;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use merge::ConfigLayer;
pub use show::ResolvedConfig;
pub use types::*;

impl Config {
    /// Load configuration with the full precedence chain.
    ///
    /// `explicit` is an additional file layered above the user config.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(explicit: Option<&std::path::Path>) -> ConfigResult<ResolvedConfig> {
        loader::load(explicit, None)
    }

    /// Load configuration with an explicit Berth home directory.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load_with_home(
        explicit: Option<&std::path::Path>,
        berth_home: &std::path::Path,
    ) -> ConfigResult<ResolvedConfig> {
        loader::load(explicit, Some(berth_home))
    }

    /// Load configuration from a single file layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load_file(path: &std::path::Path) -> ConfigResult<Self> {
        loader::load_file(path)
    }
}
