//! Directory layout for Berth state.
//!
//! # Layout
//!
//! ```text
//! ~/.berth/                       (BerthHome)
//! ├── cache/
//! │   ├── components/               (artifact cache + index.toml)
//! │   └── history/                  (verified history entries and manifests)
//! ├── data/                         (per-component data directories)
//! ├── logs/                         (log files)
//! ├── store/                        (local content store for development)
//! ├── overrides.toml                (pinned component versions)
//! └── config.toml                   (user config)
//! ```

use std::io;
use std::path::{Path, PathBuf};

/// Berth home directory (`~/.berth/` or `$BERTH_HOME`).
#[derive(Debug, Clone)]
pub struct BerthHome {
    root: PathBuf,
}

impl BerthHome {
    /// Resolve the home directory.
    ///
    /// Checks `$BERTH_HOME` first, then falls back to `$HOME/.berth/`.
    ///
    /// # Errors
    ///
    /// Returns an error if neither `$BERTH_HOME` nor `$HOME` is set, or if
    /// `$BERTH_HOME` is relative.
    pub fn resolve() -> io::Result<Self> {
        let root = if let Ok(custom) = std::env::var("BERTH_HOME") {
            let p = PathBuf::from(&custom);
            if !p.is_absolute() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "BERTH_HOME must be an absolute path",
                ));
            }
            p
        } else {
            let home = std::env::var("HOME").map_err(|_| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "neither BERTH_HOME nor HOME environment variable is set",
                )
            })?;
            PathBuf::from(home).join(".berth")
        };

        Ok(Self { root })
    }

    /// Create from an explicit path (useful for testing).
    #[must_use]
    pub fn from_path(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ensure the directory structure exists.
    ///
    /// The root is restricted to `0o700` on Unix.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation or permission setting fails.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.component_cache_dir())?;
        std::fs::create_dir_all(self.history_cache_dir())?;
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(self.root(), std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    /// Root directory path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Artifact cache directory (`~/.berth/cache/components/`).
    #[must_use]
    pub fn component_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("components")
    }

    /// Verified history cache (`~/.berth/cache/history/`).
    #[must_use]
    pub fn history_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("history")
    }

    /// Root of component data directories (`~/.berth/data/`).
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Logs directory (`~/.berth/logs/`).
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Local content store used in development (`~/.berth/store/`).
    #[must_use]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    /// Path to the version override file.
    #[must_use]
    pub fn overrides_path(&self) -> PathBuf {
        self.root.join("overrides.toml")
    }

    /// Path to the user configuration file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let home = BerthHome::from_path(dir.path().join("berth"));
        home.ensure().unwrap();

        assert!(home.component_cache_dir().is_dir());
        assert!(home.history_cache_dir().is_dir());
        assert!(home.data_dir().is_dir());
        assert!(home.logs_dir().is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(home.root()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn paths_are_under_root() {
        let home = BerthHome::from_path("/tmp/berth-test");
        assert_eq!(home.config_path(), PathBuf::from("/tmp/berth-test/config.toml"));
        assert_eq!(
            home.overrides_path(),
            PathBuf::from("/tmp/berth-test/overrides.toml")
        );
        assert!(home.store_dir().starts_with(home.root()));
    }
}
