//! Persistent data directories.
//!
//! Each component gets one data directory per `(scope, componentId, major,
//! minor)`:
//!
//! ```text
//! <root>/<scope|shared>/<component>/v<major>.<minor>/
//! ```
//!
//! `<component>` is [`ComponentId::fs_name`], not the raw id: plain ids are
//! kept verbatim, anything else (`ant://notes/backend`) is sanitised and
//! given a digest suffix.
//!
//! Patch releases share a directory; any minor or major change gets a fresh
//! one. Side-by-side instances of different majors therefore never share
//! data. Moving data between directories is left to a [`MigrationHook`];
//! the manager uses [`NoMigration`] unless configured otherwise.

use std::path::{Path, PathBuf};

use berth_core::{ComponentId, Scope, Version};
use tracing::{debug, info};

use crate::error::{ComponentError, ComponentResult};

/// The identity a data directory is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataDirectoryKey {
    /// Owning scope.
    pub scope: Scope,
    /// Component id.
    pub component_id: ComponentId,
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl DataDirectoryKey {
    /// The key for `version` of `component_id` in `scope`.
    #[must_use]
    pub fn new(scope: Scope, component_id: ComponentId, version: &Version) -> Self {
        let (major, minor) = version.major_minor();
        Self {
            scope,
            component_id,
            major,
            minor,
        }
    }

    /// The directory under `root`. Pure; touches nothing on disk.
    ///
    /// The component segment is [`ComponentId::fs_name`], so ids containing
    /// `/` or `:` still map to a single directory level.
    #[must_use]
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(self.scope.as_segment())
            .join(self.component_id.fs_name())
            .join(format!("v{}.{}", self.major, self.minor))
    }
}

/// Resolve the data directory for a component version. See
/// [`DataDirectoryKey::path`] for how the id becomes a path segment.
#[must_use]
pub fn data_dir(root: &Path, scope: &Scope, component_id: &ComponentId, version: &Version) -> PathBuf {
    DataDirectoryKey::new(scope.clone(), component_id.clone(), version).path(root)
}

/// Moves data when an in-place upgrade changes `major.minor`.
pub trait MigrationHook: Send + Sync {
    /// Prepare `new`'s directory from `old`'s. Called before the new version
    /// starts; an error aborts the upgrade and leaves the old instance running.
    ///
    /// # Errors
    ///
    /// Implementations return an error if migration fails.
    fn migrate(&self, root: &Path, old: &DataDirectoryKey, new: &DataDirectoryKey)
    -> ComponentResult<()>;
}

/// Copies the old directory into the new one if the new one does not exist
/// yet. Existing data is never overwritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyMigration;

impl MigrationHook for CopyMigration {
    fn migrate(
        &self,
        root: &Path,
        old: &DataDirectoryKey,
        new: &DataDirectoryKey,
    ) -> ComponentResult<()> {
        let from = old.path(root);
        let to = new.path(root);
        if to.exists() {
            debug!(path = %to.display(), "Data directory already exists, skipping migration");
            return Ok(());
        }
        if !from.is_dir() {
            debug!(path = %from.display(), "No previous data to migrate");
            return Ok(());
        }
        copy_dir(&from, &to)?;
        info!(
            component_id = %new.component_id,
            from = %from.display(),
            to = %to.display(),
            "Migrated component data"
        );
        Ok(())
    }
}

/// Leaves data untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMigration;

impl MigrationHook for NoMigration {
    fn migrate(&self, _: &Path, _: &DataDirectoryKey, _: &DataDirectoryKey) -> ComponentResult<()> {
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> ComponentResult<()> {
    std::fs::create_dir_all(to).map_err(|e| ComponentError::io(to, &e))?;
    let entries = std::fs::read_dir(from).map_err(|e| ComponentError::io(from, &e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ComponentError::io(from, &e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| ComponentError::io(entry.path(), &e))?;
        let dest = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &dest).map_err(|e| ComponentError::io(&dest, &e))?;
        }
    }
    Ok(())
}
