//! Filesystem-backed content store.
//!
//! Layout:
//!
//! ```text
//! <root>/objects/<aa>/<address>      immutable objects, sharded by prefix
//! <root>/pointers/<component-fs-name> newest history entry address
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use berth_core::ComponentId;
use tracing::debug;

use super::{ContentAddress, ContentStore, WritableStore};
use crate::error::{ComponentError, ComponentResult};

/// A content store rooted at a local directory.
///
/// Used for offline mirrors, for development, and as the publish target of
/// the `berth publish` command.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open a store at `root`. Nothing is created until the first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, address: &ContentAddress) -> PathBuf {
        let hex = address.as_str();
        self.root.join("objects").join(&hex[..2]).join(hex)
    }

    fn pointer_path(&self, component: &ComponentId) -> PathBuf {
        self.root.join("pointers").join(component.fs_name())
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> ComponentResult<()> {
        let parent = path.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ComponentError::io(parent, &e))?;
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| ComponentError::io(&tmp, &e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| ComponentError::io(path, &e))
    }
}

#[async_trait]
impl ContentStore for DirectoryStore {
    async fn get(&self, address: &ContentAddress) -> ComponentResult<Vec<u8>> {
        let path = self.object_path(address);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ComponentError::Store {
                address: address.to_string(),
                message: format!("cannot read {}: {e}", path.display()),
            })?;
        address.verify(&bytes)?;
        Ok(bytes)
    }

    async fn latest(&self, component: &ComponentId) -> ComponentResult<Option<ContentAddress>> {
        let path = self.pointer_path(component);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => content.trim().parse().map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ComponentError::Store {
                address: path.display().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl WritableStore for DirectoryStore {
    async fn put(&self, bytes: &[u8]) -> ComponentResult<ContentAddress> {
        let address = ContentAddress::of(bytes);
        let path = self.object_path(&address);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(address);
        }
        Self::write_atomic(&path, bytes).await?;
        debug!(%address, size = bytes.len(), "Stored object");
        Ok(address)
    }

    async fn set_latest(
        &self,
        component: &ComponentId,
        entry: &ContentAddress,
    ) -> ComponentResult<()> {
        let path = self.pointer_path(component);
        Self::write_atomic(&path, entry.as_str().as_bytes()).await?;
        debug!(component_id = %component, %entry, "Updated latest pointer");
        Ok(())
    }
}
