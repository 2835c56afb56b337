//! Remote version history.
//!
//! Every published release of a component is a chain of immutable objects in
//! the content store:
//!
//! ```text
//! latest pointer ──► HistoryEntry(1.3.0) ──previous──► HistoryEntry(1.2.1) ──► ...
//!                         │                                 │
//!                         ▼                                 ▼
//!                  ReleaseManifest(1.3.0)            ReleaseManifest(1.2.1)
//! ```
//!
//! Entries and manifests are content addressed, so once one has been read and
//! verified it never changes. [`VersionHistory`] keeps them in memory and in an
//! on-disk cache and only re-reads the mutable latest pointer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth_core::{ComponentId, ComponentKind, Target, Version};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::descriptor::ArtifactRef;
use crate::error::{ComponentError, ComponentResult};
use crate::integrity::Integrity;
use crate::source::ArtifactSource;
use crate::store::{ContentAddress, ContentStore, WritableStore};

/// One link in a component's release chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Component this entry belongs to.
    pub component_id: ComponentId,
    /// Released version.
    pub version: Version,
    /// Address of the [`ReleaseManifest`].
    pub manifest: ContentAddress,
    /// Address of the previous entry, `None` for the first release.
    #[serde(default)]
    pub previous: Option<ContentAddress>,
    /// Publication time.
    pub published_at: DateTime<Utc>,
}

/// Artifacts of one released version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseManifest {
    /// Component id.
    pub component_id: ComponentId,
    /// Released version.
    pub version: Version,
    /// Frontend or backend.
    pub kind: ComponentKind,
    /// One artifact per build target.
    pub artifacts: Vec<ArtifactRecord>,
}

/// A single build of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    /// Build target, or `any`.
    pub target: Target,
    /// Where to download it.
    pub source: ArtifactSource,
    /// Declared hash.
    pub integrity: Integrity,
    /// Size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
}

impl ReleaseManifest {
    /// The artifact serving `wanted`, preferring an exact target over `any`.
    #[must_use]
    pub fn artifact_for(&self, wanted: &Target) -> Option<&ArtifactRecord> {
        self.artifacts
            .iter()
            .find(|a| &a.target == wanted)
            .or_else(|| self.artifacts.iter().find(|a| a.target.satisfies(wanted)))
    }
}

impl ArtifactRecord {
    /// The fetchable reference for this record.
    #[must_use]
    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            source: self.source.clone(),
            integrity: Some(self.integrity.clone()),
            size: self.size,
        }
    }
}

/// A version found while walking the history chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownVersion {
    /// Released version.
    pub version: Version,
    /// Address of its history entry.
    pub entry: ContentAddress,
    /// Address of its release manifest.
    pub manifest: ContentAddress,
}

/// Cached reader of remote version histories.
pub struct VersionHistory {
    store: Arc<dyn ContentStore>,
    cache_dir: Option<PathBuf>,
    max_depth: u32,
    timeout: Duration,
    entries: Mutex<HashMap<ContentAddress, HistoryEntry>>,
    manifests: Mutex<HashMap<ContentAddress, ReleaseManifest>>,
}

impl std::fmt::Debug for VersionHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionHistory")
            .field("cache_dir", &self.cache_dir)
            .field("max_depth", &self.max_depth)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl VersionHistory {
    /// Create a reader over `store`.
    ///
    /// `timeout` bounds one full traversal; `max_depth` bounds the number of
    /// entries followed.
    #[must_use]
    pub fn new(store: Arc<dyn ContentStore>, max_depth: u32, timeout: Duration) -> Self {
        Self {
            store,
            cache_dir: None,
            max_depth,
            timeout,
            entries: Mutex::new(HashMap::new()),
            manifests: Mutex::new(HashMap::new()),
        }
    }

    /// Persist verified entries and manifests under `dir`.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Every published version of `component`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::Unreachable`] if the pointer or any entry
    /// cannot be read, and [`ComponentError::Timeout`] if the walk exceeds
    /// its budget.
    pub async fn versions(&self, component: &ComponentId) -> ComponentResult<Vec<KnownVersion>> {
        tokio::time::timeout(self.timeout, self.walk(component))
            .await
            .map_err(|_| ComponentError::Timeout {
                operation: format!("reading version history of {component}"),
                after: self.timeout,
            })?
    }

    async fn walk(&self, component: &ComponentId) -> ComponentResult<Vec<KnownVersion>> {
        let unreachable = |e: ComponentError| ComponentError::Unreachable {
            component: component.clone(),
            message: e.to_string(),
        };

        let Some(head) = self.store.latest(component).await.map_err(unreachable)? else {
            debug!(component_id = %component, "Component has no published history");
            return Ok(Vec::new());
        };

        let mut known = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(head);
        while let Some(address) = next.take() {
            if !visited.insert(address.clone()) {
                warn!(component_id = %component, %address, "History chain loops, stopping walk");
                break;
            }
            if u32::try_from(known.len()).unwrap_or(u32::MAX) >= self.max_depth {
                warn!(
                    component_id = %component,
                    max_depth = self.max_depth,
                    "History walk reached maximum depth"
                );
                break;
            }

            let entry = self.entry(&address).await.map_err(unreachable)?;
            if entry.component_id != *component {
                return Err(ComponentError::Unreachable {
                    component: component.clone(),
                    message: format!(
                        "history entry {address} belongs to {}",
                        entry.component_id
                    ),
                });
            }
            known.push(KnownVersion {
                version: entry.version,
                entry: address,
                manifest: entry.manifest.clone(),
            });
            next = entry.previous;
        }

        debug!(component_id = %component, versions = known.len(), "Walked version history");
        Ok(known)
    }

    /// Read one history entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be fetched or parsed.
    pub async fn entry(&self, address: &ContentAddress) -> ComponentResult<HistoryEntry> {
        if let Some(entry) = lock(&self.entries).get(address) {
            return Ok(entry.clone());
        }
        let entry: HistoryEntry = self.load_object(address, "entry").await?;
        lock(&self.entries).insert(address.clone(), entry.clone());
        Ok(entry)
    }

    /// Read one release manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be fetched or parsed.
    pub async fn manifest(&self, address: &ContentAddress) -> ComponentResult<ReleaseManifest> {
        if let Some(manifest) = lock(&self.manifests).get(address) {
            return Ok(manifest.clone());
        }
        let manifest: ReleaseManifest = self.load_object(address, "manifest").await?;
        lock(&self.manifests).insert(address.clone(), manifest.clone());
        Ok(manifest)
    }

    async fn load_object<T: DeserializeOwned>(
        &self,
        address: &ContentAddress,
        what: &str,
    ) -> ComponentResult<T> {
        let cached_path = self
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{address}.json")));

        if let Some(path) = &cached_path
            && let Ok(bytes) = tokio::fs::read(path).await
        {
            match serde_json::from_slice(&bytes) {
                Ok(value) => return Ok(value),
                Err(e) => warn!(path = %path.display(), error = %e, "Discarding unreadable cached {what}"),
            }
        }

        let bytes = self.store.get(address).await?;
        let value = serde_json::from_slice(&bytes).map_err(|e| ComponentError::Store {
            address: address.to_string(),
            message: format!("malformed {what}: {e}"),
        })?;

        if let Some(path) = &cached_path {
            write_cache_file(path, &bytes).await;
        }
        Ok(value)
    }
}

async fn write_cache_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        warn!(path = %parent.display(), error = %e, "Cannot create history cache directory");
        return;
    }
    let tmp = path.with_extension("partial");
    let result = async {
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }
    .await;
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Cannot write history cache entry");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One artifact to publish.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// Build target.
    pub target: Target,
    /// Artifact bytes: an executable or a gzip tarball.
    pub bytes: Vec<u8>,
}

/// Publish a release: store its artifacts, its manifest, and a new history
/// entry linked to the current head, then move the latest pointer.
///
/// Returns the address of the new history entry.
///
/// # Errors
///
/// Returns an error if any object cannot be written.
pub async fn publish<S: WritableStore + ?Sized>(
    store: &S,
    component: &ComponentId,
    version: Version,
    kind: ComponentKind,
    artifacts: Vec<NewArtifact>,
) -> ComponentResult<ContentAddress> {
    if artifacts.is_empty() {
        return Err(ComponentError::InvalidManifest {
            message: format!("release {component} {version} has no artifacts"),
        });
    }

    let mut records = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let address = store.put(&artifact.bytes).await?;
        records.push(ArtifactRecord {
            target: artifact.target,
            source: ArtifactSource::Network(address),
            integrity: Integrity::blake3(&artifact.bytes),
            size: u64::try_from(artifact.bytes.len()).ok(),
        });
    }

    let manifest = ReleaseManifest {
        component_id: component.clone(),
        version,
        kind,
        artifacts: records,
    };
    let manifest_address = store.put(&to_json(&manifest)?).await?;

    let entry = HistoryEntry {
        component_id: component.clone(),
        version,
        manifest: manifest_address,
        previous: store.latest(component).await?,
        published_at: Utc::now(),
    };
    let entry_address = store.put(&to_json(&entry)?).await?;
    store.set_latest(component, &entry_address).await?;

    tracing::info!(component_id = %component, %version, entry = %entry_address, "Published release");
    Ok(entry_address)
}

fn to_json<T: Serialize>(value: &T) -> ComponentResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ComponentError::InvalidManifest {
        message: format!("cannot serialize: {e}"),
    })
}
