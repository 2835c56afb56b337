//! On-disk index of cached artifacts.
//!
//! The index (`index.toml` in the cache root) uses `schema_version = 1` and a
//! flat `[[artifact]]` array of [`CacheEntry`] records.

use std::path::PathBuf;

use berth_core::{ComponentId, ComponentKind, Target, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::integrity::Integrity;
use crate::persist::StateFile;
use crate::source::ArtifactSource;

/// Identity of a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Component id.
    pub component_id: ComponentId,
    /// Component version.
    pub version: Version,
    /// Build target of the artifact.
    pub target: Target,
}

impl CacheKey {
    /// Create a key.
    #[must_use]
    pub fn new(component_id: ComponentId, version: Version, target: Target) -> Self {
        Self {
            component_id,
            version,
            target,
        }
    }

    /// Directory of this artifact relative to the cache root.
    #[must_use]
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(self.component_id.fs_name())
            .join(self.version.to_string())
            .join(sanitize_segment(self.target.as_str()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} ({})", self.component_id, self.version, self.target)
    }
}

fn sanitize_segment(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// One cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Identity.
    #[serde(flatten)]
    pub key: CacheKey,
    /// Frontend or backend.
    pub kind: ComponentKind,
    /// Where the artifact was fetched from.
    pub source: ArtifactSource,
    /// Hash the artifact was verified against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,
    /// Bytes on disk.
    pub size_bytes: u64,
    /// Executable or extracted directory, relative to the cache root.
    pub path: PathBuf,
    /// When the artifact was stored.
    pub stored_at: DateTime<Utc>,
    /// Last time the artifact was resolved or launched.
    pub last_used: DateTime<Utc>,
}

/// The persisted cache index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheIndex {
    schema_version: u32,
    #[serde(default, rename = "artifact")]
    pub(crate) entries: Vec<CacheEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            entries: Vec::new(),
        }
    }
}

impl StateFile for CacheIndex {
    const SCHEMA_VERSION: u32 = 1;
    const KIND: &'static str = "cache index";

    fn schema_version(&self) -> u32 {
        self.schema_version
    }
}

impl CacheIndex {
    pub(crate) fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.key == *key)
    }

    pub(crate) fn get_mut(&mut self, key: &CacheKey) -> Option<&mut CacheEntry> {
        self.entries.iter_mut().find(|e| e.key == *key)
    }

    /// Insert or replace.
    pub(crate) fn upsert(&mut self, entry: CacheEntry) {
        self.remove(&entry.key);
        self.entries.push(entry);
    }

    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let pos = self.entries.iter().position(|e| e.key == *key)?;
        Some(self.entries.remove(pos))
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.entries
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.size_bytes))
    }
}
