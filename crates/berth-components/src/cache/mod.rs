//! Local artifact cache.
//!
//! Artifacts are stored under `<root>/<component>/<version>/<target>/` and
//! tracked in a persisted index keyed by `(componentId, version, target)`.
//! When the total size exceeds the configured limit the least recently used
//! artifacts are evicted, except those pinned by a running component.

mod index;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use berth_core::{ComponentId, Target, Version};
use chrono::Utc;
use tracing::{debug, info, warn};

pub use index::{CacheEntry, CacheKey};

use crate::error::{ComponentError, ComponentResult};
use crate::persist;
use index::CacheIndex;

/// Name of the index file inside the cache root.
pub const INDEX_FILE_NAME: &str = "index.toml";

/// Size-bounded LRU store of fetched artifacts.
#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    max_size_bytes: u64,
    index: Mutex<CacheIndex>,
    pins: Mutex<HashMap<CacheKey, usize>>,
}

impl ArtifactCache {
    /// Open the cache at `root`, dropping index entries whose files are gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or the index cannot be
    /// read or rewritten.
    pub fn open(root: impl Into<PathBuf>, max_size_bytes: u64) -> ComponentResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ComponentError::io(&root, &e))?;

        let index_path = root.join(INDEX_FILE_NAME);
        let (index, dropped) = persist::update(&index_path, |index: &mut CacheIndex| {
            let before = index.entries.len();
            index.entries.retain(|e| root.join(&e.path).exists());
            Ok(before.saturating_sub(index.entries.len()))
        })?;
        if dropped > 0 {
            warn!(dropped, "Dropped cache index entries with missing files");
        }
        debug!(
            root = %root.display(),
            entries = index.entries.len(),
            size = index.total_size(),
            "Opened artifact cache"
        );

        Ok(Self {
            root,
            max_size_bytes,
            index: Mutex::new(index),
            pins: Mutex::new(HashMap::new()),
        })
    }

    /// Cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Size limit in bytes.
    #[must_use]
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    /// Absolute directory for `key`.
    #[must_use]
    pub fn artifact_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.relative_dir())
    }

    /// Absolute path of an entry's executable or extracted directory.
    #[must_use]
    pub fn entry_path(&self, entry: &CacheEntry) -> PathBuf {
        self.root.join(&entry.path)
    }

    /// Exact lookup.
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        lock(&self.index).get(key).cloned()
    }

    /// Exact lookup that pins the entry before the index is released, so no
    /// eviction can slip in between finding an artifact and protecting it.
    /// The caller owns one pin when `Some` is returned.
    #[must_use]
    pub fn lookup_pinned(&self, key: &CacheKey) -> Option<CacheEntry> {
        let index = lock(&self.index);
        let entry = index.get(key).cloned()?;
        self.pin(key);
        Some(entry)
    }

    /// An entry for `component` at `version` whose target satisfies `target`,
    /// preferring an exact target match.
    #[must_use]
    pub fn lookup_satisfying(
        &self,
        component: &ComponentId,
        version: &Version,
        target: &Target,
    ) -> Option<CacheEntry> {
        let index = lock(&self.index);
        let candidates = index
            .entries
            .iter()
            .filter(|e| e.key.component_id == *component && e.key.version == *version);
        let mut fallback = None;
        for entry in candidates {
            if entry.key.target == *target {
                return Some(entry.clone());
            }
            if fallback.is_none() && entry.key.target.satisfies(target) {
                fallback = Some(entry.clone());
            }
        }
        fallback
    }

    /// Cached versions of `component` usable on `target`.
    #[must_use]
    pub fn versions(&self, component: &ComponentId, target: &Target) -> Vec<Version> {
        let mut versions: Vec<Version> = lock(&self.index)
            .entries
            .iter()
            .filter(|e| e.key.component_id == *component && e.key.target.satisfies(target))
            .map(|e| e.key.version)
            .collect();
        versions.sort_unstable();
        versions.dedup();
        versions
    }

    /// Every entry, most recently used first.
    #[must_use]
    pub fn list(&self) -> Vec<CacheEntry> {
        let mut entries = lock(&self.index).entries.clone();
        entries.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        entries
    }

    /// Total bytes tracked by the index.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        lock(&self.index).total_size()
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut CacheIndex) -> ComponentResult<R>,
    ) -> ComponentResult<R> {
        let mut guard = lock(&self.index);
        let (index, out) = persist::update(&self.index_path(), f)?;
        *guard = index;
        Ok(out)
    }

    /// Record a newly stored artifact, then evict down to the size limit.
    /// The new artifact itself is never evicted here.
    ///
    /// Returns the keys evicted to make room.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn insert(&self, entry: CacheEntry) -> ComponentResult<Vec<CacheKey>> {
        let key = entry.key.clone();
        let size = entry.size_bytes;
        self.mutate(|index| {
            index.upsert(entry);
            Ok(())
        })?;
        info!(artifact = %key, size, "Cached artifact");
        self.evict(Some(&key))
    }

    /// Mark `key` as used now.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn touch(&self, key: &CacheKey) -> ComponentResult<()> {
        self.mutate(|index| {
            if let Some(entry) = index.get_mut(key) {
                entry.last_used = Utc::now();
            }
            Ok(())
        })
    }

    /// Remove one artifact and its files. Pinned artifacts are kept.
    ///
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn remove(&self, key: &CacheKey) -> ComponentResult<bool> {
        let removed = self.mutate(|index| {
            if self.is_pinned(key) {
                debug!(artifact = %key, "Not removing pinned artifact");
                return Ok(None);
            }
            Ok(index.remove(key))
        })?;
        if removed.is_some() {
            self.delete_files(key);
        }
        Ok(removed.is_some())
    }

    /// Remove every unpinned artifact. Returns the keys removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn clear(&self) -> ComponentResult<Vec<CacheKey>> {
        let removed = self.mutate(|index| {
            let pinned = self.pinned_keys();
            let (keep, drop): (Vec<_>, Vec<_>) = index
                .entries
                .drain(..)
                .partition(|e| pinned.contains(&e.key));
            index.entries = keep;
            Ok(drop.into_iter().map(|e| e.key).collect::<Vec<_>>())
        })?;
        for key in &removed {
            self.delete_files(key);
        }
        info!(removed = removed.len(), "Cleared artifact cache");
        Ok(removed)
    }

    /// Evict least recently used unpinned artifacts until the cache fits
    /// its limit. Returns the keys evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn evict_to_limit(&self) -> ComponentResult<Vec<CacheKey>> {
        self.evict(None)
    }

    fn evict(&self, keep: Option<&CacheKey>) -> ComponentResult<Vec<CacheKey>> {
        let limit = self.max_size_bytes;
        let evicted = self.mutate(|index| {
            // Read pins under the index lock; `lookup_pinned` pins under it too.
            let mut pinned = self.pinned_keys();
            if let Some(key) = keep {
                pinned.push(key.clone());
            }
            let mut evicted = Vec::new();
            while index.total_size() > limit {
                let victim = index
                    .entries
                    .iter()
                    .filter(|e| !pinned.contains(&e.key))
                    .min_by_key(|e| e.last_used)
                    .map(|e| e.key.clone());
                let Some(victim) = victim else {
                    warn!(
                        size = index.total_size(),
                        limit, "Cache over limit but every remaining artifact is in use"
                    );
                    break;
                };
                index.remove(&victim);
                evicted.push(victim);
            }
            Ok(evicted)
        })?;
        for key in &evicted {
            self.delete_files(key);
            info!(artifact = %key, "Evicted artifact");
        }
        Ok(evicted)
    }

    /// Protect `key` from eviction. Pins are counted.
    pub fn pin(&self, key: &CacheKey) {
        let mut pins = lock(&self.pins);
        let count = pins.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Release one pin on `key`.
    pub fn unpin(&self, key: &CacheKey) {
        let mut pins = lock(&self.pins);
        if let Some(count) = pins.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pins.remove(key);
            }
        }
    }

    /// Whether a running component holds `key`.
    #[must_use]
    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        lock(&self.pins).contains_key(key)
    }

    fn pinned_keys(&self) -> Vec<CacheKey> {
        lock(&self.pins).keys().cloned().collect()
    }

    fn delete_files(&self, key: &CacheKey) {
        let dir = self.artifact_dir(key);
        if let Err(e) = std::fs::remove_dir_all(&dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %dir.display(), error = %e, "Failed to delete cached artifact");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ArtifactSource;
    use berth_core::ComponentKind;
    use chrono::Duration;

    fn key(id: &'static str, minor: u32) -> CacheKey {
        CacheKey::new(
            ComponentId::from_static(id),
            Version::new(1, minor, 0),
            Target::any(),
        )
    }

    fn store(cache: &ArtifactCache, key: &CacheKey, size: u64, age_secs: i64) {
        let dir = cache.artifact_dir(key);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("artifact"), vec![0u8; 8]).unwrap();
        let when = Utc::now()
            .checked_sub_signed(Duration::seconds(age_secs))
            .unwrap();
        cache
            .insert(CacheEntry {
                key: key.clone(),
                kind: ComponentKind::Backend,
                source: ArtifactSource::LocalPath("/dev/null".into()),
                integrity: None,
                size_bytes: size,
                path: key.relative_dir().join("artifact"),
                stored_at: when,
                last_used: when,
            })
            .unwrap();
    }

    #[test]
    fn versions_filter_by_component_and_target() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path(), 1_000).unwrap();
        store(&cache, &key("a", 1), 1, 0);
        store(&cache, &key("a", 3), 1, 0);
        store(&cache, &key("b", 2), 1, 0);

        let a = ComponentId::from_static("a");
        assert_eq!(
            cache.versions(&a, &Target::new("x86_64-linux")),
            vec![Version::new(1, 1, 0), Version::new(1, 3, 0)]
        );
        assert!(
            cache
                .lookup_satisfying(&a, &Version::new(1, 3, 0), &Target::host())
                .is_some()
        );
    }

    #[test]
    fn evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path(), 250).unwrap();
        store(&cache, &key("old", 0), 100, 300);
        store(&cache, &key("mid", 0), 100, 200);
        let evicted = {
            store(&cache, &key("new", 0), 100, 0);
            cache.list()
        };

        let keys: Vec<_> = evicted.iter().map(|e| e.key.clone()).collect();
        assert!(!keys.contains(&key("old", 0)));
        assert!(keys.contains(&key("mid", 0)));
        assert!(keys.contains(&key("new", 0)));
        assert!(!cache.artifact_dir(&key("old", 0)).exists());
    }

    #[test]
    fn pinned_artifacts_survive_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path(), 150).unwrap();
        store(&cache, &key("running", 0), 100, 500);
        cache.pin(&key("running", 0));
        store(&cache, &key("fresh", 0), 100, 0);

        assert!(cache.lookup(&key("running", 0)).is_some());
        assert!(cache.lookup(&key("fresh", 0)).is_some());

        cache.unpin(&key("running", 0));
        assert!(!cache.is_pinned(&key("running", 0)));
        assert_eq!(cache.evict_to_limit().unwrap(), vec![key("running", 0)]);
        assert!(cache.lookup(&key("fresh", 0)).is_some());
    }

    #[test]
    fn pinned_lookup_protects_the_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path(), 150).unwrap();
        store(&cache, &key("launching", 0), 100, 500);

        assert!(cache.lookup_pinned(&key("launching", 0)).is_some());
        assert!(cache.is_pinned(&key("launching", 0)));
        store(&cache, &key("other", 0), 100, 0);
        assert!(cache.lookup(&key("launching", 0)).is_some());
        assert!(!cache.remove(&key("launching", 0)).unwrap());

        assert!(cache.lookup_pinned(&key("missing", 0)).is_none());
        assert!(!cache.is_pinned(&key("missing", 0)));
    }

    #[test]
    fn oversized_artifact_survives_its_own_insert() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path(), 50).unwrap();
        store(&cache, &key("big", 0), 100, 0);
        assert!(cache.lookup(&key("big", 0)).is_some());
        assert_eq!(cache.evict_to_limit().unwrap(), vec![key("big", 0)]);
    }

    #[test]
    fn pins_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path(), 1_000).unwrap();
        let k = key("shared", 0);
        cache.pin(&k);
        cache.pin(&k);
        cache.unpin(&k);
        assert!(cache.is_pinned(&k));
        cache.unpin(&k);
        assert!(!cache.is_pinned(&k));
    }

    #[test]
    fn index_persists_and_prunes_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = ArtifactCache::open(dir.path(), 1_000).unwrap();
            store(&cache, &key("kept", 0), 10, 0);
            store(&cache, &key("lost", 0), 10, 0);
        }
        std::fs::remove_dir_all(dir.path().join("lost")).unwrap();

        let reopened = ArtifactCache::open(dir.path(), 1_000).unwrap();
        assert!(reopened.lookup(&key("kept", 0)).is_some());
        assert!(reopened.lookup(&key("lost", 0)).is_none());
    }

    #[test]
    fn clear_keeps_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path(), 1_000).unwrap();
        store(&cache, &key("a", 0), 10, 0);
        store(&cache, &key("b", 0), 10, 0);
        cache.pin(&key("a", 0));

        let removed = cache.clear().unwrap();
        assert_eq!(removed, vec![key("b", 0)]);
        assert!(cache.lookup(&key("a", 0)).is_some());
        assert!(!cache.remove(&key("a", 0)).unwrap());
    }
}
