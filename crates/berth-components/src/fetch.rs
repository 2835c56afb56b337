//! Artifact fetching and verification.
//!
//! [`Fetcher::ensure_local`] turns a [`ResolvedVersion`] into files on disk.
//! Downloaded bytes are hashed and compared with the declared integrity
//! before anything is written; a mismatch discards the bytes and leaves the
//! cache untouched. Backends are installed as executables, frontends are
//! unpacked. Installation goes through a staging directory that is renamed
//! into place so a half-written artifact is never visible.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use berth_core::ComponentKind;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cache::{ArtifactCache, CacheEntry, CacheKey};
use crate::descriptor::ResolvedVersion;
use crate::error::{ComponentError, ComponentResult};
use crate::extract::extract_bundle;
use crate::source::ArtifactSource;
use crate::store::ContentStore;

/// File name of an installed backend executable.
pub const BACKEND_FILE_NAME: &str = "component";

/// Directory name of an extracted frontend bundle.
pub const FRONTEND_DIR_NAME: &str = "content";

/// An artifact ready to run or serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    /// Cache identity.
    pub key: CacheKey,
    /// Frontend or backend.
    pub kind: ComponentKind,
    /// Executable (backend) or bundle directory (frontend).
    pub path: PathBuf,
    /// Whether the artifact lives in the cache. Development paths do not.
    pub cached: bool,
}

/// Fetcher settings.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Accept `file://` sources.
    pub allow_local_paths: bool,
    /// Upper bound on one HTTPS download.
    pub max_download_bytes: u64,
    /// Budget for one HTTPS download.
    pub download_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            allow_local_paths: false,
            max_download_bytes: 512 * 1024 * 1024,
            download_timeout: Duration::from_secs(300),
        }
    }
}

/// Downloads, verifies, and installs artifacts into the cache.
pub struct Fetcher {
    cache: Arc<ArtifactCache>,
    store: Arc<dyn ContentStore>,
    options: FetchOptions,
    #[cfg(feature = "http")]
    http: reqwest::Client,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("cache", &self.cache.root())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Create a fetcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        cache: Arc<ArtifactCache>,
        store: Arc<dyn ContentStore>,
        options: FetchOptions,
    ) -> ComponentResult<Self> {
        #[cfg(feature = "http")]
        let http = reqwest::Client::builder()
            .timeout(options.download_timeout)
            .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ComponentError::Store {
                address: "https".to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            cache,
            store,
            options,
            #[cfg(feature = "http")]
            http,
        })
    }

    /// The cache this fetcher installs into.
    #[must_use]
    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Make the artifact of `resolved` available locally.
    ///
    /// Returns immediately on a cache hit with matching integrity.
    ///
    /// # Errors
    ///
    /// - [`ComponentError::IntegrityMismatch`] if downloaded bytes do not hash
    ///   to the declared value. Nothing is cached.
    /// - [`ComponentError::UnsupportedSource`] for `file://` sources when
    ///   local paths are disabled.
    /// - Store, extraction, and I/O errors.
    pub async fn ensure_local(&self, resolved: &ResolvedVersion) -> ComponentResult<LocalArtifact> {
        self.ensure(resolved, Pin::No).await
    }

    /// Like [`Fetcher::ensure_local`], but a cached artifact comes back
    /// pinned: it is protected from eviction from the moment it is found or
    /// installed. When `cached` is true the caller owns one pin and must
    /// [`ArtifactCache::unpin`] it once the artifact is no longer in use.
    ///
    /// # Errors
    ///
    /// As [`Fetcher::ensure_local`]. No pin is held on error.
    pub async fn ensure_local_pinned(
        &self,
        resolved: &ResolvedVersion,
    ) -> ComponentResult<LocalArtifact> {
        self.ensure(resolved, Pin::Yes).await
    }

    async fn ensure(&self, resolved: &ResolvedVersion, pin: Pin) -> ComponentResult<LocalArtifact> {
        let key = CacheKey::new(
            resolved.component_id.clone(),
            resolved.version,
            resolved.target.clone(),
        );

        if let Some(hit) = self.cache_hit(&key, resolved, pin)? {
            return Ok(hit);
        }

        let bytes = match &resolved.artifact.source {
            ArtifactSource::LocalPath(path) => {
                return self.local_path(key, resolved, path, pin).await;
            },
            ArtifactSource::Network(address) => self.store.get(address).await?,
            ArtifactSource::Https(url) => self.download(resolved, url).await?,
        };

        if let Some(expected) = &resolved.artifact.integrity {
            if !expected.matches(&bytes) {
                let actual = expected.compute_like(&bytes);
                warn!(
                    component_id = %resolved.component_id,
                    version = %resolved.version,
                    %expected,
                    %actual,
                    "Integrity mismatch, discarding download"
                );
                return Err(ComponentError::IntegrityMismatch {
                    component: resolved.component_id.clone(),
                    version: resolved.version,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        } else if !matches!(resolved.artifact.source, ArtifactSource::Network(_)) {
            return Err(ComponentError::InvalidManifest {
                message: format!(
                    "{} {} has no integrity hash for {}",
                    resolved.component_id, resolved.version, resolved.artifact.source
                ),
            });
        }

        self.install(key, resolved, bytes, pin).await
    }

    fn cache_hit(
        &self,
        key: &CacheKey,
        resolved: &ResolvedVersion,
        pin: Pin,
    ) -> ComponentResult<Option<LocalArtifact>> {
        let found = match pin {
            Pin::Yes => self.cache.lookup_pinned(key),
            Pin::No => self.cache.lookup(key),
        };
        let Some(entry) = found else {
            return Ok(None);
        };
        let path = self.cache.entry_path(&entry);
        let integrity_ok =
            resolved.artifact.integrity.is_none() || entry.integrity == resolved.artifact.integrity;
        if integrity_ok && path.exists() {
            if let Err(e) = self.cache.touch(key) {
                pin.release(&self.cache, key);
                return Err(e);
            }
            debug!(artifact = %key, "Artifact cache hit");
            return Ok(Some(LocalArtifact {
                key: key.clone(),
                kind: entry.kind,
                path,
                cached: true,
            }));
        }
        debug!(artifact = %key, "Stale cache entry, refetching");
        pin.release(&self.cache, key);
        self.cache.remove(key)?;
        Ok(None)
    }

    async fn local_path(
        &self,
        key: CacheKey,
        resolved: &ResolvedVersion,
        path: &Path,
        pin: Pin,
    ) -> ComponentResult<LocalArtifact> {
        if !self.options.allow_local_paths {
            return Err(ComponentError::UnsupportedSource {
                uri: resolved.artifact.source.to_string(),
            });
        }
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ComponentError::io(path, &e))?;

        if resolved.kind == ComponentKind::Frontend && metadata.is_file() {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| ComponentError::io(path, &e))?;
            return self.install(key, resolved, bytes, pin).await;
        }

        debug!(
            component_id = %resolved.component_id,
            path = %path.display(),
            "Using development artifact in place"
        );
        Ok(LocalArtifact {
            key,
            kind: resolved.kind,
            path: path.to_path_buf(),
            cached: false,
        })
    }

    #[cfg(feature = "http")]
    async fn download(&self, resolved: &ResolvedVersion, url: &url::Url) -> ComponentResult<Vec<u8>> {
        if url.scheme() != "https" && !is_loopback(url) {
            return Err(ComponentError::UnsupportedSource {
                uri: url.to_string(),
            });
        }
        debug!(component_id = %resolved.component_id, %url, "Downloading artifact");
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ComponentError::Store {
                address: url.to_string(),
                message: e.to_string(),
            })?;
        crate::download::download_with_limit(response, self.options.max_download_bytes).await
    }

    #[cfg(not(feature = "http"))]
    async fn download(&self, _: &ResolvedVersion, url: &url::Url) -> ComponentResult<Vec<u8>> {
        Err(ComponentError::UnsupportedSource {
            uri: url.to_string(),
        })
    }

    async fn install(
        &self,
        key: CacheKey,
        resolved: &ResolvedVersion,
        bytes: Vec<u8>,
        pin: Pin,
    ) -> ComponentResult<LocalArtifact> {
        let final_dir = self.cache.artifact_dir(&key);
        let kind = resolved.kind;
        let size_bytes = u64::try_from(bytes.len()).unwrap_or(u64::MAX);

        let dir = final_dir.clone();
        let relative = tokio::task::spawn_blocking(move || install_blocking(&dir, kind, &bytes))
            .await
            .map_err(|e| ComponentError::Cache {
                path: final_dir.clone(),
                message: format!("install task failed: {e}"),
            })??;

        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            kind,
            source: resolved.artifact.source.clone(),
            integrity: resolved.artifact.integrity.clone(),
            size_bytes,
            path: key.relative_dir().join(relative),
            stored_at: now,
            last_used: now,
        };
        let path = self.cache.entry_path(&entry);
        if pin == Pin::Yes {
            self.cache.pin(&key);
        }
        let evicted = match self.cache.insert(entry) {
            Ok(evicted) => evicted,
            Err(e) => {
                pin.release(&self.cache, &key);
                return Err(e);
            },
        };
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Evicted artifacts to fit cache limit");
        }

        info!(
            component_id = %key.component_id,
            version = %key.version,
            target = %key.target,
            size = size_bytes,
            "Installed artifact"
        );
        Ok(LocalArtifact {
            key,
            kind,
            path,
            cached: true,
        })
    }
}

/// Whether a cached result should come back pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pin {
    Yes,
    No,
}

impl Pin {
    fn release(self, cache: &ArtifactCache, key: &CacheKey) {
        if self == Self::Yes {
            cache.unpin(key);
        }
    }
}

/// Write into a staging directory next to `final_dir`, then swap it in.
/// Returns the artifact path relative to `final_dir`.
fn install_blocking(final_dir: &Path, kind: ComponentKind, bytes: &[u8]) -> ComponentResult<PathBuf> {
    let parent = final_dir.parent().unwrap_or(final_dir);
    std::fs::create_dir_all(parent).map_err(|e| ComponentError::io(parent, &e))?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(parent)
        .map_err(|e| ComponentError::io(parent, &e))?;

    let relative = match kind {
        ComponentKind::Backend => {
            let name = format!("{BACKEND_FILE_NAME}{}", std::env::consts::EXE_SUFFIX);
            let path = staging.path().join(&name);
            std::fs::write(&path, bytes).map_err(|e| ComponentError::io(&path, &e))?;
            make_executable(&path)?;
            PathBuf::from(name)
        },
        ComponentKind::Frontend => {
            let content = staging.path().join(FRONTEND_DIR_NAME);
            std::fs::create_dir_all(&content).map_err(|e| ComponentError::io(&content, &e))?;
            extract_bundle(bytes, &content)?;
            PathBuf::from(FRONTEND_DIR_NAME)
        },
    };

    if final_dir.exists() {
        std::fs::remove_dir_all(final_dir).map_err(|e| ComponentError::io(final_dir, &e))?;
    }
    std::fs::rename(staging.path(), final_dir).map_err(|e| ComponentError::io(final_dir, &e))?;
    Ok(relative)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> ComponentResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| ComponentError::io(path, &e))
}

#[cfg(not(unix))]
fn make_executable(_: &Path) -> ComponentResult<()> {
    Ok(())
}

#[cfg(feature = "http")]
fn is_loopback(url: &url::Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain == "localhost",
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use berth_core::{ComponentId, Target, Version};

    use super::*;
    use crate::descriptor::ArtifactRef;
    use crate::integrity::Integrity;
    use crate::store::{DirectoryStore, WritableStore};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<DirectoryStore>,
        cache: Arc<ArtifactCache>,
        fetcher: Fetcher,
    }

    fn fixture(allow_local_paths: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DirectoryStore::new(dir.path().join("store")));
        let cache = Arc::new(ArtifactCache::open(dir.path().join("cache"), 1 << 20).unwrap());
        let fetcher = Fetcher::new(
            Arc::clone(&cache),
            Arc::clone(&store) as Arc<dyn ContentStore>,
            FetchOptions {
                allow_local_paths,
                ..FetchOptions::default()
            },
        )
        .unwrap();
        Fixture {
            _dir: dir,
            store,
            cache,
            fetcher,
        }
    }

    fn resolved(source: ArtifactSource, integrity: Option<Integrity>) -> ResolvedVersion {
        ResolvedVersion {
            component_id: ComponentId::from_static("com.example.notes"),
            kind: ComponentKind::Backend,
            version: Version::new(1, 2, 0),
            target: Target::any(),
            artifact: ArtifactRef {
                source,
                integrity,
                size: None,
            },
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn installs_backend_and_hits_cache() {
        let f = fixture(false);
        let bytes = b"#!/bin/sh\necho hi\n";
        let address = f.store.put(bytes).await.unwrap();
        let r = resolved(ArtifactSource::Network(address), Some(Integrity::blake3(bytes)));

        let local = f.fetcher.ensure_local(&r).await.unwrap();
        assert!(local.cached);
        assert_eq!(std::fs::read(&local.path).unwrap(), bytes);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&local.path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }

        std::fs::remove_dir_all(f.store.root().join("objects")).unwrap();
        let again = f.fetcher.ensure_local(&r).await.unwrap();
        assert_eq!(again.path, local.path);
    }

    #[tokio::test]
    async fn integrity_mismatch_caches_nothing() {
        let f = fixture(false);
        let address = f.store.put(b"real bytes").await.unwrap();
        let r = resolved(
            ArtifactSource::Network(address),
            Some(Integrity::blake3(b"declared bytes")),
        );

        let err = f.fetcher.ensure_local(&r).await.unwrap_err();
        assert!(matches!(err, ComponentError::IntegrityMismatch { .. }));
        assert!(f.cache.list().is_empty());
        let key = CacheKey::new(r.component_id.clone(), r.version, r.target.clone());
        assert!(!f.cache.artifact_dir(&key).exists());
    }

    #[tokio::test]
    async fn local_paths_require_opt_in() {
        let f = fixture(false);
        let r = resolved(ArtifactSource::LocalPath("/usr/bin/true".into()), None);
        assert!(matches!(
            f.fetcher.ensure_local(&r).await,
            Err(ComponentError::UnsupportedSource { .. })
        ));
    }

    #[tokio::test]
    async fn local_backend_used_in_place_without_hashing() {
        let f = fixture(true);
        let dev = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(dev.path(), b"dev build").unwrap();
        let r = resolved(
            ArtifactSource::LocalPath(dev.path().to_path_buf()),
            Some(Integrity::blake3(b"something else entirely")),
        );

        let local = f.fetcher.ensure_local(&r).await.unwrap();
        assert!(!local.cached);
        assert_eq!(local.path, dev.path());
        assert!(f.cache.list().is_empty());
    }

    #[tokio::test]
    async fn frontend_bundle_is_extracted() {
        use std::io::Write;

        let f = fixture(false);
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "index.html", &b"hello"[..])
            .unwrap();
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&builder.into_inner().unwrap()).unwrap();
        let bundle = gz.finish().unwrap();

        let address = f.store.put(&bundle).await.unwrap();
        let mut r = resolved(ArtifactSource::Network(address), Some(Integrity::blake3(&bundle)));
        r.kind = ComponentKind::Frontend;

        let local = f.fetcher.ensure_local(&r).await.unwrap();
        assert!(local.path.ends_with(FRONTEND_DIR_NAME));
        assert_eq!(
            std::fs::read_to_string(local.path.join("index.html")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn pinned_fetch_holds_one_pin_per_call() {
        let f = fixture(false);
        let bytes = b"#!/bin/sh\necho pinned\n";
        let address = f.store.put(bytes).await.unwrap();
        let r = resolved(ArtifactSource::Network(address), Some(Integrity::blake3(bytes)));

        let installed = f.fetcher.ensure_local_pinned(&r).await.unwrap();
        assert!(f.cache.is_pinned(&installed.key));
        let hit = f.fetcher.ensure_local_pinned(&r).await.unwrap();
        assert_eq!(hit.path, installed.path);

        f.cache.unpin(&installed.key);
        assert!(f.cache.is_pinned(&installed.key));
        f.cache.unpin(&hit.key);
        assert!(!f.cache.is_pinned(&installed.key));

        f.fetcher.ensure_local(&r).await.unwrap();
        assert!(!f.cache.is_pinned(&installed.key));
    }

    #[tokio::test]
    async fn failed_pinned_fetch_holds_no_pin() {
        let f = fixture(false);
        let address = f.store.put(b"real bytes").await.unwrap();
        let r = resolved(
            ArtifactSource::Network(address),
            Some(Integrity::blake3(b"declared bytes")),
        );
        assert!(f.fetcher.ensure_local_pinned(&r).await.is_err());
        let key = CacheKey::new(r.component_id.clone(), r.version, r.target.clone());
        assert!(!f.cache.is_pinned(&key));
    }

    #[tokio::test]
    async fn corrupt_bundle_leaves_no_partial_install() {
        let f = fixture(false);
        let garbage = b"definitely not gzip";
        let address = f.store.put(garbage).await.unwrap();
        let mut r = resolved(ArtifactSource::Network(address), Some(Integrity::blake3(garbage)));
        r.kind = ComponentKind::Frontend;

        assert!(f.fetcher.ensure_local(&r).await.is_err());
        let key = CacheKey::new(r.component_id.clone(), r.version, r.target.clone());
        assert!(!f.cache.artifact_dir(&key).exists());
        assert!(f.cache.list().is_empty());
    }
}
