//! Version resolution.
//!
//! Given a [`ComponentDescriptor`], pick the highest version satisfying its
//! requirement. The local cache is consulted first and answers on its own
//! when it holds a match, so an offline host keeps working. Only when the
//! cache has nothing suitable (or a refresh is requested) is the remote
//! history walked.

use std::sync::Arc;

use berth_core::{ComponentId, Version};
use tracing::{debug, info, warn};

use crate::cache::{ArtifactCache, CacheEntry};
use crate::descriptor::{ArtifactRef, ComponentDescriptor, ResolvedVersion};
use crate::error::{ComponentError, ComponentResult};
use crate::history::VersionHistory;

/// Per-call resolution options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Resolve exactly this version, ignoring the requirement.
    pub force_version: Option<Version>,
    /// Consult the remote history even when the cache has a match.
    pub refresh: bool,
}

impl ResolveOptions {
    /// Options pinning `version`.
    #[must_use]
    pub fn forced(version: Version) -> Self {
        Self {
            force_version: Some(version),
            refresh: false,
        }
    }
}

/// Chooses concrete versions for descriptors.
#[derive(Debug, Clone)]
pub struct Resolver {
    cache: Arc<ArtifactCache>,
    history: Arc<VersionHistory>,
}

impl Resolver {
    /// Create a resolver over a cache and a remote history.
    #[must_use]
    pub fn new(cache: Arc<ArtifactCache>, history: Arc<VersionHistory>) -> Self {
        Self { cache, history }
    }

    /// Resolve `descriptor` to a concrete version and artifact.
    ///
    /// # Errors
    ///
    /// - [`ComponentError::NotFound`] if no known version satisfies the
    ///   requirement (or the forced version does not exist).
    /// - [`ComponentError::Unreachable`] / [`ComponentError::Timeout`] if the
    ///   remote history was needed and could not be read.
    pub async fn resolve(
        &self,
        descriptor: &ComponentDescriptor,
        options: &ResolveOptions,
    ) -> ComponentResult<ResolvedVersion> {
        let id = &descriptor.id;
        let predicate = |v: &Version| match options.force_version {
            Some(forced) => *v == forced,
            None => descriptor.requirement.matches(v),
        };
        let requirement_text = match options.force_version {
            Some(forced) => format!("={forced}"),
            None => descriptor.requirement.to_string(),
        };

        let cached_best = self
            .cache
            .versions(id, &descriptor.target)
            .into_iter()
            .filter(|v| predicate(v))
            .max();

        if let Some(version) = cached_best
            && !options.refresh
        {
            debug!(component_id = %id, %version, "Resolved from cache");
            return self.from_cache(descriptor, version);
        }

        let remote = match self.history.versions(id).await {
            Ok(remote) => remote,
            Err(e) => {
                if let Some(version) = cached_best {
                    warn!(
                        component_id = %id,
                        error = %e,
                        %version,
                        "Remote history unavailable, using cached version"
                    );
                    return self.from_cache(descriptor, version);
                }
                return Err(e);
            },
        };

        let mut candidates: Vec<_> = remote.into_iter().filter(|k| predicate(&k.version)).collect();
        candidates.sort_by(|a, b| b.version.cmp(&a.version));

        for candidate in candidates {
            if cached_best.is_some_and(|cached| cached >= candidate.version) {
                break;
            }
            let manifest = self
                .history
                .manifest(&candidate.manifest)
                .await
                .map_err(|e| ComponentError::Unreachable {
                    component: id.clone(),
                    message: e.to_string(),
                })?;
            if manifest.kind != descriptor.kind {
                warn!(
                    component_id = %id,
                    version = %candidate.version,
                    expected = %descriptor.kind,
                    found = %manifest.kind,
                    "Release kind does not match, skipping"
                );
                continue;
            }
            let Some(artifact) = manifest.artifact_for(&descriptor.target) else {
                debug!(
                    component_id = %id,
                    version = %candidate.version,
                    target = %descriptor.target,
                    "Release has no artifact for target"
                );
                continue;
            };
            info!(component_id = %id, version = %candidate.version, "Resolved from remote history");
            return Ok(ResolvedVersion {
                component_id: id.clone(),
                kind: descriptor.kind,
                version: candidate.version,
                target: artifact.target.clone(),
                artifact: artifact.to_ref(),
                from_cache: false,
            });
        }

        if let Some(version) = cached_best {
            return self.from_cache(descriptor, version);
        }
        Err(not_found(id, requirement_text))
    }

    fn from_cache(
        &self,
        descriptor: &ComponentDescriptor,
        version: Version,
    ) -> ComponentResult<ResolvedVersion> {
        let entry: CacheEntry = self
            .cache
            .lookup_satisfying(&descriptor.id, &version, &descriptor.target)
            .ok_or_else(|| not_found(&descriptor.id, format!("={version}")))?;
        Ok(ResolvedVersion {
            component_id: descriptor.id.clone(),
            kind: entry.kind,
            version,
            target: entry.key.target.clone(),
            artifact: ArtifactRef {
                source: entry.source,
                integrity: entry.integrity,
                size: Some(entry.size_bytes),
            },
            from_cache: true,
        })
    }
}

fn not_found(id: &ComponentId, requirement: String) -> ComponentError {
    ComponentError::NotFound {
        component: id.clone(),
        requirement,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use berth_core::{ComponentKind, Target, VersionReq};

    use super::*;
    use crate::fetch::{FetchOptions, Fetcher};
    use crate::history::{NewArtifact, publish};
    use crate::testing::MemoryStore;

    fn notes() -> ComponentId {
        ComponentId::from_static("ant://notes/backend")
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        cache: Arc<ArtifactCache>,
        resolver: Resolver,
    }

    async fn fixture(versions: &[Version]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        for &version in versions {
            publish(
                store.as_ref(),
                &notes(),
                version,
                ComponentKind::Backend,
                vec![NewArtifact {
                    target: Target::any(),
                    bytes: format!("#!/bin/sh\n# {version}\n").into_bytes(),
                }],
            )
            .await
            .unwrap();
        }
        let cache = Arc::new(ArtifactCache::open(dir.path().join("cache"), u64::MAX).unwrap());
        let history = Arc::new(VersionHistory::new(
            Arc::clone(&store) as Arc<_>,
            100,
            Duration::from_secs(5),
        ));
        let resolver = Resolver::new(Arc::clone(&cache), history);
        Fixture {
            _dir: dir,
            store,
            cache,
            resolver,
        }
    }

    fn wants(requirement: &str) -> ComponentDescriptor {
        ComponentDescriptor::new(
            notes(),
            ComponentKind::Backend,
            VersionReq::parse(requirement).unwrap(),
        )
    }

    #[tokio::test]
    async fn picks_highest_satisfying_remote_version() {
        let f = fixture(&[
            Version::new(1, 0, 0),
            Version::new(1, 2, 3),
            Version::new(2, 0, 0),
        ])
        .await;
        let resolved = f
            .resolver
            .resolve(&wants("^1.0"), &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(resolved.version, Version::new(1, 2, 3));
        assert!(!resolved.from_cache);
        assert!(resolved.artifact.integrity.is_some());
    }

    #[tokio::test]
    async fn cached_match_answers_offline() {
        let f = fixture(&[Version::new(1, 2, 3)]).await;
        let resolved = f
            .resolver
            .resolve(&wants("^1.0"), &ResolveOptions::default())
            .await
            .unwrap();
        let fetcher = Fetcher::new(
            Arc::clone(&f.cache),
            Arc::clone(&f.store) as Arc<_>,
            FetchOptions::default(),
        )
        .unwrap();
        fetcher.ensure_local(&resolved).await.unwrap();

        f.store.set_offline(true);
        let reads = f.store.get_count();
        let again = f
            .resolver
            .resolve(&wants("^1.0"), &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(again.version, Version::new(1, 2, 3));
        assert!(again.from_cache);
        assert_eq!(f.store.get_count(), reads);
    }

    #[tokio::test]
    async fn forced_version_ignores_requirement() {
        let f = fixture(&[Version::new(1, 0, 0), Version::new(1, 4, 0)]).await;
        let resolved = f
            .resolver
            .resolve(&wants("^1.4"), &ResolveOptions::forced(Version::new(1, 0, 0)))
            .await
            .unwrap();
        assert_eq!(resolved.version, Version::new(1, 0, 0));
    }

    #[tokio::test]
    async fn unknown_forced_version_is_not_found() {
        let f = fixture(&[Version::new(1, 0, 0)]).await;
        let err = f
            .resolver
            .resolve(&wants("*"), &ResolveOptions::forced(Version::new(9, 9, 9)))
            .await
            .unwrap_err();
        assert!(matches!(err, ComponentError::NotFound { ref requirement, .. } if requirement == "=9.9.9"));
    }

    #[tokio::test]
    async fn unsatisfiable_requirement_is_not_found() {
        let f = fixture(&[Version::new(1, 0, 0)]).await;
        let err = f
            .resolver
            .resolve(&wants("^3.0"), &ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ComponentError::NotFound { .. }));
    }

    #[tokio::test]
    async fn offline_with_empty_cache_is_unreachable() {
        let f = fixture(&[Version::new(1, 0, 0)]).await;
        f.store.set_offline(true);
        let err = f
            .resolver
            .resolve(&wants("^1.0"), &ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ComponentError::Unreachable { .. }));
    }
}
