//! Sharing, deduplication, and upgrades of running instances.
//!
//! [`Coordinator::acquire`] hands out running instances:
//!
//! 1. A running instance whose version passes the request is reused and its
//!    reference count incremented.
//! 2. If a start for the same identity is in flight, the caller waits for it
//!    and tries again. Only one caller-initiated start per identity is ever
//!    in flight, so concurrent acquires spawn a single process.
//! 3. Otherwise the version is resolved (outside the slot lock) and started.
//!    If an older instance on the same compatibility line is running, the new
//!    version replaces it in place: the new process is registered under the
//!    old instance id and the old process is stopped afterwards. A different
//!    line starts side by side. An older patch of a line that is already
//!    running newer is refused, since both would use one data directory.
//!
//! Starts run on their own task. A caller that gives up waiting does not
//! cancel a spawned process; it is registered and left for the next caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use berth_core::{ComponentKind, Scope, Version};
use tracing::{debug, info};

use crate::cache::CacheKey;
use crate::datadir::{DataDirectoryKey, MigrationHook};
use crate::descriptor::{ComponentDescriptor, ResolvedVersion};
use crate::error::{ComponentError, ComponentResult};
use crate::fetch::Fetcher;
use crate::process::{LaunchSpec, ProcessHandle};
use crate::registry::{Inflight, InstanceId, RegistryKey, RunningComponent};
use crate::resolver::{ResolveOptions, Resolver};
use crate::supervisor::{NewInstance, Supervisor, shared_start};

/// Consecutive starts an acquire attempts before giving up on a component
/// that keeps exiting straight after announcing.
const MAX_START_ATTEMPTS: u32 = 3;

/// What to acquire, and for whom.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// The component and its version requirement.
    pub descriptor: ComponentDescriptor,
    /// Data scope of the instance.
    pub scope: Scope,
    /// App the reference is held on behalf of.
    pub app_id: Option<String>,
    /// Use exactly this version, ignoring the requirement.
    pub force_version: Option<Version>,
    /// Check the remote history for newer versions even on a cache hit.
    pub refresh: bool,
}

impl AcquireRequest {
    /// A request in `scope`.
    #[must_use]
    pub fn new(descriptor: ComponentDescriptor, scope: Scope) -> Self {
        Self {
            descriptor,
            scope,
            app_id: None,
            force_version: None,
            refresh: false,
        }
    }

    /// Attribute the reference to `app_id`.
    #[must_use]
    pub fn for_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Pin an exact version.
    #[must_use]
    pub fn with_force_version(mut self, version: Option<Version>) -> Self {
        self.force_version = version;
        self
    }

    /// Consult the remote history.
    #[must_use]
    pub fn refreshing(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Whether a running `version` can serve this request.
    #[must_use]
    pub fn accepts(&self, version: &Version) -> bool {
        match self.force_version {
            Some(forced) => *version == forced,
            None => self.descriptor.requirement.matches(version),
        }
    }
}

/// How a start relates to what is already running.
#[derive(Debug, Clone, Copy)]
enum Plan {
    /// A new, independent instance.
    Fresh,
    /// Replace `old` once the new version is running.
    Upgrade {
        old: InstanceId,
        old_version: Version,
    },
}

/// Hands out running instances.
pub struct Coordinator {
    supervisor: Arc<Supervisor>,
    resolver: Arc<Resolver>,
    fetcher: Arc<Fetcher>,
    migration: Arc<dyn MigrationHook>,
    data_root: PathBuf,
    announce_timeout: Duration,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("data_root", &self.data_root)
            .field("announce_timeout", &self.announce_timeout)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        supervisor: Arc<Supervisor>,
        resolver: Arc<Resolver>,
        fetcher: Arc<Fetcher>,
        migration: Arc<dyn MigrationHook>,
        data_root: PathBuf,
        announce_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            resolver,
            fetcher,
            migration,
            data_root,
            announce_timeout,
        }
    }

    /// The supervisor instances are registered with.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Acquire a running instance satisfying `request`, starting or
    /// upgrading one if needed. The returned snapshot already counts the
    /// caller's reference.
    ///
    /// # Errors
    ///
    /// Resolution, fetch, and start errors are returned as-is. A component
    /// that exits straight after every start yields [`ComponentError::Crashed`].
    pub async fn acquire(&self, request: &AcquireRequest) -> ComponentResult<RunningComponent> {
        let descriptor = &request.descriptor;
        if descriptor.kind != ComponentKind::Backend {
            return Err(ComponentError::InvalidManifest {
                message: format!("{} is a frontend component and has no process", descriptor.id),
            });
        }
        let key = RegistryKey::new(request.scope.clone(), descriptor.id.clone());
        let accept = |v: &Version| request.accepts(v);
        let app = request.app_id.as_deref();

        let mut attempts = 0u32;
        let mut last_version = None;
        loop {
            if let Some(version) = last_version
                && attempts >= MAX_START_ATTEMPTS
            {
                return Err(ComponentError::Crashed {
                    component: descriptor.id.clone(),
                    version,
                    exit: "stopped again right after starting".to_string(),
                });
            }

            let slot = self.supervisor.slot(&key);
            let pending = {
                let mut guard = slot.lock().await;
                if let Some(managed) = guard.best_running(accept) {
                    managed.info.add_ref(app);
                    debug!(
                        component_id = %descriptor.id,
                        version = %managed.info.version,
                        ref_count = managed.info.ref_count,
                        "Reusing running instance"
                    );
                    return Ok(managed.info.clone());
                }
                guard.pending(accept)
            };

            if let Some((version, future)) = pending {
                debug!(component_id = %descriptor.id, %version, "Waiting for in-flight start");
                let outcome = future.await;
                if accept(&version) {
                    attempts = attempts.saturating_add(1);
                    last_version = Some(version);
                    outcome?;
                }
                continue;
            }

            let options = ResolveOptions {
                force_version: request.force_version,
                refresh: request.refresh,
            };
            let resolved = self.resolver.resolve(descriptor, &options).await?;

            let mut guard = slot.lock().await;
            if !guard.inflight.is_empty() || guard.best_running(accept).is_some() {
                continue;
            }
            if let Some(newer) = guard.instances.iter().find(|m| {
                m.info.version > resolved.version
                    && m.info.version.major_minor() == resolved.version.major_minor()
            }) {
                return Err(ComponentError::VersionConflict {
                    component: descriptor.id.clone(),
                    running: newer.info.version,
                    requested: resolved.version,
                    line: format!("{}.{}", resolved.version.major, resolved.version.minor),
                });
            }
            let plan = guard
                .instances
                .iter()
                .filter(|m| {
                    m.info.version < resolved.version
                        && m.info.version.is_compatible_with(&resolved.version)
                })
                .max_by_key(|m| m.info.version)
                .map_or(Plan::Fresh, |m| Plan::Upgrade {
                    old: m.info.instance_id,
                    old_version: m.info.version,
                });

            let generation = guard.next_generation();
            let version = resolved.version;
            match plan {
                Plan::Fresh => info!(component_id = %descriptor.id, %version, "Starting component"),
                Plan::Upgrade { old_version, .. } => info!(
                    component_id = %descriptor.id,
                    from = %old_version,
                    to = %version,
                    "Upgrading component in place"
                ),
            }
            let job = StartJob {
                supervisor: Arc::clone(&self.supervisor),
                fetcher: Arc::clone(&self.fetcher),
                migration: Arc::clone(&self.migration),
                data_root: self.data_root.clone(),
                announce_timeout: self.announce_timeout,
                key: key.clone(),
                resolved,
                config: descriptor.config.clone(),
                plan,
                generation,
            };
            let component = descriptor.id.clone();
            let future = shared_start(tokio::spawn(job.run()), component, version);
            guard.inflight.push(Inflight {
                generation,
                version,
                future: future.clone(),
                restarting: None,
            });
            drop(guard);

            attempts = attempts.saturating_add(1);
            last_version = Some(version);
            future.await?;
        }
    }
}

/// One start, run on its own task.
struct StartJob {
    supervisor: Arc<Supervisor>,
    fetcher: Arc<Fetcher>,
    migration: Arc<dyn MigrationHook>,
    data_root: PathBuf,
    announce_timeout: Duration,
    key: RegistryKey,
    resolved: ResolvedVersion,
    config: serde_json::Value,
    plan: Plan,
    generation: u64,
}

impl StartJob {
    async fn run(self) -> ComponentResult<InstanceId> {
        let prepared = self.launch().await;

        let slot = self.supervisor.slot(&self.key);
        let mut guard = slot.lock().await;
        guard.finish(self.generation);
        let (spec, handle, artifact) = prepared?;

        if self.supervisor.is_closing() {
            handle.kill();
            if let Some(key) = &artifact {
                self.supervisor.unpin(key);
            }
            return Err(ComponentError::StartFailed {
                component: self.key.component_id.clone(),
                version: spec.version,
                reason: "the host is shutting down".to_string(),
            });
        }

        let replaced = match self.plan {
            Plan::Upgrade { old, .. } => guard.take(old),
            Plan::Fresh => None,
        };
        let instance_id = replaced
            .as_ref()
            .map_or_else(InstanceId::new, |old| old.info.instance_id);
        let policy = self.supervisor.policy_for(&self.key.component_id);
        let inserted = self.supervisor.insert(
            &mut guard,
            &self.key,
            NewInstance {
                instance_id,
                spec,
                handle,
                target: self.resolved.target.clone(),
                artifact: artifact.clone(),
                policy,
                carried: replaced.as_ref().map(|old| old.info.clone()),
            },
        );
        let info = match inserted {
            Ok(info) => info,
            Err(e) => {
                if let Some(old) = replaced {
                    guard.instances.push(old);
                }
                drop(guard);
                if let Some(key) = &artifact {
                    self.supervisor.unpin(key);
                }
                return Err(e);
            },
        };
        if let Some(old) = &replaced {
            guard.forget_restart(old.info.instance_id);
        }
        drop(guard);

        if let Some(old) = replaced {
            info!(
                component_id = %info.component_id,
                from = %old.info.version,
                to = %info.version,
                "Swapped in upgraded instance"
            );
            self.supervisor.stop_managed(old).await;
        }
        Ok(instance_id)
    }

    /// Fetch, migrate, and launch. Nothing here touches the registry.
    ///
    /// A cached artifact is pinned from the fetch onwards; the pin is handed
    /// back with the handle, or released here on failure.
    async fn launch(&self) -> ComponentResult<(LaunchSpec, ProcessHandle, Option<CacheKey>)> {
        let artifact = self.fetcher.ensure_local_pinned(&self.resolved).await?;
        let pinned = artifact.cached.then(|| artifact.key.clone());
        match self.prepare_and_spawn(&artifact.path, artifact.kind).await {
            Ok((spec, handle)) => Ok((spec, handle, pinned)),
            Err(e) => {
                if let Some(key) = &pinned {
                    self.supervisor.unpin(key);
                }
                Err(e)
            },
        }
    }

    async fn prepare_and_spawn(
        &self,
        executable: &std::path::Path,
        kind: ComponentKind,
    ) -> ComponentResult<(LaunchSpec, ProcessHandle)> {
        let resolved = &self.resolved;
        if kind != ComponentKind::Backend {
            return Err(ComponentError::StartFailed {
                component: resolved.component_id.clone(),
                version: resolved.version,
                reason: "artifact is not a backend executable".to_string(),
            });
        }

        let new_key =
            DataDirectoryKey::new(self.key.scope.clone(), self.key.component_id.clone(), &resolved.version);
        if let Plan::Upgrade { old_version, .. } = self.plan
            && old_version.major_minor() != resolved.version.major_minor()
        {
            let old_key =
                DataDirectoryKey::new(self.key.scope.clone(), self.key.component_id.clone(), &old_version);
            let hook = Arc::clone(&self.migration);
            let root = self.data_root.clone();
            let target = new_key.clone();
            tokio::task::spawn_blocking(move || hook.migrate(&root, &old_key, &target))
                .await
                .map_err(|e| ComponentError::StartFailed {
                    component: resolved.component_id.clone(),
                    version: resolved.version,
                    reason: format!("data migration task failed: {e}"),
                })??;
        }

        let spec = LaunchSpec {
            component_id: resolved.component_id.clone(),
            version: resolved.version,
            executable: executable.to_path_buf(),
            data_dir: new_key.path(&self.data_root),
            scope: self.key.scope.clone(),
            config: self.config.clone(),
            announce_timeout: self.announce_timeout,
        };
        let handle = self.supervisor.launcher().launch(&spec).await?;
        Ok((spec, handle))
    }
}
