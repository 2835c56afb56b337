//! The component manager facade.
//!
//! [`ComponentManager`] wires configuration, the content store, the cache,
//! the resolver, the supervisor, and version overrides together, and exposes
//! the operations a host application or the CLI needs.

use std::path::PathBuf;
use std::sync::Arc;

use berth_config::Config;
use berth_core::{BerthHome, ComponentId, ComponentKind, LogNotifier, Notifier, Scope, Version};
use tracing::{debug, info, warn};

use crate::cache::{ArtifactCache, CacheEntry, CacheKey};
use crate::control::{ComponentStatus, ControlClient, TcpControlClient};
use crate::coordinator::{AcquireRequest, Coordinator};
use crate::datadir::{self, MigrationHook, NoMigration};
use crate::descriptor::{ComponentDescriptor, ResolvedVersion};
use crate::error::{ComponentError, ComponentResult};
use crate::fetch::{FetchOptions, Fetcher, LocalArtifact};
use crate::history::VersionHistory;
use crate::manifest::{AppManifest, Platform};
use crate::overrides::{Actor, OverrideOutcome, VersionOverride, VersionOverrides};
use crate::process::{OsProcessLauncher, ProcessLauncher};
use crate::registry::{InstanceId, RunningComponent};
use crate::resolver::{ResolveOptions, Resolver};
use crate::restart::RestartPolicy;
use crate::store::{ContentStore, DirectoryStore};
use crate::supervisor::{PolicyBook, Supervisor, SupervisorSettings};

/// Everything started for one app.
#[derive(Debug, Clone)]
pub struct LaunchedApp {
    /// App id from the manifest.
    pub app_id: String,
    /// Running backends, each holding one reference for this app.
    pub backends: Vec<RunningComponent>,
    /// Frontend bundles ready to serve.
    pub frontends: Vec<LocalArtifact>,
}

/// Builder for [`ComponentManager`]. Every collaborator has a production
/// default; tests replace the launcher, control client, and store.
pub struct ManagerBuilder {
    config: Config,
    home: Option<BerthHome>,
    store: Option<Arc<dyn ContentStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    control: Option<Arc<dyn ControlClient>>,
    migration: Option<Arc<dyn MigrationHook>>,
}

impl ManagerBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            home: None,
            store: None,
            notifier: None,
            launcher: None,
            control: None,
            migration: None,
        }
    }

    /// Use this home directory instead of `$BERTH_HOME`.
    #[must_use]
    pub fn home(mut self, home: BerthHome) -> Self {
        self.home = Some(home);
        self
    }

    /// Use this content store instead of the configured one.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Deliver user-visible notices here.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Start processes with this launcher.
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Send control calls through this client.
    #[must_use]
    pub fn control(mut self, control: Arc<dyn ControlClient>) -> Self {
        self.control = Some(control);
        self
    }

    /// Migrate data with this hook on in-place upgrades. Without one, a new
    /// `major.minor` starts on an empty data directory.
    #[must_use]
    pub fn migration(mut self, migration: Arc<dyn MigrationHook>) -> Self {
        self.migration = Some(migration);
        self
    }

    /// Build the manager. Pending version overrides become active here.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory, cache, or store cannot be
    /// opened.
    pub fn build(self) -> ComponentResult<ComponentManager> {
        let config = self.config;
        let home = match self.home {
            Some(home) => home,
            None => BerthHome::resolve().map_err(|e| ComponentError::io("$BERTH_HOME", &e))?,
        };
        home.ensure().map_err(|e| ComponentError::io(home.root(), &e))?;

        let cache_dir = config
            .cache
            .dir
            .as_ref()
            .map_or_else(|| home.component_cache_dir(), PathBuf::from);
        let cache = Arc::new(ArtifactCache::open(cache_dir, config.cache.max_size_bytes)?);

        let store = match self.store {
            Some(store) => store,
            None => default_store(&config, &home)?,
        };
        let history = Arc::new(
            VersionHistory::new(
                Arc::clone(&store),
                config.history.max_depth,
                config.timeouts.history_fetch(),
            )
            .with_cache_dir(home.history_cache_dir()),
        );
        let resolver = Arc::new(Resolver::new(Arc::clone(&cache), Arc::clone(&history)));
        let fetcher = Arc::new(Fetcher::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            FetchOptions {
                allow_local_paths: config.development.allow_local_paths,
                max_download_bytes: config.network.max_download_bytes,
                ..FetchOptions::default()
            },
        )?);

        let control = self
            .control
            .unwrap_or_else(|| Arc::new(TcpControlClient::new(config.timeouts.control_call())));
        let launcher = self.launcher.unwrap_or_else(|| Arc::new(OsProcessLauncher));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        let supervisor = Supervisor::new(
            launcher,
            control,
            notifier,
            Arc::clone(&cache),
            SupervisorSettings::from_config(&config),
            PolicyBook::from_config(&config),
        );

        let data_root = config
            .data
            .root
            .as_ref()
            .map_or_else(|| home.data_dir(), PathBuf::from);
        let migration = self.migration.unwrap_or_else(|| Arc::new(NoMigration));
        let coordinator = Coordinator::new(
            Arc::clone(&supervisor),
            Arc::clone(&resolver),
            Arc::clone(&fetcher),
            migration,
            data_root.clone(),
            config.timeouts.start_announce(),
        );

        let overrides = VersionOverrides::new(home.overrides_path(), &config.deployment);
        overrides.promote()?;

        let default_scope = config
            .deployment
            .default_scope
            .parse::<Scope>()
            .unwrap_or_else(|e| {
                warn!(scope = %config.deployment.default_scope, error = %e, "Invalid default scope, using shared");
                Scope::Shared
            });

        info!(home = %home.root().display(), data_root = %data_root.display(), "Component manager ready");
        Ok(ComponentManager {
            config,
            home,
            store,
            cache,
            resolver,
            fetcher,
            supervisor,
            coordinator,
            overrides,
            data_root,
            default_scope,
        })
    }
}

fn default_store(config: &Config, home: &BerthHome) -> ComponentResult<Arc<dyn ContentStore>> {
    if let Some(gateway) = &config.network.gateway_url {
        #[cfg(feature = "http")]
        {
            let base = url::Url::parse(gateway).map_err(|e| ComponentError::Store {
                address: gateway.clone(),
                message: format!("invalid gateway URL: {e}"),
            })?;
            let store = crate::store::HttpStore::new(
                base,
                config.timeouts.history_fetch(),
                config.network.max_download_bytes,
            )?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "http"))]
        return Err(ComponentError::UnsupportedSource {
            uri: gateway.clone(),
        });
    }
    let dir = config
        .network
        .store_dir
        .as_ref()
        .map_or_else(|| home.store_dir(), PathBuf::from);
    Ok(Arc::new(DirectoryStore::new(dir)))
}

/// Resolves, fetches, starts, shares, and stops components.
pub struct ComponentManager {
    config: Config,
    home: BerthHome,
    store: Arc<dyn ContentStore>,
    cache: Arc<ArtifactCache>,
    resolver: Arc<Resolver>,
    fetcher: Arc<Fetcher>,
    supervisor: Arc<Supervisor>,
    coordinator: Coordinator,
    overrides: VersionOverrides,
    data_root: PathBuf,
    default_scope: Scope,
}

impl std::fmt::Debug for ComponentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentManager")
            .field("home", &self.home)
            .field("data_root", &self.data_root)
            .field("default_scope", &self.default_scope)
            .finish_non_exhaustive()
    }
}

impl ComponentManager {
    /// A builder over `config`.
    #[must_use]
    pub fn builder(config: Config) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The home directory in use.
    #[must_use]
    pub fn home(&self) -> &BerthHome {
        &self.home
    }

    /// The content store in use.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// The scope used when callers do not name one.
    #[must_use]
    pub fn default_scope(&self) -> &Scope {
        &self.default_scope
    }

    /// Start everything `manifest` needs: acquire each backend and make each
    /// desktop frontend available locally. If any component fails, backends
    /// already acquired for this launch are released again.
    ///
    /// # Errors
    ///
    /// Returns the first validation, resolution, fetch, or start error.
    pub async fn launch(
        &self,
        manifest: &AppManifest,
        scope: Option<Scope>,
    ) -> ComponentResult<LaunchedApp> {
        manifest.validate()?;
        let scope = scope.unwrap_or_else(|| self.default_scope.clone());
        let mut launched = LaunchedApp {
            app_id: manifest.id.clone(),
            backends: Vec::new(),
            frontends: Vec::new(),
        };

        for component in &manifest.components {
            if component
                .platform
                .is_some_and(|p| p != Platform::Desktop)
            {
                debug!(component_id = %component.id, "Skipping component for another platform");
                continue;
            }
            let result = match component.descriptor() {
                Ok(descriptor) => self.launch_component(descriptor, &scope, &mut launched).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(app_id = %manifest.id, component_id = %component.id, error = %e, "App launch failed");
                self.close_app(&launched).await;
                return Err(e);
            }
        }

        info!(
            app_id = %manifest.id,
            backends = launched.backends.len(),
            frontends = launched.frontends.len(),
            "App launched"
        );
        Ok(launched)
    }

    async fn launch_component(
        &self,
        descriptor: ComponentDescriptor,
        scope: &Scope,
        launched: &mut LaunchedApp,
    ) -> ComponentResult<()> {
        match descriptor.kind {
            ComponentKind::Backend => {
                let request = self
                    .request(descriptor, scope.clone())?
                    .for_app(launched.app_id.clone());
                launched.backends.push(self.acquire_request(request).await?);
            },
            ComponentKind::Frontend => {
                let resolved = self.resolve(&descriptor).await?;
                launched.frontends.push(self.fetcher.ensure_local(&resolved).await?);
            },
        }
        Ok(())
    }

    /// Release every backend reference held by `app`.
    pub async fn close_app(&self, app: &LaunchedApp) {
        for backend in &app.backends {
            if let Err(e) = self
                .supervisor
                .release(backend.instance_id, Some(&app.app_id))
                .await
            {
                debug!(instance = %backend.instance_id, error = %e, "Release during app close failed");
            }
        }
    }

    /// Acquire a running instance of `descriptor` in `scope`.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::acquire`].
    pub async fn acquire(
        &self,
        descriptor: ComponentDescriptor,
        scope: Option<Scope>,
    ) -> ComponentResult<RunningComponent> {
        let scope = scope.unwrap_or_else(|| self.default_scope.clone());
        self.acquire_request(self.request(descriptor, scope)?).await
    }

    /// Acquire with a fully specified request.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::acquire`].
    pub async fn acquire_request(&self, request: AcquireRequest) -> ComponentResult<RunningComponent> {
        self.coordinator.acquire(&request).await
    }

    fn request(&self, descriptor: ComponentDescriptor, scope: Scope) -> ComponentResult<AcquireRequest> {
        let forced = self.overrides.active(&descriptor.id)?;
        Ok(AcquireRequest::new(descriptor, scope)
            .with_force_version(forced)
            .refreshing(self.config.history.refresh))
    }

    /// Drop one reference to an instance.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownInstance`] for unknown ids.
    pub async fn release(&self, id: InstanceId, app_id: Option<&str>) -> ComponentResult<()> {
        self.supervisor.release(id, app_id).await
    }

    /// Stop an instance regardless of references.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownInstance`] for unknown ids.
    pub async fn stop(&self, id: InstanceId) -> ComponentResult<()> {
        self.supervisor.stop(id).await
    }

    /// Every running instance.
    pub async fn running(&self) -> Vec<RunningComponent> {
        self.supervisor.running().await
    }

    /// Instances referenced by `app_id`.
    pub async fn running_for_app(&self, app_id: &str) -> Vec<RunningComponent> {
        let mut all = self.supervisor.running().await;
        all.retain(|rc| rc.is_used_by(app_id));
        all
    }

    /// Instances of `component`, across scopes and versions.
    pub async fn running_for_component(&self, component: &ComponentId) -> Vec<RunningComponent> {
        let mut all = self.supervisor.running().await;
        all.retain(|rc| &rc.component_id == component);
        all
    }

    /// Ask a running instance for its status.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown ids or failed control calls.
    pub async fn status(&self, id: InstanceId) -> ComponentResult<ComponentStatus> {
        self.supervisor.status(id).await
    }

    /// Resolve `descriptor`, honouring active overrides.
    ///
    /// # Errors
    ///
    /// See [`Resolver::resolve`].
    pub async fn resolve(&self, descriptor: &ComponentDescriptor) -> ComponentResult<ResolvedVersion> {
        let options = ResolveOptions {
            force_version: self.overrides.active(&descriptor.id)?,
            refresh: self.config.history.refresh,
        };
        self.resolver.resolve(descriptor, &options).await
    }

    /// Resolve with explicit options.
    ///
    /// # Errors
    ///
    /// See [`Resolver::resolve`].
    pub async fn resolve_with(
        &self,
        descriptor: &ComponentDescriptor,
        options: &ResolveOptions,
    ) -> ComponentResult<ResolvedVersion> {
        self.resolver.resolve(descriptor, options).await
    }

    /// Make a resolved artifact available locally.
    ///
    /// # Errors
    ///
    /// See [`Fetcher::ensure_local`].
    pub async fn ensure_local(&self, resolved: &ResolvedVersion) -> ComponentResult<LocalArtifact> {
        self.fetcher.ensure_local(resolved).await
    }

    /// Cached artifacts, most recently used first.
    #[must_use]
    pub fn cached(&self) -> Vec<CacheEntry> {
        self.cache.list()
    }

    /// Evict least-recently-used artifacts until the cache fits its limit.
    /// Artifacts of running instances are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache index cannot be updated.
    pub fn evict_cache(&self) -> ComponentResult<Vec<CacheKey>> {
        self.cache.evict_to_limit()
    }

    /// Remove one cached artifact unless it backs a running instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache index cannot be updated.
    pub fn remove_cached(&self, key: &CacheKey) -> ComponentResult<bool> {
        self.cache.remove(key)
    }

    /// Remove every cached artifact not backing a running instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache index cannot be updated.
    pub fn clear_cache(&self) -> ComponentResult<Vec<CacheKey>> {
        self.cache.clear()
    }

    /// Change the restart policy of `component`.
    pub async fn set_policy(&self, component: &ComponentId, policy: RestartPolicy) {
        self.supervisor.set_policy(component, policy).await;
    }

    /// The restart policy in effect for `component`.
    #[must_use]
    pub fn policy_for(&self, component: &ComponentId) -> RestartPolicy {
        self.supervisor.policy_for(component)
    }

    /// Ask for `component` to be pinned at `version`. The pin takes effect
    /// after a host restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the override file cannot be updated.
    pub fn request_override(
        &self,
        component: &ComponentId,
        version: Version,
        actor: &Actor,
    ) -> ComponentResult<OverrideOutcome> {
        self.overrides.request(component, version, actor)
    }

    /// Remove pins for `component`.
    ///
    /// # Errors
    ///
    /// Returns an error if `actor` may not do so or the file cannot be updated.
    pub fn clear_override(&self, component: &ComponentId, actor: &Actor) -> ComponentResult<bool> {
        self.overrides.clear(component, actor)
    }

    /// Every recorded pin.
    ///
    /// # Errors
    ///
    /// Returns an error if the override file cannot be read.
    pub fn overrides(&self) -> ComponentResult<Vec<VersionOverride>> {
        self.overrides.list()
    }

    /// Restart the host on behalf of `actor`: activate pending pins and stop
    /// every running instance so the next acquire starts the pinned version.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::OverrideDenied`] if `actor` may not restart
    /// the host.
    pub async fn restart_host(&self, actor: &Actor) -> ComponentResult<Vec<VersionOverride>> {
        let activated = self.overrides.activate_pending(actor)?;
        info!(user = %actor.user, activated = activated.len(), "Restarting host components");
        self.supervisor.stop_all().await;
        Ok(activated)
    }

    /// Data directory of `component` at `version` in `scope`.
    #[must_use]
    pub fn data_dir(&self, scope: &Scope, component: &ComponentId, version: &Version) -> PathBuf {
        datadir::data_dir(&self.data_root, scope, component, version)
    }

    /// Stop every instance. Starts completing afterwards are discarded.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
