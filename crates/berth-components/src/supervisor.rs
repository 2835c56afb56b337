//! Process supervision.
//!
//! The [`Supervisor`] owns the registry of running instances. It watches
//! every process it registered; an exit that was not preceded by a stop
//! request is a crash, which produces exactly one user-visible warning and
//! then either a restart (subject to the crash-loop guard) or removal.
//!
//! Stopping goes through the component's control endpoint first and falls
//! back to killing the process once the grace period has passed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use berth_config::{ComponentPolicySection, Config};
use berth_core::{ComponentId, Notice, NoticeLevel, Notifier, Target, Version};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{ArtifactCache, CacheKey};
use crate::control::{ComponentStatus, ControlClient, ControlEndpoint};
use crate::error::{ComponentError, ComponentResult};
use crate::process::{ExitReport, LaunchSpec, ProcessHandle, ProcessLauncher};
use crate::registry::{
    ComponentState, Inflight, InstanceId, Managed, RegistryKey, RunningComponent, Slot,
    StartFuture,
};
use crate::restart::{CrashLoopGuard, RestartDecision, RestartPolicy, RestartTracker};

/// Supervisor timing and crash-loop settings.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How long a component may take to exit after a stop call.
    pub stop_grace: Duration,
    /// Crash-loop guard applied to automatic restarts.
    pub crash_guard: CrashLoopGuard,
}

impl SupervisorSettings {
    /// Settings from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            stop_grace: config.timeouts.stop_grace(),
            crash_guard: CrashLoopGuard::from_section(&config.restart),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Restart policies: configured defaults, per-component configuration, and
/// changes made at runtime, in increasing precedence.
#[derive(Debug, Default)]
pub struct PolicyBook {
    defaults: RestartPolicy,
    configured: HashMap<String, ComponentPolicySection>,
    runtime: DashMap<ComponentId, RestartPolicy>,
}

impl PolicyBook {
    /// Policies from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            defaults: RestartPolicy {
                restart_on_crash: config.restart.restart_on_crash,
                shutdown_on_idle: config.restart.shutdown_on_idle,
            },
            configured: config.components.clone(),
            runtime: DashMap::new(),
        }
    }

    /// The policy in effect for `component`.
    #[must_use]
    pub fn policy_for(&self, component: &ComponentId) -> RestartPolicy {
        if let Some(policy) = self.runtime.get(component) {
            return *policy;
        }
        match self.configured.get(component.as_str()) {
            Some(section) => RestartPolicy {
                restart_on_crash: section
                    .restart_on_crash
                    .unwrap_or(self.defaults.restart_on_crash),
                shutdown_on_idle: section
                    .shutdown_on_idle
                    .unwrap_or(self.defaults.shutdown_on_idle),
            },
            None => self.defaults,
        }
    }

    fn set(&self, component: ComponentId, policy: RestartPolicy) {
        self.runtime.insert(component, policy);
    }
}

/// A freshly launched process to register.
pub(crate) struct NewInstance {
    pub(crate) instance_id: InstanceId,
    pub(crate) spec: LaunchSpec,
    pub(crate) handle: ProcessHandle,
    pub(crate) target: Target,
    pub(crate) artifact: Option<CacheKey>,
    pub(crate) policy: RestartPolicy,
    pub(crate) carried: Option<RunningComponent>,
}

/// The registered process currently answering on an endpoint.
struct EndpointClaim {
    process_seq: u64,
    handle: ProcessHandle,
}

/// Owns running instances and reacts to their exits.
pub struct Supervisor {
    slots: DashMap<RegistryKey, Arc<Mutex<Slot>>>,
    index: DashMap<InstanceId, RegistryKey>,
    endpoints: DashMap<ControlEndpoint, EndpointClaim>,
    launcher: Arc<dyn ProcessLauncher>,
    control: Arc<dyn ControlClient>,
    notifier: Arc<dyn Notifier>,
    cache: Arc<ArtifactCache>,
    settings: SupervisorSettings,
    policies: PolicyBook,
    process_seq: AtomicU64,
    closing: AtomicBool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("instances", &self.index.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a supervisor.
    #[must_use]
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        control: Arc<dyn ControlClient>,
        notifier: Arc<dyn Notifier>,
        cache: Arc<ArtifactCache>,
        settings: SupervisorSettings,
        policies: PolicyBook,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            index: DashMap::new(),
            endpoints: DashMap::new(),
            launcher,
            control,
            notifier,
            cache,
            settings,
            policies,
            process_seq: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        })
    }

    /// Snapshot of every registered instance, ordered by component and version.
    pub async fn running(&self) -> Vec<RunningComponent> {
        let slots: Vec<_> = self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        let mut out = Vec::new();
        for slot in slots {
            let guard = slot.lock().await;
            out.extend(guard.instances.iter().map(|m| m.info.clone()));
        }
        out.sort_by(|a, b| {
            (a.component_id.as_str(), a.scope.as_segment(), a.version)
                .cmp(&(b.component_id.as_str(), b.scope.as_segment(), b.version))
        });
        out
    }

    /// Snapshot of one instance.
    pub async fn get(&self, id: InstanceId) -> Option<RunningComponent> {
        let key = self.index.get(&id).map(|k| k.value().clone())?;
        let slot = self.slot(&key);
        let guard = slot.lock().await;
        guard.instances.iter().find(|m| m.info.instance_id == id).map(|m| m.info.clone())
    }

    /// Query an instance's status over its control endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownInstance`] if `id` is not registered,
    /// or the control call's error.
    pub async fn status(&self, id: InstanceId) -> ComponentResult<ComponentStatus> {
        let info = self
            .get(id)
            .await
            .ok_or_else(|| ComponentError::UnknownInstance(id.to_string()))?;
        self.control.status(&info.endpoint).await
    }

    /// Drop one reference. At zero references an instance whose policy has
    /// `shutdown_on_idle` is stopped; otherwise it stays running unreferenced.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownInstance`] if `id` is not registered.
    pub async fn release(&self, id: InstanceId, app: Option<&str>) -> ComponentResult<()> {
        let key = self.key_of(id)?;
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;
        let managed = guard
            .get_mut(id)
            .ok_or_else(|| ComponentError::UnknownInstance(id.to_string()))?;
        managed.info.drop_ref(app);
        if managed.info.ref_count > 0 {
            return Ok(());
        }
        if !managed.info.policy.shutdown_on_idle {
            debug!(component_id = %key.component_id, instance = %id, "Idle, kept running by policy");
            return Ok(());
        }
        let Some(managed) = guard.take(id) else {
            return Ok(());
        };
        drop(guard);
        self.index.remove(&id);
        info!(
            component_id = %key.component_id,
            version = %managed.info.version,
            "No references left, stopping"
        );
        self.stop_managed(managed).await;
        Ok(())
    }

    /// Stop an instance regardless of its reference count.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownInstance`] if `id` is not registered.
    pub async fn stop(&self, id: InstanceId) -> ComponentResult<()> {
        let key = self.key_of(id)?;
        let slot = self.slot(&key);
        let managed = slot
            .lock()
            .await
            .take(id)
            .ok_or_else(|| ComponentError::UnknownInstance(id.to_string()))?;
        self.index.remove(&id);
        self.stop_managed(managed).await;
        Ok(())
    }

    /// Change the policy for `component` and apply it to running instances.
    /// Instances that are now idle and allowed to shut down are stopped.
    pub async fn set_policy(&self, component: &ComponentId, policy: RestartPolicy) {
        self.policies.set(component.clone(), policy);
        let slots: Vec<_> = self
            .slots
            .iter()
            .filter(|s| &s.key().component_id == component)
            .map(|s| Arc::clone(s.value()))
            .collect();

        let mut idle = Vec::new();
        for slot in slots {
            let mut guard = slot.lock().await;
            for managed in &mut guard.instances {
                managed.info.policy = policy;
            }
            if policy.shutdown_on_idle {
                let ids: Vec<_> = guard
                    .instances
                    .iter()
                    .filter(|m| m.info.ref_count == 0 && m.info.state == ComponentState::Running)
                    .map(|m| m.info.instance_id)
                    .collect();
                idle.extend(ids.into_iter().filter_map(|id| guard.take(id)));
            }
        }
        info!(component_id = %component, ?policy, "Restart policy updated");
        for managed in idle {
            self.index.remove(&managed.info.instance_id);
            self.stop_managed(managed).await;
        }
    }

    /// The policy in effect for `component`.
    #[must_use]
    pub fn policy_for(&self, component: &ComponentId) -> RestartPolicy {
        self.policies.policy_for(component)
    }

    /// Stop everything. Starts that finish afterwards are discarded.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.stop_all().await;
    }

    /// Stop every registered instance. The supervisor stays usable.
    pub async fn stop_all(&self) {
        let slots: Vec<_> = self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        let mut all = Vec::new();
        for slot in slots {
            all.append(&mut slot.lock().await.instances);
        }
        self.index.clear();
        info!(count = all.len(), "Stopping all components");
        futures::future::join_all(all.into_iter().map(|m| self.stop_managed(m))).await;
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn slot(&self, key: &RegistryKey) -> Arc<Mutex<Slot>> {
        Arc::clone(self.slots.entry(key.clone()).or_default().value())
    }

    pub(crate) fn launcher(&self) -> &Arc<dyn ProcessLauncher> {
        &self.launcher
    }

    pub(crate) fn unpin(&self, key: &CacheKey) {
        self.cache.unpin(key);
    }

    /// Record `handle` as the owner of its endpoint. Fails while another
    /// registered process that is still alive owns it.
    fn claim_endpoint(
        &self,
        process_seq: u64,
        handle: &ProcessHandle,
        spec: &LaunchSpec,
    ) -> ComponentResult<()> {
        let claim = EndpointClaim {
            process_seq,
            handle: handle.clone(),
        };
        match self.endpoints.entry(handle.endpoint().clone()) {
            Entry::Occupied(mut owner) => {
                let current = owner.get();
                if current.process_seq != process_seq && current.handle.exit_report().is_none() {
                    return Err(ComponentError::StartFailed {
                        component: spec.component_id.clone(),
                        version: spec.version,
                        reason: format!(
                            "announced endpoint {} is already in use by another component",
                            handle.endpoint()
                        ),
                    });
                }
                owner.insert(claim);
            },
            Entry::Vacant(free) => {
                free.insert(claim);
            },
        }
        Ok(())
    }

    fn release_endpoint(&self, process_seq: u64, endpoint: &ControlEndpoint) {
        self.endpoints
            .remove_if(endpoint, |_, claim| claim.process_seq == process_seq);
    }

    fn key_of(&self, id: InstanceId) -> ComponentResult<RegistryKey> {
        self.index
            .get(&id)
            .map(|k| k.value().clone())
            .ok_or_else(|| ComponentError::UnknownInstance(id.to_string()))
    }

    /// Register a launched process under `key`. The caller holds the slot.
    /// `carried` transfers identity and references from an instance being
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::StartFailed`], and kills the process, when
    /// it announced an endpoint a live registered instance already owns.
    pub(crate) fn insert(
        self: &Arc<Self>,
        slot: &mut Slot,
        key: &RegistryKey,
        new: NewInstance,
    ) -> ComponentResult<RunningComponent> {
        let seq = self.process_seq.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.claim_endpoint(seq, &new.handle, &new.spec) {
            warn!(
                component_id = %key.component_id,
                endpoint = %new.handle.endpoint(),
                "Endpoint already taken"
            );
            new.handle.kill();
            return Err(e);
        }
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (ref_count, apps) = new
            .carried
            .map(|c| (c.ref_count, c.apps))
            .unwrap_or_default();
        let info = RunningComponent {
            instance_id: new.instance_id,
            component_id: key.component_id.clone(),
            scope: key.scope.clone(),
            version: new.spec.version,
            target: new.target,
            endpoint: new.handle.endpoint().clone(),
            pid: new.handle.pid(),
            state: ComponentState::Running,
            ref_count,
            apps,
            policy: new.policy,
            data_dir: new.spec.data_dir.clone(),
            started_at: Utc::now(),
            restarts: 0,
        };
        self.watch(key.clone(), new.instance_id, seq, new.handle.clone(), Arc::clone(&stop_requested));
        slot.instances.push(Managed {
            info: info.clone(),
            handle: new.handle,
            process_seq: seq,
            stop_requested,
            tracker: RestartTracker::new(self.settings.crash_guard.clone()),
            spec: new.spec,
            artifact: new.artifact,
            launched_at: Instant::now(),
        });
        self.index.insert(new.instance_id, key.clone());
        Ok(info)
    }

    /// Stop a process that has already been taken out of its slot.
    pub(crate) async fn stop_managed(&self, mut managed: Managed) {
        managed.stop_requested.store(true, Ordering::SeqCst);
        managed.info.state = ComponentState::Stopping;
        let component_id = &managed.info.component_id;
        let version = managed.info.version;

        if managed.handle.exit_report().is_none() {
            let endpoint = managed.handle.endpoint().clone();
            if let Err(e) = self.control.stop(&endpoint).await {
                debug!(component_id = %component_id, %endpoint, error = %e, "Stop call failed");
            }
            match tokio::time::timeout(self.settings.stop_grace, managed.handle.wait()).await {
                Ok(exit) => {
                    debug!(component_id = %component_id, exit = %exit.description, "Component exited");
                },
                Err(_) => {
                    warn!(
                        component_id = %component_id,
                        %version,
                        grace = ?self.settings.stop_grace,
                        "Component did not exit within grace period, killing"
                    );
                    managed.handle.kill();
                    let _ = tokio::time::timeout(self.settings.stop_grace, managed.handle.wait()).await;
                },
            }
        }

        self.release_endpoint(managed.process_seq, managed.handle.endpoint());
        if let Some(key) = &managed.artifact {
            self.cache.unpin(key);
        }
        managed.info.state = ComponentState::NotRunning;
        info!(component_id = %component_id, %version, "Component stopped");
    }

    fn watch(
        self: &Arc<Self>,
        key: RegistryKey,
        id: InstanceId,
        seq: u64,
        handle: ProcessHandle,
        stop_requested: Arc<AtomicBool>,
    ) {
        let supervisor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let exit = handle.wait().await;
            if stop_requested.load(Ordering::SeqCst) {
                return;
            }
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.on_unexpected_exit(key, id, seq, exit).await;
            }
        });
    }

    async fn on_unexpected_exit(self: Arc<Self>, key: RegistryKey, id: InstanceId, seq: u64, exit: ExitReport) {
        let Some(slot) = self.slots.get(&key).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut guard = slot.lock().await;
        let closing = self.is_closing();
        let Some(managed) = guard.get_mut(id) else {
            return;
        };
        if managed.process_seq != seq || managed.stop_requested.load(Ordering::SeqCst) {
            return;
        }

        managed.info.state = ComponentState::Crashed;
        let component = managed.info.component_id.clone();
        let version = managed.info.version;
        let crash = ComponentError::Crashed {
            component: component.clone(),
            version,
            exit: exit.description.clone(),
        };
        warn!(component_id = %component, %version, exit = %exit.description, "Component crashed");

        let decision = (managed.info.policy.restart_on_crash && !closing)
            .then(|| managed.tracker.on_crash(managed.launched_at.elapsed(), Instant::now()));

        if let Some(RestartDecision::RestartAfter(delay)) = decision {
            managed.info.state = ComponentState::Starting;
            let spec = managed.spec.clone();
            self.notifier.notify(Notice::warning(
                &component,
                "Component crashed",
                format!("{crash}. Restarting it."),
            ));
            let generation = guard.next_generation();
            let future = self.spawn_restart(key, id, seq, spec, delay, generation);
            guard.inflight.push(Inflight {
                generation,
                version,
                future,
                restarting: Some(id),
            });
            return;
        }

        let removed = guard.take(id);
        drop(guard);
        self.index.remove(&id);
        if let Some(managed) = &removed {
            self.forget(managed);
        }
        let message = match decision {
            Some(RestartDecision::GiveUp { crashes }) => format!(
                "{crash}. It crashed {crashes} times in quick succession and will not be restarted."
            ),
            _ => format!("{crash}. It will not be restarted."),
        };
        self.notifier
            .notify(Notice::warning(&component, "Component crashed", message));
    }

    /// Drop the endpoint claim and artifact pin of an instance removed
    /// without a stop.
    fn forget(&self, managed: &Managed) {
        self.release_endpoint(managed.process_seq, managed.handle.endpoint());
        if let Some(key) = &managed.artifact {
            self.cache.unpin(key);
        }
    }

    fn spawn_restart(
        self: &Arc<Self>,
        key: RegistryKey,
        id: InstanceId,
        crashed_seq: u64,
        spec: LaunchSpec,
        delay: Duration,
        generation: u64,
    ) -> StartFuture {
        let component = spec.component_id.clone();
        let version = spec.version;
        let supervisor = Arc::clone(self);
        let task = tokio::spawn(async move {
            supervisor
                .restart(key, id, crashed_seq, spec, delay, generation)
                .await
        });
        shared_start(task, component, version)
    }

    /// Relaunch the process behind `id` that exited as `crashed_seq`. If the
    /// instance was replaced meanwhile (an upgrade took over its id), the
    /// relaunched process is discarded and the replacement left alone.
    async fn restart(
        self: Arc<Self>,
        key: RegistryKey,
        id: InstanceId,
        crashed_seq: u64,
        spec: LaunchSpec,
        delay: Duration,
        generation: u64,
    ) -> ComponentResult<InstanceId> {
        if !delay.is_zero() {
            debug!(component_id = %spec.component_id, ?delay, "Waiting before restart");
            tokio::time::sleep(delay).await;
        }
        let launched = self.launcher.launch(&spec).await;

        let slot = self.slot(&key);
        let mut guard = slot.lock().await;
        guard.finish(generation);

        let closing = self.is_closing();
        let current = guard
            .get_mut(id)
            .filter(|_| !closing)
            .map(|m| m.process_seq == crashed_seq && m.info.version == spec.version);
        match (current, launched) {
            (None, Ok(handle)) => {
                debug!(component_id = %spec.component_id, "Instance gone before restart finished");
                handle.kill();
                Err(ComponentError::UnknownInstance(id.to_string()))
            },
            (Some(false), Ok(handle)) => {
                debug!(component_id = %spec.component_id, "Instance replaced before restart finished");
                handle.kill();
                Ok(id)
            },
            (None | Some(false), Err(e)) => Err(e),
            (Some(true), launched) => self.relaunched(guard, key, id, spec, launched),
        }
    }

    /// Swap a relaunched process into `id`, or remove `id` if the relaunch
    /// failed or announced a taken endpoint.
    fn relaunched(
        self: &Arc<Self>,
        mut guard: MutexGuard<'_, Slot>,
        key: RegistryKey,
        id: InstanceId,
        spec: LaunchSpec,
        launched: ComponentResult<ProcessHandle>,
    ) -> ComponentResult<InstanceId> {
        let seq = self.process_seq.fetch_add(1, Ordering::Relaxed);
        let launched = launched.and_then(|handle| {
            self.claim_endpoint(seq, &handle, &spec).map_err(|e| {
                handle.kill();
                e
            })?;
            Ok(handle)
        });
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                let removed = guard.take(id);
                drop(guard);
                self.index.remove(&id);
                if let Some(managed) = &removed {
                    self.forget(managed);
                }
                self.notifier.notify(
                    Notice::new(
                        NoticeLevel::Error,
                        "Restart failed",
                        format!(
                            "{} {} could not be restarted: {}",
                            spec.component_id,
                            spec.version,
                            e.user_message()
                        ),
                    )
                    .with_component(spec.component_id.clone()),
                );
                return Err(e);
            },
        };

        let Some(managed) = guard.get_mut(id) else {
            self.release_endpoint(seq, handle.endpoint());
            handle.kill();
            return Err(ComponentError::UnknownInstance(id.to_string()));
        };
        let previous = (managed.process_seq, managed.handle.endpoint().clone());
        let stop_requested = Arc::new(AtomicBool::new(false));
        managed.info.endpoint = handle.endpoint().clone();
        managed.info.pid = handle.pid();
        managed.info.state = ComponentState::Running;
        managed.info.started_at = Utc::now();
        managed.info.restarts = managed.info.restarts.saturating_add(1);
        managed.handle = handle.clone();
        managed.process_seq = seq;
        managed.stop_requested = Arc::clone(&stop_requested);
        managed.launched_at = Instant::now();
        let restarts = managed.info.restarts;
        self.watch(key, id, seq, handle, stop_requested);
        drop(guard);
        self.release_endpoint(previous.0, &previous.1);

        info!(
            component_id = %spec.component_id,
            version = %spec.version,
            restarts,
            "Component restarted"
        );
        Ok(id)
    }
}

/// Turn a spawned start task into a future every waiter can share.
pub(crate) fn shared_start(
    task: JoinHandle<ComponentResult<InstanceId>>,
    component: ComponentId,
    version: Version,
) -> StartFuture {
    async move {
        task.await.unwrap_or_else(|e| {
            Err(ComponentError::StartFailed {
                component,
                version,
                reason: format!("start task failed: {e}"),
            })
        })
    }
    .boxed()
    .shared()
}
