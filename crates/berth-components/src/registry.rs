//! Registry of running component instances.
//!
//! Instances are grouped into one [`Slot`] per `(scope, componentId)`. A
//! slot holds every live instance of that identity (several majors may run
//! side by side) plus the starts and restarts still in flight. The
//! coordinator only begins a start when nothing is in flight, so a given
//! identity never has two concurrent spawns from callers. All mutations of a
//! slot happen under its async mutex; different identities never contend.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use berth_core::{ComponentId, Scope, Target, Version};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::CacheKey;
use crate::control::ControlEndpoint;
use crate::datadir::DataDirectoryKey;
use crate::error::ComponentError;
use crate::process::{LaunchSpec, ProcessHandle};
use crate::restart::{RestartPolicy, RestartTracker};

/// Stable identity of a running instance.
///
/// Survives automatic restarts and in-place upgrades, so a caller that
/// acquired an instance can always release it by the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// A fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    /// No process.
    NotRunning,
    /// Spawned, waiting for the endpoint announcement.
    Starting,
    /// Endpoint announced; serving calls.
    Running,
    /// Stop requested; waiting for exit.
    Stopping,
    /// Exited without a stop request.
    Crashed,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotRunning => "not running",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningComponent {
    /// Stable instance id.
    pub instance_id: InstanceId,
    /// Component id.
    pub component_id: ComponentId,
    /// Owning scope.
    pub scope: Scope,
    /// Running version.
    pub version: Version,
    /// Artifact target.
    pub target: Target,
    /// Announced control endpoint.
    pub endpoint: ControlEndpoint,
    /// OS process id.
    pub pid: Option<u32>,
    /// Current state.
    pub state: ComponentState,
    /// Outstanding acquisitions.
    pub ref_count: u32,
    /// Outstanding acquisitions per app id.
    pub apps: BTreeMap<String, u32>,
    /// Policy in effect.
    pub policy: RestartPolicy,
    /// The instance's data directory.
    pub data_dir: PathBuf,
    /// When the current process announced its endpoint.
    pub started_at: DateTime<Utc>,
    /// Automatic restarts so far.
    pub restarts: u32,
}

impl RunningComponent {
    /// Key of this instance's data directory.
    #[must_use]
    pub fn data_key(&self) -> DataDirectoryKey {
        DataDirectoryKey::new(self.scope.clone(), self.component_id.clone(), &self.version)
    }

    /// Whether `app_id` holds a reference.
    #[must_use]
    pub fn is_used_by(&self, app_id: &str) -> bool {
        self.apps.contains_key(app_id)
    }

    pub(crate) fn add_ref(&mut self, app: Option<&str>) {
        self.ref_count = self.ref_count.saturating_add(1);
        if let Some(app) = app {
            let count = self.apps.entry(app.to_string()).or_insert(0);
            *count = count.saturating_add(1);
        }
    }

    pub(crate) fn drop_ref(&mut self, app: Option<&str>) {
        self.ref_count = self.ref_count.saturating_sub(1);
        if let Some(app) = app
            && let Some(count) = self.apps.get_mut(app)
        {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.apps.remove(app);
            }
        }
    }
}

/// Registry identity of an instance group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RegistryKey {
    pub(crate) scope: Scope,
    pub(crate) component_id: ComponentId,
}

impl RegistryKey {
    pub(crate) fn new(scope: Scope, component_id: ComponentId) -> Self {
        Self {
            scope,
            component_id,
        }
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.component_id)
    }
}

/// Shared result of one start, awaited by every caller that wants it.
pub(crate) type StartFuture = Shared<BoxFuture<'static, Result<InstanceId, ComponentError>>>;

/// A start or restart that has not finished yet.
pub(crate) struct Inflight {
    pub(crate) generation: u64,
    pub(crate) version: Version,
    pub(crate) future: StartFuture,
    /// Set for an automatic restart of this instance.
    pub(crate) restarting: Option<InstanceId>,
}

/// A supervised instance and the process currently backing it.
pub(crate) struct Managed {
    pub(crate) info: RunningComponent,
    pub(crate) handle: ProcessHandle,
    pub(crate) process_seq: u64,
    pub(crate) stop_requested: Arc<AtomicBool>,
    pub(crate) tracker: RestartTracker,
    pub(crate) spec: LaunchSpec,
    pub(crate) artifact: Option<CacheKey>,
    pub(crate) launched_at: Instant,
}

/// Everything registered under one [`RegistryKey`].
#[derive(Default)]
pub(crate) struct Slot {
    pub(crate) instances: Vec<Managed>,
    pub(crate) inflight: Vec<Inflight>,
    generation: u64,
}

impl Slot {
    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    /// The newest running instance whose version passes `accept`.
    pub(crate) fn best_running<F>(&mut self, accept: F) -> Option<&mut Managed>
    where
        F: Fn(&Version) -> bool,
    {
        self.instances
            .iter_mut()
            .filter(|m| m.info.state == ComponentState::Running && accept(&m.info.version))
            .max_by_key(|m| m.info.version)
    }

    pub(crate) fn position(&self, id: InstanceId) -> Option<usize> {
        self.instances.iter().position(|m| m.info.instance_id == id)
    }

    pub(crate) fn get_mut(&mut self, id: InstanceId) -> Option<&mut Managed> {
        self.instances.iter_mut().find(|m| m.info.instance_id == id)
    }

    pub(crate) fn take(&mut self, id: InstanceId) -> Option<Managed> {
        self.position(id).map(|i| self.instances.swap_remove(i))
    }

    /// Drop the in-flight marker of `generation`.
    pub(crate) fn finish(&mut self, generation: u64) {
        self.inflight.retain(|f| f.generation != generation);
    }

    /// Stop waiting on a restart of `id`; the instance was replaced. The
    /// restart itself notices and discards its process.
    pub(crate) fn forget_restart(&mut self, id: InstanceId) {
        self.inflight.retain(|f| f.restarting != Some(id));
    }

    /// The in-flight start to wait on, preferring one whose version passes
    /// `accept`.
    pub(crate) fn pending<F>(&self, accept: F) -> Option<(Version, StartFuture)>
    where
        F: Fn(&Version) -> bool,
    {
        self.inflight
            .iter()
            .find(|f| accept(&f.version))
            .or_else(|| self.inflight.first())
            .map(|f| (f.version, f.future.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> RunningComponent {
        RunningComponent {
            instance_id: InstanceId::new(),
            component_id: ComponentId::from_static("com.example.notes"),
            scope: Scope::Shared,
            version: Version::new(1, 2, 5),
            target: Target::any(),
            endpoint: ControlEndpoint::parse("tcp://127.0.0.1:1").unwrap(),
            pid: None,
            state: ComponentState::Running,
            ref_count: 0,
            apps: BTreeMap::new(),
            policy: RestartPolicy::default(),
            data_dir: PathBuf::from("/data/shared/com.example.notes/v1.2"),
            started_at: Utc::now(),
            restarts: 0,
        }
    }

    #[test]
    fn refs_are_tracked_per_app() {
        let mut rc = snapshot();
        rc.add_ref(Some("notes-app"));
        rc.add_ref(Some("notes-app"));
        rc.add_ref(None);
        assert_eq!(rc.ref_count, 3);
        assert!(rc.is_used_by("notes-app"));

        rc.drop_ref(Some("notes-app"));
        rc.drop_ref(Some("notes-app"));
        assert!(!rc.is_used_by("notes-app"));
        rc.drop_ref(None);
        rc.drop_ref(None);
        assert_eq!(rc.ref_count, 0);
    }

    #[test]
    fn data_key_follows_major_minor() {
        let rc = snapshot();
        let key = rc.data_key();
        assert_eq!((key.major, key.minor), (1, 2));
    }

    #[test]
    fn instance_id_round_trips_through_text() {
        let id = InstanceId::new();
        assert_eq!(id.to_string().parse::<InstanceId>().unwrap(), id);
    }
}
