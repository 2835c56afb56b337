//! In-memory stand-ins for the content network and for component processes.
//!
//! Available to this crate's tests and, with the `test-support` feature, to
//! other crates' tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{ComponentId, Version};
use tokio::sync::mpsc;

use crate::control::{ComponentStatus, ControlClient, ControlEndpoint};
use crate::error::{ComponentError, ComponentResult};
use crate::process::{ExitReport, LaunchSpec, ProcessHandle, ProcessLauncher};
use crate::store::{ContentAddress, ContentStore, WritableStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A content store held in memory.
///
/// Objects are returned exactly as stored, without re-hashing, so tests can
/// tamper with them through [`MemoryStore::corrupt`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<ContentAddress, Vec<u8>>>,
    pointers: Mutex<HashMap<ComponentId, ContentAddress>>,
    gets: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read fail, as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Object and pointer reads served so far, failed ones included.
    #[must_use]
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Remove an object, e.g. to prove later reads come from a cache.
    pub fn forget(&self, address: &ContentAddress) -> bool {
        lock(&self.objects).remove(address).is_some()
    }

    /// Overwrite an object without changing its address.
    pub fn corrupt(&self, address: &ContentAddress, bytes: Vec<u8>) {
        lock(&self.objects).insert(address.clone(), bytes);
    }

    fn check_online(&self, address: &str) -> ComponentResult<()> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(ComponentError::Store {
                address: address.to_string(),
                message: "network unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get(&self, address: &ContentAddress) -> ComponentResult<Vec<u8>> {
        self.check_online(address.as_str())?;
        lock(&self.objects)
            .get(address)
            .cloned()
            .ok_or_else(|| ComponentError::Store {
                address: address.to_string(),
                message: "object not found".to_string(),
            })
    }

    async fn latest(&self, component: &ComponentId) -> ComponentResult<Option<ContentAddress>> {
        self.check_online(component.as_str())?;
        Ok(lock(&self.pointers).get(component).cloned())
    }
}

#[async_trait]
impl WritableStore for MemoryStore {
    async fn put(&self, bytes: &[u8]) -> ComponentResult<ContentAddress> {
        let address = ContentAddress::of(bytes);
        lock(&self.objects).insert(address.clone(), bytes.to_vec());
        Ok(address)
    }

    async fn set_latest(
        &self,
        component: &ComponentId,
        entry: &ContentAddress,
    ) -> ComponentResult<()> {
        lock(&self.pointers).insert(component.clone(), entry.clone());
        Ok(())
    }
}

/// What ends a fake process.
#[derive(Debug, Clone, Copy)]
enum FakeExit {
    Crash,
    Stop,
}

#[derive(Debug)]
struct FakeProcess {
    component_id: ComponentId,
    version: Version,
    endpoint: ControlEndpoint,
    alive: Arc<AtomicBool>,
    exits: mpsc::UnboundedSender<FakeExit>,
}

/// Component, version, and exit channel of a live process.
type LiveProcess = (ComponentId, Version, mpsc::UnboundedSender<FakeExit>);

#[derive(Debug)]
struct FakeState {
    next_port: u16,
    fixed_port: Option<u16>,
    launches: Vec<LaunchSpec>,
    processes: Vec<FakeProcess>,
    start_failures: VecDeque<String>,
    crash_on_start: HashSet<ComponentId>,
    ignore_stop: HashSet<ComponentId>,
    launch_delay: Duration,
    stop_calls: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            next_port: 40_000,
            fixed_port: None,
            launches: Vec::new(),
            processes: Vec::new(),
            start_failures: VecDeque::new(),
            crash_on_start: HashSet::new(),
            ignore_stop: HashSet::new(),
            launch_delay: Duration::ZERO,
            stop_calls: 0,
        }
    }
}

/// Process launcher and control client backed by in-memory processes.
///
/// Each launch announces `tcp://127.0.0.1:<port>` immediately. Processes
/// run until they are killed, stopped through the control client, or
/// crashed by the test.
#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    /// A runtime with no processes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every launch, to widen race windows.
    #[must_use]
    pub fn with_launch_delay(self, delay: Duration) -> Self {
        lock(&self.state).launch_delay = delay;
        self
    }

    /// Make every launch announce the same `port`, like a component with a
    /// hard-coded listen address.
    #[must_use]
    pub fn announce_on(self, port: u16) -> Self {
        lock(&self.state).fixed_port = Some(port);
        self
    }

    /// Make the next launch fail with `reason`.
    pub fn fail_next_start(&self, reason: impl Into<String>) {
        lock(&self.state).start_failures.push_back(reason.into());
    }

    /// Make every process of `component` exit right after announcing.
    pub fn crash_on_start(&self, component: &ComponentId) {
        lock(&self.state).crash_on_start.insert(component.clone());
    }

    /// Make processes of `component` acknowledge stop calls without exiting.
    pub fn ignore_stop(&self, component: &ComponentId) {
        lock(&self.state).ignore_stop.insert(component.clone());
    }

    /// Crash the newest live process of `component`. Returns whether one was
    /// found.
    pub fn crash(&self, component: &ComponentId) -> bool {
        let state = lock(&self.state);
        state
            .processes
            .iter()
            .rev()
            .find(|p| p.component_id == *component && p.alive.load(Ordering::SeqCst))
            .is_some_and(|p| p.exits.send(FakeExit::Crash).is_ok())
    }

    /// Launch attempts so far, failed ones included.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        lock(&self.state).launches.len()
    }

    /// Processes launched for `component` so far.
    #[must_use]
    pub fn spawn_count_for(&self, component: &ComponentId) -> usize {
        lock(&self.state)
            .launches
            .iter()
            .filter(|l| l.component_id == *component)
            .count()
    }

    /// Processes still alive.
    #[must_use]
    pub fn live_count(&self) -> usize {
        lock(&self.state)
            .processes
            .iter()
            .filter(|p| p.alive.load(Ordering::SeqCst))
            .count()
    }

    /// Versions of `component` still alive, ascending.
    #[must_use]
    pub fn live_versions(&self, component: &ComponentId) -> Vec<Version> {
        let mut versions: Vec<Version> = lock(&self.state)
            .processes
            .iter()
            .filter(|p| p.component_id == *component && p.alive.load(Ordering::SeqCst))
            .map(|p| p.version)
            .collect();
        versions.sort();
        versions
    }

    /// Every launch request, in order.
    #[must_use]
    pub fn launches(&self) -> Vec<LaunchSpec> {
        lock(&self.state).launches.clone()
    }

    /// Stop calls received so far.
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        lock(&self.state).stop_calls
    }

    fn find(&self, endpoint: &ControlEndpoint) -> Option<LiveProcess> {
        lock(&self.state)
            .processes
            .iter()
            .find(|p| p.endpoint == *endpoint && p.alive.load(Ordering::SeqCst))
            .map(|p| (p.component_id.clone(), p.version, p.exits.clone()))
    }
}

#[async_trait]
impl ProcessLauncher for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> ComponentResult<ProcessHandle> {
        let delay = lock(&self.state).launch_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.launches.push(spec.clone());
        if let Some(reason) = state.start_failures.pop_front() {
            return Err(ComponentError::StartFailed {
                component: spec.component_id.clone(),
                version: spec.version,
                reason,
            });
        }

        let port = state.fixed_port.unwrap_or(state.next_port);
        state.next_port = state.next_port.wrapping_add(1);
        let endpoint = ControlEndpoint::parse(&format!("tcp://127.0.0.1:{port}"))?;
        let (handle, mut signals) = ProcessHandle::channel(Some(u32::from(port)), endpoint.clone());
        let (exits, mut exit_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        if state.crash_on_start.contains(&spec.component_id) {
            let _ = exits.send(FakeExit::Crash);
        }
        state.processes.push(FakeProcess {
            component_id: spec.component_id.clone(),
            version: spec.version,
            endpoint,
            alive: Arc::clone(&alive),
            exits,
        });
        drop(state);

        tokio::spawn(async move {
            let report = tokio::select! {
                _ = signals.killed() => ExitReport::lost("killed"),
                exit = exit_rx.recv() => match exit {
                    Some(FakeExit::Crash) => ExitReport::code(101),
                    Some(FakeExit::Stop) => ExitReport::code(0),
                    None => ExitReport::lost("runtime dropped"),
                },
            };
            alive.store(false, Ordering::SeqCst);
            signals.report_exit(report);
        });
        Ok(handle)
    }
}

#[async_trait]
impl ControlClient for FakeRuntime {
    async fn status(&self, endpoint: &ControlEndpoint) -> ComponentResult<ComponentStatus> {
        match self.find(endpoint) {
            Some((_, version, _)) => Ok(ComponentStatus {
                state: "running".to_string(),
                version: Some(version),
            }),
            None => Err(ComponentError::Control {
                endpoint: endpoint.to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }

    async fn stop(&self, endpoint: &ControlEndpoint) -> ComponentResult<()> {
        {
            let mut state = lock(&self.state);
            state.stop_calls = state.stop_calls.saturating_add(1);
        }
        let Some((component, _, exits)) = self.find(endpoint) else {
            return Err(ComponentError::Control {
                endpoint: endpoint.to_string(),
                message: "connection refused".to_string(),
            });
        };
        let ignoring = lock(&self.state).ignore_stop.contains(&component);
        if !ignoring {
            let _ = exits.send(FakeExit::Stop);
        }
        Ok(())
    }
}
