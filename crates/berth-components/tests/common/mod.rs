//! Shared harness for lifecycle tests.
//!
//! Wires a [`ComponentManager`] to an in-memory content store, a fake
//! process runtime, and a recording notifier inside a scratch home.

use std::sync::Arc;
use std::time::Duration;

use berth_components::testing::{FakeRuntime, MemoryStore};
use berth_components::{
    ComponentDescriptor, ComponentManager, ContentAddress, MigrationHook, NewArtifact,
    RunningComponent, publish,
};
use berth_config::Config;
use berth_core::{ComponentId, ComponentKind, Target, Version, VersionReq};
use berth_test::{RecordingNotifier, TestHome};

/// How long any condition in these tests may take to become true.
#[allow(dead_code)]
pub const SETTLE: Duration = Duration::from_secs(5);

/// Everything a lifecycle test needs.
#[allow(dead_code)]
pub struct Harness {
    /// The manager under test.
    pub manager: ComponentManager,
    /// Fake processes and control endpoints.
    pub runtime: FakeRuntime,
    /// In-memory content network.
    pub store: Arc<MemoryStore>,
    /// Notices raised by the supervisor.
    pub notices: RecordingNotifier,
    /// Scratch home, removed on drop.
    pub home: TestHome,
}

/// Configuration with short delays so crash and stop paths run quickly.
#[allow(dead_code)]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.timeouts.stop_grace_secs = 1;
    config.restart.backoff.initial_delay_ms = 10;
    config.restart.backoff.max_delay_ms = 50;
    config
}

#[allow(dead_code)]
impl Harness {
    /// A harness over [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// A harness over `config`.
    pub fn with_config(config: Config) -> Self {
        Self::with_runtime(config, FakeRuntime::new())
    }

    /// A harness over `config` driving `runtime`.
    pub fn with_runtime(config: Config, runtime: FakeRuntime) -> Self {
        Self::build(config, runtime, None)
    }

    /// A harness whose upgrades migrate data with `migration`.
    pub fn with_migration(migration: Arc<dyn MigrationHook>) -> Self {
        Self::build(test_config(), FakeRuntime::new(), Some(migration))
    }

    fn build(config: Config, runtime: FakeRuntime, migration: Option<Arc<dyn MigrationHook>>) -> Self {
        berth_test::init_test_tracing();
        let home = TestHome::new();
        let store = Arc::new(MemoryStore::new());
        let notices = RecordingNotifier::new();
        let mut builder = ComponentManager::builder(config)
            .home(home.home().clone())
            .store(Arc::clone(&store) as Arc<_>)
            .notifier(Arc::new(notices.clone()))
            .launcher(Arc::new(runtime.clone()))
            .control(Arc::new(runtime.clone()));
        if let Some(migration) = migration {
            builder = builder.migration(migration);
        }
        let manager = builder.build().expect("build manager");
        Self {
            manager,
            runtime,
            store,
            notices,
            home,
        }
    }

    /// Rebuild the manager over the same home and store, as a host restart
    /// would.
    pub fn restart_host(self, config: Config) -> Self {
        let Self {
            runtime,
            store,
            notices,
            home,
            ..
        } = self;
        let manager = ComponentManager::builder(config)
            .home(home.home().clone())
            .store(Arc::clone(&store) as Arc<_>)
            .notifier(Arc::new(notices.clone()))
            .launcher(Arc::new(runtime.clone()))
            .control(Arc::new(runtime.clone()))
            .build()
            .expect("rebuild manager");
        Self {
            manager,
            runtime,
            store,
            notices,
            home,
        }
    }

    /// Publish a backend release and return the artifact's address.
    pub async fn publish_backend(&self, id: &ComponentId, version: Version) -> ContentAddress {
        let bytes = format!("#!/bin/sh\n# {id} {version}\n").into_bytes();
        let address = ContentAddress::of(&bytes);
        publish(
            self.store.as_ref(),
            id,
            version,
            ComponentKind::Backend,
            vec![NewArtifact {
                target: Target::any(),
                bytes,
            }],
        )
        .await
        .expect("publish backend");
        address
    }

    /// Publish a frontend release made of `files`.
    pub async fn publish_frontend(&self, id: &ComponentId, version: Version, files: &[(&str, &str)]) {
        publish(
            self.store.as_ref(),
            id,
            version,
            ComponentKind::Frontend,
            vec![NewArtifact {
                target: Target::any(),
                bytes: berth_test::frontend_bundle(files),
            }],
        )
        .await
        .expect("publish frontend");
    }

    /// Snapshot of every running instance of `id`.
    pub async fn instances(&self, id: &ComponentId) -> Vec<RunningComponent> {
        self.manager.running_for_component(id).await
    }

    /// Poll the instances of `id` until `condition` holds or [`SETTLE`]
    /// passes. Returns whether it held.
    pub async fn wait_for_instances<F>(&self, id: &ComponentId, condition: F) -> bool
    where
        F: Fn(&[RunningComponent]) -> bool,
    {
        let Some(deadline) = tokio::time::Instant::now().checked_add(SETTLE) else {
            return false;
        };
        loop {
            if condition(&self.instances(id).await) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A backend descriptor for `id` accepting `requirement`.
#[allow(dead_code)]
pub fn backend(id: &ComponentId, requirement: &str) -> ComponentDescriptor {
    ComponentDescriptor::new(
        id.clone(),
        ComponentKind::Backend,
        VersionReq::parse(requirement).expect("valid requirement"),
    )
}
