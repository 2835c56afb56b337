//! Shared harness for end-to-end tests.
//!
//! Builds a [`ComponentManager`] with its production collaborators (OS
//! process launcher, TCP control client, directory content store) over a
//! scratch home, and publishes the `fixture-component` binary into that
//! store.

use std::sync::Arc;
use std::time::Duration;

use berth_components::{
    ComponentDescriptor, ComponentManager, ControlClient, ControlEndpoint, DirectoryStore,
    NewArtifact, RunningComponent, TcpControlClient, publish,
};
use berth_config::Config;
use berth_core::{ComponentId, ComponentKind, Target, Version, VersionReq};
use berth_test::{RecordingNotifier, TestHome};

/// How long any condition in these tests may take to become true.
#[allow(dead_code)]
pub const SETTLE: Duration = Duration::from_secs(10);

/// Manager plus everything a test inspects.
#[allow(dead_code)]
pub struct E2e {
    /// The manager under test.
    pub manager: ComponentManager,
    /// Notices raised by the supervisor.
    pub notices: RecordingNotifier,
    /// Scratch home, removed on drop.
    pub home: TestHome,
}

/// Configuration with short timeouts so failure paths finish quickly.
#[allow(dead_code)]
pub fn e2e_config() -> Config {
    let mut config = Config::default();
    config.timeouts.start_announce_secs = 2;
    config.timeouts.stop_grace_secs = 1;
    config.restart.backoff.initial_delay_ms = 20;
    config.restart.backoff.max_delay_ms = 100;
    config.restart.min_uptime_secs = 1;
    config
}

#[allow(dead_code)]
impl E2e {
    /// A manager over [`e2e_config`].
    pub fn new() -> Self {
        Self::with_config(e2e_config())
    }

    /// A manager over `config`.
    pub fn with_config(config: Config) -> Self {
        berth_test::init_test_tracing();
        let home = TestHome::new();
        let notices = RecordingNotifier::new();
        let manager = ComponentManager::builder(config)
            .home(home.home().clone())
            .notifier(Arc::new(notices.clone()))
            .build()
            .expect("build manager");
        Self {
            manager,
            notices,
            home,
        }
    }

    /// Publish the fixture binary as `id` at `version` for this host.
    pub async fn publish_fixture(&self, id: &ComponentId, version: Version) {
        let bytes = std::fs::read(env!("CARGO_BIN_EXE_fixture-component"))
            .expect("read fixture-component binary");
        let store = DirectoryStore::new(self.home.home().store_dir());
        publish(
            &store,
            id,
            version,
            ComponentKind::Backend,
            vec![NewArtifact {
                target: Target::host(),
                bytes,
            }],
        )
        .await
        .expect("publish fixture");
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
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// A backend descriptor for `id` accepting `requirement`, run in `mode`.
#[allow(dead_code)]
pub fn fixture(id: &ComponentId, requirement: &str, mode: &str) -> ComponentDescriptor {
    ComponentDescriptor::new(
        id.clone(),
        ComponentKind::Backend,
        VersionReq::parse(requirement).expect("valid requirement"),
    )
    .with_target(Target::host())
    .with_config(serde_json::json!({ "fixture": { "mode": mode } }))
}

/// Lines of the fixture's launch log in `data_dir`.
#[allow(dead_code)]
pub fn launch_log(data_dir: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(data_dir.join("launches.log"))
        .map(|text| text.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

/// Poll `endpoint` until nothing answers there any more or [`SETTLE`]
/// passes. Returns whether the process went away.
#[allow(dead_code)]
pub async fn wait_until_gone(endpoint: &ControlEndpoint) -> bool {
    let client = TcpControlClient::new(Duration::from_millis(500));
    let Some(deadline) = tokio::time::Instant::now().checked_add(SETTLE) else {
        return false;
    };
    loop {
        if client.status(endpoint).await.is_err() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
