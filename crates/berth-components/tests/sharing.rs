//! Sharing, deduplication, upgrades, and isolation of running instances.

mod common;

use std::sync::Arc;
use std::time::Duration;

use berth_components::testing::FakeRuntime;
use berth_components::{AcquireRequest, ComponentError, ComponentState, CopyMigration};
use berth_core::{ComponentId, Scope, Version};
use common::{Harness, SETTLE, backend, test_config};

fn notes() -> ComponentId {
    ComponentId::from_static("ant://notes/backend")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_spawn_one_process() {
    let runtime = FakeRuntime::new().with_launch_delay(Duration::from_millis(100));
    let h = Harness::with_runtime(test_config(), runtime);
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;

    let acquires = (0..5).map(|_| h.manager.acquire(backend(&notes(), "^1.0"), None));
    let results = futures::future::join_all(acquires).await;

    let ids: Vec<_> = results
        .into_iter()
        .map(|r| r.unwrap().instance_id)
        .collect();
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(h.runtime.spawn_count(), 1);

    let running = h.instances(&notes()).await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].ref_count, 5);
}

#[tokio::test]
async fn matching_instance_is_reused() {
    let h = Harness::new();
    h.publish_backend(&notes(), Version::new(1, 2, 0)).await;

    let first = h.manager.acquire(backend(&notes(), "^1.0"), None).await.unwrap();
    let second = h.manager.acquire(backend(&notes(), "^1.2"), None).await.unwrap();

    assert_eq!(first.instance_id, second.instance_id);
    assert_eq!(second.ref_count, 2);
    assert_eq!(second.state, ComponentState::Running);
    assert_eq!(h.runtime.spawn_count(), 1);
}

#[tokio::test]
async fn newer_compatible_version_upgrades_in_place() {
    let h = Harness::new();
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;
    let old = h.manager.acquire(backend(&notes(), "^1.0"), None).await.unwrap();

    std::fs::create_dir_all(&old.data_dir).unwrap();
    std::fs::write(old.data_dir.join("notes.db"), b"three notes").unwrap();

    h.publish_backend(&notes(), Version::new(1, 1, 0)).await;
    let new = h.manager.acquire(backend(&notes(), "^1.1"), None).await.unwrap();

    assert_eq!(new.instance_id, old.instance_id);
    assert_eq!(new.version, Version::new(1, 1, 0));
    assert_eq!(new.ref_count, 2);
    assert_ne!(new.data_dir, old.data_dir);
    assert!(!new.data_dir.join("notes.db").exists());
    assert!(old.data_dir.join("notes.db").exists());

    assert!(berth_test::wait_until(SETTLE, || h.runtime.live_count() == 1).await);
    assert_eq!(h.runtime.live_versions(&notes()), vec![Version::new(1, 1, 0)]);
    assert_eq!(h.instances(&notes()).await.len(), 1);
}

#[tokio::test]
async fn copy_migration_carries_data_when_opted_in() {
    let h = Harness::with_migration(Arc::new(CopyMigration));
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;
    let old = h.manager.acquire(backend(&notes(), "^1.0"), None).await.unwrap();

    std::fs::create_dir_all(&old.data_dir).unwrap();
    std::fs::write(old.data_dir.join("notes.db"), b"three notes").unwrap();

    h.publish_backend(&notes(), Version::new(1, 1, 0)).await;
    let new = h.manager.acquire(backend(&notes(), "^1.1"), None).await.unwrap();

    assert_eq!(new.instance_id, old.instance_id);
    assert_eq!(
        std::fs::read(new.data_dir.join("notes.db")).unwrap(),
        b"three notes"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_during_upgrade_leaves_only_the_new_version() {
    let runtime = FakeRuntime::new().with_launch_delay(Duration::from_millis(300));
    let h = Harness::with_runtime(test_config(), runtime);
    h.publish_backend(&notes(), Version::new(1, 2, 5)).await;
    let old = h.manager.acquire(backend(&notes(), "^1.2"), None).await.unwrap();
    h.publish_backend(&notes(), Version::new(1, 3, 0)).await;

    let upgrade = h.manager.acquire(backend(&notes(), "^1.3"), None);
    let crash = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.runtime.crash(&notes()));
    };
    let (upgraded, ()) = tokio::join!(upgrade, crash);
    let upgraded = upgraded.unwrap();
    assert_eq!(upgraded.instance_id, old.instance_id);
    assert_eq!(upgraded.version, Version::new(1, 3, 0));

    // Initial start, upgrade, and the restart of the crashed 1.2.5.
    assert!(berth_test::wait_until(SETTLE, || h.runtime.spawn_count() == 3).await);
    assert!(berth_test::wait_until(SETTLE, || h.runtime.live_count() == 1).await);
    assert_eq!(h.runtime.live_versions(&notes()), vec![Version::new(1, 3, 0)]);

    let running = h.instances(&notes()).await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].version, Version::new(1, 3, 0));
    assert_eq!(running[0].state, ComponentState::Running);
    assert_eq!(running[0].ref_count, 2);
    let status = h.manager.status(running[0].instance_id).await.unwrap();
    assert_eq!(status.version, Some(Version::new(1, 3, 0)));
}

#[tokio::test]
async fn patch_upgrade_keeps_data_directory() {
    let h = Harness::new();
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;
    let old = h.manager.acquire(backend(&notes(), "^1.0"), None).await.unwrap();
    h.publish_backend(&notes(), Version::new(1, 0, 1)).await;
    let new = h.manager.acquire(backend(&notes(), "^1.0.1"), None).await.unwrap();

    assert_eq!(new.instance_id, old.instance_id);
    assert_eq!(new.data_dir, old.data_dir);
}

#[tokio::test]
async fn different_major_runs_side_by_side() {
    let h = Harness::new();
    h.publish_backend(&notes(), Version::new(1, 4, 0)).await;
    h.publish_backend(&notes(), Version::new(2, 0, 0)).await;

    let v1 = h.manager.acquire(backend(&notes(), "^1.0"), None).await.unwrap();
    let v2 = h.manager.acquire(backend(&notes(), "^2.0"), None).await.unwrap();

    assert_ne!(v1.instance_id, v2.instance_id);
    assert_ne!(v1.data_dir, v2.data_dir);
    assert_eq!(
        h.runtime.live_versions(&notes()),
        vec![Version::new(1, 4, 0), Version::new(2, 0, 0)]
    );
}

#[tokio::test]
async fn scopes_do_not_share_instances() {
    let h = Harness::new();
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;

    let shared = h
        .manager
        .acquire(backend(&notes(), "^1.0"), Some(Scope::Shared))
        .await
        .unwrap();
    let alice = h
        .manager
        .acquire(backend(&notes(), "^1.0"), Some(Scope::user("alice").unwrap()))
        .await
        .unwrap();

    assert_ne!(shared.instance_id, alice.instance_id);
    assert_ne!(shared.data_dir, alice.data_dir);
    assert_eq!(h.runtime.spawn_count(), 2);
}

#[tokio::test]
async fn forced_version_below_running_starts_alongside() {
    let h = Harness::new();
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;
    h.publish_backend(&notes(), Version::new(1, 3, 0)).await;

    let latest = h.manager.acquire(backend(&notes(), "^1.0"), None).await.unwrap();
    assert_eq!(latest.version, Version::new(1, 3, 0));

    let request = AcquireRequest::new(backend(&notes(), "^1.0"), Scope::Shared)
        .with_force_version(Some(Version::new(1, 0, 0)));
    let pinned = h.manager.acquire_request(request).await.unwrap();

    assert_eq!(pinned.version, Version::new(1, 0, 0));
    assert_ne!(pinned.instance_id, latest.instance_id);
    assert_eq!(h.instances(&notes()).await.len(), 2);
}

#[tokio::test]
async fn older_patch_of_running_line_is_refused() {
    let h = Harness::new();
    h.publish_backend(&notes(), Version::new(1, 2, 5)).await;
    h.publish_backend(&notes(), Version::new(1, 2, 9)).await;

    let newest = h.manager.acquire(backend(&notes(), "^1.2"), None).await.unwrap();
    assert_eq!(newest.version, Version::new(1, 2, 9));

    let err = h
        .manager
        .acquire(backend(&notes(), "=1.2.5"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ComponentError::VersionConflict { running, requested, .. }
            if running == Version::new(1, 2, 9) && requested == Version::new(1, 2, 5)
    ));
    assert_eq!(h.runtime.spawn_count(), 1);
    assert_eq!(h.instances(&notes()).await.len(), 1);
}

#[tokio::test]
async fn shared_endpoint_is_refused() {
    let runtime = FakeRuntime::new().announce_on(4242);
    let h = Harness::with_runtime(test_config(), runtime);
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;
    h.publish_backend(&notes(), Version::new(2, 0, 0)).await;

    let first = h.manager.acquire(backend(&notes(), "^1"), None).await.unwrap();
    let err = h
        .manager
        .acquire(backend(&notes(), "^2"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ComponentError::StartFailed { ref reason, .. } if reason.contains("already in use")));

    assert!(berth_test::wait_until(SETTLE, || h.runtime.live_count() == 1).await);
    let running = h.instances(&notes()).await;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].instance_id, first.instance_id);
}

#[tokio::test]
async fn endpoint_is_free_again_after_stop() {
    let runtime = FakeRuntime::new().announce_on(4242);
    let h = Harness::with_runtime(test_config(), runtime);
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;
    h.publish_backend(&notes(), Version::new(2, 0, 0)).await;

    let first = h.manager.acquire(backend(&notes(), "^1"), None).await.unwrap();
    h.manager.stop(first.instance_id).await.unwrap();
    let second = h.manager.acquire(backend(&notes(), "^2"), None).await.unwrap();
    assert_eq!(second.version, Version::new(2, 0, 0));
    assert_eq!(second.endpoint, first.endpoint);
}

#[tokio::test]
async fn abandoned_start_is_kept_for_reuse() {
    let runtime = FakeRuntime::new().with_launch_delay(Duration::from_millis(200));
    let h = Harness::with_runtime(test_config(), runtime);
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;

    let gave_up = tokio::time::timeout(
        Duration::from_millis(50),
        h.manager.acquire(backend(&notes(), "^1.0"), None),
    )
    .await;
    assert!(gave_up.is_err());

    let registered = h
        .wait_for_instances(&notes(), |all| {
            all.len() == 1 && all[0].state == ComponentState::Running
        })
        .await;
    assert!(registered);
    assert_eq!(h.instances(&notes()).await[0].ref_count, 0);

    let reused = h.manager.acquire(backend(&notes(), "^1.0"), None).await.unwrap();
    assert_eq!(reused.ref_count, 1);
    assert_eq!(h.runtime.spawn_count(), 1);
}

#[tokio::test]
async fn failed_start_registers_nothing() {
    let h = Harness::new();
    h.publish_backend(&notes(), Version::new(1, 0, 0)).await;
    h.runtime.fail_next_start("port already in use");

    let err = h
        .manager
        .acquire(backend(&notes(), "^1.0"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ComponentError::StartFailed { ref reason, .. } if reason.contains("port")));
    assert!(h.instances(&notes()).await.is_empty());

    let retried = h.manager.acquire(backend(&notes(), "^1.0"), None).await.unwrap();
    assert_eq!(retried.ref_count, 1);
}

#[tokio::test]
async fn tampered_artifact_never_starts() {
    let h = Harness::new();
    let artifact = h.publish_backend(&notes(), Version::new(1, 0, 0)).await;
    h.store.corrupt(&artifact, b"#!/bin/sh\nrm -rf /\n".to_vec());

    let err = h
        .manager
        .acquire(backend(&notes(), "^1.0"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ComponentError::IntegrityMismatch { .. }));
    assert_eq!(h.runtime.spawn_count(), 0);
    assert!(h.manager.cached().is_empty());
}

#[tokio::test]
async fn unknown_component_is_not_found() {
    let h = Harness::new();
    let err = h
        .manager
        .acquire(backend(&notes(), "^1.0"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ComponentError::NotFound { .. }));
}
