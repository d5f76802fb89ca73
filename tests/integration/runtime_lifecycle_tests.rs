//! Integration tests for the pool + runtime manager lifecycle.

use appforge_common::{AppId, StatusEvent};
use appforge_sandbox::{Artifact, SandboxError};
use appforge_tests::common::*;
use assert_matches::assert_matches;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn artifact(app: &str) -> Artifact {
    Artifact {
        app_id: AppId::from(app),
        entry_code: "export default () => 1".to_string(),
        content_hash: "0".repeat(64),
        size_bytes: 22,
        dependencies: Vec::new(),
        findings: Vec::new(),
    }
}

#[tokio::test]
async fn test_relaunch_reuses_leased_environment() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver);
    let app = AppId::from("a1");

    let (first, record) = state.runtime.launch(&app, artifact("a1")).await.unwrap();
    assert!(record.success);

    // Second launch while the lease is active lands in the same environment.
    let (second, _) = state.runtime.launch(&app, artifact("a1")).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(state.runtime.pool().live_count().await, 1);
}

#[tokio::test]
async fn test_destroy_then_relaunch_provisions_fresh_environment() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver);
    let app = AppId::from("a1");

    let (first, _) = state.runtime.launch(&app, artifact("a1")).await.unwrap();
    state.runtime.destroy_environment(first.id).await.unwrap();

    assert!(state.runtime.get_environment_by_app_id(&app).await.is_none());
    assert!(state.runtime.lease_for(&app).await.is_none());

    let (second, _) = state.runtime.launch(&app, artifact("a1")).await.unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn test_status_events_arrive_in_order() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver);
    let app = AppId::from("a1");

    let mut subscription = state.events.subscribe(Some(app.clone())).await;
    state.runtime.launch(&app, artifact("a1")).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), subscription.rx.recv())
        .await
        .expect("event within deadline")
        .expect("subscription open");
    assert_matches!(first.event, StatusEvent::DeployStarted { .. });

    // Build log lines may sit between DeployStarted and AppReady.
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(1), subscription.rx.recv())
            .await
            .expect("event within deadline")
            .expect("subscription open");
        match envelope.event {
            StatusEvent::BuildLog { .. } => continue,
            StatusEvent::AppReady { app_id, .. } => {
                assert_eq!(app_id, app);
                break;
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_events_filtered_to_other_apps_stay_silent() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver);

    let mut other = state.events.subscribe(Some(AppId::from("someone-else"))).await;
    state
        .runtime
        .launch(&AppId::from("a1"), artifact("a1"))
        .await
        .unwrap();

    assert!(other.rx.try_recv().is_err());
}

#[tokio::test]
async fn test_startup_timeout_leaves_lease_for_retry() {
    let driver = HttpStubDriver::new();
    driver.open_port_on_spawn.store(false, Ordering::SeqCst);
    let state = build_test_state(driver.clone());
    let app = AppId::from("a1");

    let err = state.runtime.launch(&app, artifact("a1")).await.unwrap_err();
    assert_matches!(err, SandboxError::StartupTimeout { .. });

    // Not running, but the environment is still leased for a retry.
    assert!(state.runtime.get_environment_by_app_id(&app).await.is_none());
    let lease = state.runtime.lease_for(&app).await.unwrap();

    driver.open_port_on_spawn.store(true, Ordering::SeqCst);
    state.runtime.start_app(lease.id).await.unwrap();
    assert!(state.runtime.get_environment_by_app_id(&app).await.is_some());
}

#[tokio::test]
async fn test_failed_install_returns_logs_and_keeps_environment() {
    let driver = HttpStubDriver::new();
    driver.install_ok.store(false, Ordering::SeqCst);
    let state = build_test_state(driver.clone());
    let app = AppId::from("a1");

    let err = state.runtime.launch(&app, artifact("a1")).await.unwrap_err();
    assert_matches!(err, SandboxError::Deploy { ref logs, .. }
        if logs.iter().any(|l| l.contains("build exploded")));

    let lease = state.runtime.lease_for(&app).await.expect("environment kept");
    driver.install_ok.store(true, Ordering::SeqCst);
    let record = state
        .runtime
        .deploy_code(lease.id, &artifact("a1"))
        .await
        .unwrap();
    assert!(record.success);
}

#[tokio::test]
async fn test_parallel_apps_get_parallel_environments() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver);

    let mut handles = Vec::new();
    for i in 0..3 {
        let runtime = state.runtime.clone();
        handles.push(tokio::spawn(async move {
            let app = AppId::new(format!("app-{}", i));
            runtime.launch(&app, artifact(&format!("app-{}", i))).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let (environment, record) = handle.await.unwrap().unwrap();
        assert!(record.success);
        ids.push(environment.id);
    }
    ids.sort_by_key(|id| id.to_string());
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert_eq!(state.runtime.pool().live_count().await, 3);
}
