//! End-to-end tests over the full HTTP surface.

use appforge_tests::common::*;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_deploy_start_forward_and_teardown_cycle() {
    setup_test_logging();
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver.clone());
    let addr = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    // Deploy + start
    let response = client
        .post(format!("http://{}/runtime/a1", addr))
        .json(&deploy_body(&[(
            "index.js",
            "export default function(){return 1}",
        )]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ACTIVE");
    assert_eq!(body["url"], "/sandbox/a1");
    assert!(body["environment_id"].is_string());

    // Forward traffic to the running app
    let response = client
        .get(format!("http://{}/sandbox/a1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "stub");
    // Hop-by-hop header from the stub never crosses the proxy.
    assert!(response.headers().get("proxy-connection").is_none());
    let text = response.text().await.unwrap();
    assert!(text.contains("stub app response for /"));

    // Status reflects the running environment with stats
    let response = client
        .get(format!("http://{}/runtime/a1", addr))
        .send()
        .await
        .unwrap();
    let status: serde_json::Value = response.json().await.unwrap();
    assert_eq!(status["status"], "ACTIVE");
    assert_eq!(status["environment"]["status"], "leased");
    assert!(status["stats"]["uptime_secs"].is_number());

    // Idempotent teardown
    let response = client
        .delete(format!("http://{}/runtime/a1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    let response = client
        .delete(format!("http://{}/runtime/a1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    // Traffic now answers 503 locally
    let response = client
        .get(format!("http://{}/sandbox/a1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn test_deep_paths_and_content_type_inference() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver);
    let addr = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{}/runtime/a1", addr))
        .json(&deploy_body(&[("index.js", "export default () => 1")]))
        .send()
        .await
        .unwrap();

    // The stub omits content-type; the proxy infers it from the extension.
    let response = client
        .get(format!("http://{}/sandbox/a1/assets/page.html?v=2", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/html; charset=utf-8"
    );
    let text = response.text().await.unwrap();
    assert!(text.contains("/assets/page.html?v=2"));

    // Extension-less paths get no invented content type.
    let response = client
        .get(format!("http://{}/sandbox/a1/api/items", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("content-type").is_none());
}

#[tokio::test]
async fn test_security_violation_rejects_without_deploy() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver.clone());
    let addr = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/runtime/bad", addr))
        .json(&deploy_body(&[(
            "index.js",
            "require('child_process').exec('ls')",
        )]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["retryable"], false);
    assert!(body["findings"].is_array());
    assert!(!body["findings"].as_array().unwrap().is_empty());

    // No environment was touched: deploy was never invoked.
    assert_eq!(driver.write_calls.load(Ordering::SeqCst), 0);
    assert_eq!(driver.install_calls.load(Ordering::SeqCst), 0);

    let response = client
        .get(format!("http://{}/runtime/bad", addr))
        .send()
        .await
        .unwrap();
    let status: serde_json::Value = response.json().await.unwrap();
    assert_eq!(status["status"], "DRAFT");
    assert!(status.get("environment").is_none());
}

#[tokio::test]
async fn test_failed_build_surfaces_logs() {
    let driver = HttpStubDriver::new();
    driver.install_ok.store(false, Ordering::SeqCst);
    let state = build_test_state(driver);
    let addr = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/runtime/a1", addr))
        .json(&deploy_body(&[("index.js", "export default () => 1")]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["retryable"], true);
    let logs = body["logs"].as_array().unwrap();
    assert!(logs.iter().any(|l| l.as_str().unwrap().contains("build exploded")));

    // The environment stays leased for a retry.
    let status: serde_json::Value = client
        .get(format!("http://{}/runtime/a1", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "DRAFT");
    assert_eq!(status["environment"]["status"], "leased");
}

#[tokio::test]
async fn test_unreachable_running_app_maps_to_502() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver.clone());
    let addr = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{}/runtime/a1", addr))
        .json(&deploy_body(&[("index.js", "export default () => 1")]))
        .send()
        .await
        .unwrap();

    driver.kill_all_apps().await;

    let response = client
        .get(format!("http://{}/sandbox/a1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_post_bodies_round_trip_through_the_proxy() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver);
    let addr = spawn_test_server(state).await;
    let client = reqwest::Client::new();

    client
        .post(format!("http://{}/runtime/a1", addr))
        .json(&deploy_body(&[("index.js", "export default () => 1")]))
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("http://{}/sandbox/a1/api/tasks", addr))
        .body("{\"title\":\"x\"}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("/api/tasks"));
}

#[tokio::test]
async fn test_healthz() {
    let driver = HttpStubDriver::new();
    let state = build_test_state(driver);
    let addr = spawn_test_server(state).await;

    let response = reqwest::get(format!("http://{}/healthz", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}
