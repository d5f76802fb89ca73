//! Integration tests for request forwarding, asserted against a wiremock
//! upstream standing in for the app process.

use appforge_common::AppId;
use appforge_sandbox::Artifact;
use appforge_tests::common::*;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;

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
async fn test_forward_reaches_upstream_and_strips_hop_by_hop_headers() {
    let driver = MockBackedDriver::new();
    let state = build_test_state(driver.clone());
    let app = AppId::from("a1");
    state.runtime.launch(&app, artifact("a1")).await.unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("x-custom", HeaderValue::from_static("yes"));
    headers.insert("host", HeaderValue::from_static("public.example.com"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));

    let response = state
        .proxy
        .forward(&app, Method::GET, "/api/data", &headers, Bytes::new())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let environment = state.runtime.get_environment_by_app_id(&app).await.unwrap();
    let requests = driver.received_requests(&environment.container).await;
    assert_eq!(requests.len(), 1);
    let upstream = &requests[0];
    assert_eq!(upstream.url.path(), "/api/data");
    assert_eq!(
        upstream.headers.get("x-custom").map(|v| v.as_bytes()),
        Some(&b"yes"[..])
    );
    // The public host header never reaches the environment.
    let host = upstream.headers.get("host").expect("client sets host");
    assert_ne!(host.as_bytes(), b"public.example.com");
}

#[tokio::test]
async fn test_forward_without_environment_is_503_and_no_upstream_call() {
    let driver = MockBackedDriver::new();
    let state = build_test_state(driver);

    let response = state
        .proxy
        .forward(
            &AppId::from("ghost"),
            Method::GET,
            "/",
            &HeaderMap::new(),
            Bytes::new(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_unreachable_environment_is_502() {
    let driver = MockBackedDriver::new();
    let state = build_test_state(driver.clone());
    let app = AppId::from("a1");
    state.runtime.launch(&app, artifact("a1")).await.unwrap();

    let environment = state.runtime.get_environment_by_app_id(&app).await.unwrap();
    driver.kill(&environment.container).await;

    let response = state
        .proxy
        .forward(&app, Method::GET, "/", &HeaderMap::new(), Bytes::new())
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_upstream_body_comes_back_intact() {
    let driver = MockBackedDriver::new();
    let state = build_test_state(driver);
    let app = AppId::from("a1");
    state.runtime.launch(&app, artifact("a1")).await.unwrap();

    let response = state
        .proxy
        .forward(&app, Method::GET, "/", &HeaderMap::new(), Bytes::new())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-upstream").map(|v| v.as_bytes()),
        Some(&b"wiremock"[..])
    );

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    assert_eq!(&body[..], b"mock upstream response");
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let driver = MockBackedDriver::new();
    let state = build_test_state(driver.clone());
    let app = AppId::from("a1");
    state.runtime.launch(&app, artifact("a1")).await.unwrap();

    let payload = Bytes::from_static(b"{\"title\":\"buy milk\"}");
    let response = state
        .proxy
        .forward(
            &app,
            Method::POST,
            "/api/tasks",
            &HeaderMap::new(),
            payload.clone(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let environment = state.runtime.get_environment_by_app_id(&app).await.unwrap();
    let requests = driver.received_requests(&environment.container).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method.as_str(), "POST");
    assert_eq!(requests[0].body, payload.to_vec());
}
