//! Stack construction and request helpers for tests.

use appforge_common::StatusBroadcaster;
use appforge_sandbox::{
    CodeBundler, ContainerDriver, PoolConfig, PoolManager, ResourceLimits, RuntimeManager,
    RuntimeManagerConfig,
};
use appforge_server::{create_router, AppState, RequestProxy};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Pool config tuned for fast tests: small waits, no background reaping.
pub fn test_pool_config() -> PoolConfig {
    PoolConfig {
        capacity: 4,
        acquire_timeout: Duration::from_millis(500),
        idle_ttl: Duration::from_secs(300),
        reap_interval: Duration::from_secs(300),
        provision_attempts: 2,
        provision_backoff: Duration::from_millis(5),
        limits: ResourceLimits::default(),
    }
}

pub fn test_runtime_config() -> RuntimeManagerConfig {
    RuntimeManagerConfig {
        startup_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        max_log_lines: 100,
    }
}

/// Wire a full state (pool → runtime → bundler → proxy) over the given
/// driver.
pub fn build_test_state(driver: Arc<dyn ContainerDriver>) -> AppState {
    let events = Arc::new(StatusBroadcaster::default());
    let pool = PoolManager::new(test_pool_config(), driver.clone());
    let runtime = RuntimeManager::new(test_runtime_config(), pool, driver, events.clone());
    let proxy = Arc::new(
        RequestProxy::new(runtime.clone(), Duration::from_secs(2)).expect("proxy client"),
    );
    AppState::new(runtime, Arc::new(CodeBundler::new()), proxy, events)
}

/// Serve the router on an ephemeral port; returns the bound address.
pub async fn spawn_test_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let router = create_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// JSON body for `POST /runtime/:app_id`.
pub fn deploy_body(files: &[(&str, &str)]) -> serde_json::Value {
    let files: serde_json::Map<String, serde_json::Value> = files
        .iter()
        .map(|(path, content)| {
            (
                path.to_string(),
                serde_json::Value::String(content.to_string()),
            )
        })
        .collect();
    serde_json::json!({ "files": files })
}

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("appforge_sandbox=debug,appforge_server=debug")
        .with_test_writer()
        .try_init();
}
