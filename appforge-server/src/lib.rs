//! Appforge server: HTTP surface over the sandbox subsystem.
//!
//! Composition root for the pool manager, runtime manager, bundler, and
//! request proxy. Everything is constructed once here and injected into
//! the handlers through [`AppState`].

use anyhow::Result;
use appforge_common::StatusBroadcaster;
use appforge_sandbox::{
    CodeBundler, ContainerDriver, LocalProcessDriver, PoolManager, RuntimeManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub mod config;
pub mod proxy;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use proxy::RequestProxy;
pub use routes::{create_router, start_server, DeployRequest, DeployResponse};
pub use state::AppState;

pub struct ServerArgs {
    /// Overrides the configured bind address when set.
    pub bind_addr: Option<String>,
    pub config_path: Option<PathBuf>,
    pub verbose: bool,
}

/// Build the full stack from config and serve until shutdown.
pub async fn run_server_app(args: ServerArgs) -> Result<()> {
    // Initialize tracing to both console and file
    let log_level = if args.verbose { "debug" } else { "info" };

    let file_appender = tracing_appender::rolling::never(".", "appforge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "appforge_server={},appforge_sandbox={},appforge_common={}",
                    log_level, log_level, log_level
                ))
            }),
        )
        .init();

    let config = ServerConfig::load(args.config_path.as_deref())?;
    let bind_addr = args.bind_addr.unwrap_or_else(|| config.bind_addr.clone());

    let state = build_state(&config)?;
    let pool = state.runtime.pool();

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("appforge server listening on {}", listener.local_addr()?);

    axum::serve(listener, routes::create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, destroying pooled environments");
    pool.shutdown().await;
    Ok(())
}

/// Wire driver → pool → runtime manager → bundler → proxy.
pub fn build_state(config: &ServerConfig) -> Result<AppState> {
    let driver: Arc<dyn ContainerDriver> = Arc::new(LocalProcessDriver::new());
    let events = Arc::new(StatusBroadcaster::default());
    let pool = PoolManager::new(config.pool.clone().into_pool_config(), driver.clone());
    let runtime = RuntimeManager::new(
        config.runtime.clone().into_runtime_config(),
        pool,
        driver,
        events.clone(),
    );
    let proxy = Arc::new(RequestProxy::new(
        runtime.clone(),
        config.proxy.connect_timeout,
    )?);
    let bundler = Arc::new(CodeBundler::new());
    Ok(AppState::new(runtime, bundler, proxy, events))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
