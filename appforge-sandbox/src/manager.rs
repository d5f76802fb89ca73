//! Runtime manager: deploys artifacts into leased environments and
//! supervises the application process.
//!
//! Operations for the same application are serialized through a per-app
//! lock, and deploys to the same environment queue behind a per-environment
//! lock. Work runs on spawned tasks so an abandoned caller (client
//! disconnect) only stops observing; the in-flight deploy still completes
//! and leaves the environment in a consistent state.

use crate::bundler::Artifact;
use crate::container::ContainerDriver;
use crate::error::{Result, SandboxError};
use crate::pool::PoolManager;
use appforge_common::{
    AppId, DeploymentRecord, EnvironmentId, EnvironmentView, Stats, StatusBroadcaster,
    StatusEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Runtime manager tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeManagerConfig {
    /// How long `start_app` waits for the app to accept connections.
    pub startup_timeout: Duration,
    /// Interval between startup port probes.
    pub poll_interval: Duration,
    /// Build log lines retained per deploy (oldest dropped first).
    pub max_log_lines: usize,
}

impl Default for RuntimeManagerConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(100),
            max_log_lines: 500,
        }
    }
}

/// Deploys artifacts and supervises application processes inside pool
/// environments. Never creates or destroys the isolation primitive
/// directly; that is always delegated to the pool.
pub struct RuntimeManager {
    config: RuntimeManagerConfig,
    pool: Arc<PoolManager>,
    driver: Arc<dyn ContainerDriver>,
    events: Arc<StatusBroadcaster>,
    /// Apps whose process passed startup; what the proxy routes against.
    running: RwLock<HashMap<AppId, EnvironmentId>>,
    env_locks: Mutex<HashMap<EnvironmentId, Arc<Mutex<()>>>>,
    app_locks: Mutex<HashMap<AppId, Arc<Mutex<()>>>>,
}

impl RuntimeManager {
    pub fn new(
        config: RuntimeManagerConfig,
        pool: Arc<PoolManager>,
        driver: Arc<dyn ContainerDriver>,
        events: Arc<StatusBroadcaster>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            driver,
            events,
            running: RwLock::new(HashMap::new()),
            env_locks: Mutex::new(HashMap::new()),
            app_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> Arc<PoolManager> {
        self.pool.clone()
    }

    /// Acquire + deploy + start in one serialized operation.
    ///
    /// Runs on its own task: if the caller goes away mid-flight, the
    /// deploy still finishes and state stays consistent.
    pub async fn launch(
        self: &Arc<Self>,
        app_id: &AppId,
        artifact: Artifact,
    ) -> Result<(EnvironmentView, DeploymentRecord)> {
        let manager = self.clone();
        let app_id = app_id.clone();
        let handle =
            tokio::spawn(async move { manager.launch_inner(&app_id, artifact).await });
        handle
            .await
            .map_err(|e| SandboxError::Driver(format!("launch task failed: {}", e)))?
    }

    async fn launch_inner(
        &self,
        app_id: &AppId,
        artifact: Artifact,
    ) -> Result<(EnvironmentView, DeploymentRecord)> {
        let _app_guard = self.lock_app(app_id).await;

        let environment = self.pool.acquire(app_id).await?;
        let record = self.deploy_code(environment.id, &artifact).await?;
        if !record.success {
            return Err(SandboxError::Deploy {
                environment_id: environment.id,
                message: record
                    .error
                    .clone()
                    .unwrap_or_else(|| "build failed".to_string()),
                logs: record.logs,
            });
        }

        self.start_app(environment.id).await?;
        let environment = self
            .pool
            .get(environment.id)
            .await
            .ok_or(SandboxError::EnvironmentNotFound(environment.id))?;
        Ok((environment, record))
    }

    /// Write the artifact into the environment and run its build/install
    /// step. Serialized per environment: a concurrent deploy to the same
    /// environment queues behind this one.
    ///
    /// Build failure is a result, not an error; the environment survives
    /// for a redeploy.
    pub async fn deploy_code(
        &self,
        environment_id: EnvironmentId,
        artifact: &Artifact,
    ) -> Result<DeploymentRecord> {
        let environment = self
            .pool
            .get(environment_id)
            .await
            .ok_or(SandboxError::EnvironmentNotFound(environment_id))?;
        let _env_guard = self.lock_environment(environment_id).await;

        if let Some(app_id) = &environment.app_id {
            self.events
                .publish(StatusEvent::DeployStarted {
                    app_id: app_id.clone(),
                    environment_id,
                })
                .await;
        }

        let files = artifact_files(artifact);
        self.driver
            .write_files(&environment.container, &files)
            .await?;
        let output = self.driver.run_install(&environment.container).await?;
        self.pool.touch(environment_id).await;

        let mut logs = output.logs;
        if logs.len() > self.config.max_log_lines {
            logs.drain(..logs.len() - self.config.max_log_lines);
        }
        if let Some(app_id) = &environment.app_id {
            for line in &logs {
                self.events
                    .publish(StatusEvent::BuildLog {
                        app_id: app_id.clone(),
                        line: line.clone(),
                    })
                    .await;
            }
        }

        if output.success {
            debug!(environment = %environment_id, hash = %artifact.content_hash, "deploy complete");
            Ok(DeploymentRecord::succeeded(environment_id, logs))
        } else {
            warn!(environment = %environment_id, "install step failed");
            if let Some(app_id) = &environment.app_id {
                self.events
                    .publish(StatusEvent::DeployFailed {
                        app_id: app_id.clone(),
                        environment_id,
                        error: "install step failed".to_string(),
                    })
                    .await;
            }
            Ok(DeploymentRecord::failed(
                environment_id,
                logs,
                "install step failed",
            ))
        }
    }

    /// Launch the application process and wait for it to accept
    /// connections on the environment's internal address.
    pub async fn start_app(&self, environment_id: EnvironmentId) -> Result<()> {
        let environment = self
            .pool
            .get(environment_id)
            .await
            .ok_or(SandboxError::EnvironmentNotFound(environment_id))?;
        let _env_guard = self.lock_environment(environment_id).await;

        self.driver
            .spawn_app(&environment.container, "index.mjs")
            .await?;

        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            match tokio::net::TcpStream::connect(environment.internal_addr).await {
                Ok(_) => break,
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(_) => {
                    // Leave the environment leased; a redeploy/restart may
                    // still succeed.
                    let _ = self.driver.stop_app(&environment.container).await;
                    return Err(SandboxError::StartupTimeout {
                        environment_id,
                        timeout_ms: self.config.startup_timeout.as_millis() as u64,
                    });
                }
            }
        }

        self.pool.touch(environment_id).await;
        if let Some(app_id) = &environment.app_id {
            self.running
                .write()
                .await
                .insert(app_id.clone(), environment_id);
            self.events
                .publish(StatusEvent::AppReady {
                    app_id: app_id.clone(),
                    environment_id,
                })
                .await;
            info!(app_id = %app_id, environment = %environment_id, "app ready");
        }
        Ok(())
    }

    /// Best-effort stats; a failing driver degrades to "unknown".
    pub async fn get_stats(&self, environment_id: EnvironmentId) -> Stats {
        let Some(environment) = self.pool.get(environment_id).await else {
            return Stats::unknown();
        };
        match self.driver.stats(&environment.container).await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(environment = %environment_id, "stats unavailable: {}", e);
                Stats::unknown()
            }
        }
    }

    /// Tear the environment down via the pool and drop the app index
    /// entry. Idempotent.
    pub async fn destroy_environment(&self, environment_id: EnvironmentId) -> Result<()> {
        let environment = self.pool.get(environment_id).await;
        let app_id = environment.as_ref().and_then(|e| e.app_id.clone());

        // Ordered after any in-flight deploy for the same app.
        let _app_guard = match &app_id {
            Some(app_id) => Some(self.lock_app(app_id).await),
            None => None,
        };

        self.running
            .write()
            .await
            .retain(|_, env| *env != environment_id);
        self.env_locks.lock().await.remove(&environment_id);
        self.pool.destroy(environment_id).await?;

        if let Some(app_id) = app_id {
            self.events
                .publish(StatusEvent::AppStopped { app_id })
                .await;
        }
        Ok(())
    }

    /// Destroy whatever environment the application holds. No-op when
    /// nothing is running.
    pub async fn destroy_app(&self, app_id: &AppId) -> Result<()> {
        let Some(environment) = self.pool.lease_for(app_id).await else {
            self.running.write().await.remove(app_id);
            return Ok(());
        };
        self.destroy_environment(environment.id).await
    }

    /// O(1) lookup of the environment serving the application. Only apps
    /// that passed startup appear here.
    pub async fn get_environment_by_app_id(&self, app_id: &AppId) -> Option<EnvironmentView> {
        let environment_id = *self.running.read().await.get(app_id)?;
        self.pool.get(environment_id).await
    }

    /// The environment leased to the app, running or not.
    pub async fn lease_for(&self, app_id: &AppId) -> Option<EnvironmentView> {
        self.pool.lease_for(app_id).await
    }

    /// Flag an environment unhealthy so the pool destroys instead of
    /// recycling it.
    pub async fn mark_unhealthy(&self, environment_id: EnvironmentId) {
        let environment = self.pool.get(environment_id).await;
        self.pool.mark_unhealthy(environment_id).await;
        self.running
            .write()
            .await
            .retain(|_, env| *env != environment_id);
        if let Some(environment) = environment {
            self.events
                .publish(StatusEvent::EnvironmentUnhealthy {
                    app_id: environment.app_id,
                    environment_id,
                })
                .await;
        }
    }

    async fn lock_app(&self, app_id: &AppId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.app_locks.lock().await;
            locks
                .entry(app_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn lock_environment(&self, environment_id: EnvironmentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.env_locks.lock().await;
            locks
                .entry(environment_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Files written into the environment for one artifact: the bundled entry
/// plus a manifest pinning its approved dependencies.
fn artifact_files(artifact: &Artifact) -> Vec<(String, String)> {
    let dependencies: serde_json::Map<String, serde_json::Value> = artifact
        .dependencies
        .iter()
        .map(|d| (d.name.clone(), serde_json::Value::String(d.version.clone())))
        .collect();
    let manifest = serde_json::json!({
        "name": artifact.app_id.as_str(),
        "private": true,
        "type": "module",
        "appforge": { "contentHash": artifact.content_hash },
        "dependencies": dependencies,
    });

    vec![
        ("index.mjs".to_string(), artifact.entry_code.clone()),
        (
            "package.json".to_string(),
            serde_json::to_string_pretty(&manifest).unwrap_or_else(|_| "{}".to_string()),
        ),
    ]
}
