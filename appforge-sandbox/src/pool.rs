//! Environment pool: provisioning, leasing, recycling, reaping.
//!
//! The pool exclusively owns environment records and their container
//! handles. A capacity semaphore bounds how many environments exist at
//! once (provisioning, idle, and leased all count); `acquire` waits for a
//! freed slot up to a configured timeout rather than blocking forever.
//! Callers that operate per application are serialized upstream by the
//! runtime manager; the pool itself additionally reserves the lease slot
//! before any await point so the one-lease-per-app invariant holds even
//! under racing acquires.

use crate::container::ContainerDriver;
use crate::error::{Result, SandboxError};
use crate::limits::ResourceLimits;
use appforge_common::{
    AppId, ContainerRef, EnvironmentId, EnvironmentStatus, EnvironmentView,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum environments alive at once (provisioning + idle + leased).
    pub capacity: usize,
    /// How long `acquire` may wait for a free slot.
    pub acquire_timeout: Duration,
    /// Idle environments older than this are reaped.
    pub idle_ttl: Duration,
    /// Reaper wake-up interval.
    pub reap_interval: Duration,
    /// Cold-start attempts before `Provision` surfaces.
    pub provision_attempts: u32,
    /// Base backoff between cold-start attempts; doubles per attempt.
    pub provision_backoff: Duration,
    /// Limits applied to every provisioned environment.
    pub limits: ResourceLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            acquire_timeout: Duration::from_secs(30),
            idle_ttl: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            provision_attempts: 3,
            provision_backoff: Duration::from_secs(1),
            limits: ResourceLimits::default(),
        }
    }
}

struct EnvironmentRecord {
    id: EnvironmentId,
    app_id: Option<AppId>,
    status: EnvironmentStatus,
    internal_addr: SocketAddr,
    container: ContainerRef,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    /// Capacity slot; freed when the record is dropped on destroy.
    _permit: OwnedSemaphorePermit,
}

impl EnvironmentRecord {
    fn view(&self) -> EnvironmentView {
        EnvironmentView {
            id: self.id,
            app_id: self.app_id.clone(),
            status: self.status,
            internal_addr: self.internal_addr,
            container: self.container.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
        }
    }
}

#[derive(Default)]
struct PoolState {
    environments: HashMap<EnvironmentId, EnvironmentRecord>,
    idle: VecDeque<EnvironmentId>,
    leases: HashMap<AppId, EnvironmentId>,
}

enum LeaseCheck {
    None,
    Ready(EnvironmentView),
    InFlight,
}

/// Owns the bounded set of execution environments.
pub struct PoolManager {
    config: PoolConfig,
    driver: Arc<dyn ContainerDriver>,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    /// Pinged whenever a slot or idle environment frees up.
    released: Notify,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolManager {
    /// Construct the pool and start its background reaper.
    pub fn new(config: PoolConfig, driver: Arc<dyn ContainerDriver>) -> Arc<Self> {
        let pool = Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.capacity)),
            config,
            driver,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
            reaper: Mutex::new(None),
        });
        let handle = Self::spawn_reaper(Arc::downgrade(&pool));
        // Stash the handle so shutdown can abort it. try_lock cannot fail
        // here: the pool has not escaped yet.
        if let Ok(mut slot) = pool.reaper.try_lock() {
            *slot = Some(handle);
        }
        pool
    }

    /// Lease an environment for the application.
    ///
    /// Idempotent while a healthy lease exists: the same environment comes
    /// back. Otherwise prefers a warm idle environment, cold-starts while
    /// capacity allows, and fails with `CapacityExceeded` once the wait
    /// budget runs out.
    pub async fn acquire(&self, app_id: &AppId) -> Result<EnvironmentView> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;

        loop {
            match self.check_existing_lease(app_id).await {
                LeaseCheck::Ready(view) => {
                    if self.driver.health_check(&view.container).await {
                        return Ok(view);
                    }
                    warn!(app_id = %app_id, environment = %view.id,
                        "leased environment failed health check, destroying");
                    self.mark_unhealthy(view.id).await;
                    self.destroy(view.id).await?;
                    continue;
                }
                LeaseCheck::InFlight => {
                    if self.wait_for_release(deadline).await.is_err() {
                        return Err(self.capacity_exceeded(started));
                    }
                    continue;
                }
                LeaseCheck::None => {}
            }

            if let Some(view) = self.lease_idle(app_id).await {
                if self.driver.health_check(&view.container).await {
                    debug!(app_id = %app_id, environment = %view.id, "warm start");
                    return Ok(view);
                }
                warn!(environment = %view.id, "idle environment unhealthy, destroying");
                self.mark_unhealthy(view.id).await;
                self.destroy(view.id).await?;
                continue;
            }

            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => {
                    if let Some(view) = self.provision_for(app_id, permit).await? {
                        return Ok(view);
                    }
                    // Lost a lease race; the winner's environment will be
                    // picked up on the next pass.
                    continue;
                }
                Err(_) => {
                    if self.wait_for_release(deadline).await.is_err() {
                        // Final re-check before giving up: a release may
                        // have landed right at the deadline.
                        if let Some(view) = self.lease_idle(app_id).await {
                            return Ok(view);
                        }
                        return Err(self.capacity_exceeded(started));
                    }
                }
            }
        }
    }

    /// Return a leased environment to the pool.
    ///
    /// Healthy environments are stopped and recycled for reuse by any
    /// application; unhealthy ones are destroyed on the spot.
    pub async fn release(&self, environment_id: EnvironmentId) -> Result<()> {
        let (container, status) = {
            let state = self.state.lock().await;
            match state.environments.get(&environment_id) {
                None => return Ok(()),
                Some(record) => (record.container.clone(), record.status),
            }
        };

        match status {
            EnvironmentStatus::Idle => return Ok(()),
            EnvironmentStatus::Unhealthy => return self.destroy(environment_id).await,
            EnvironmentStatus::Leased | EnvironmentStatus::Provisioning => {}
            EnvironmentStatus::Destroyed => return Ok(()),
        }

        // Stop the app before the environment can be handed to another
        // application; stale processes must not serve cross-app traffic.
        self.driver.stop_app(&container).await?;

        if !self.driver.health_check(&container).await {
            warn!(environment = %environment_id, "unhealthy on release, destroying");
            return self.destroy(environment_id).await;
        }

        let mut state = self.state.lock().await;
        if let Some(record) = state.environments.get_mut(&environment_id) {
            let app_id = record.app_id.take();
            record.status = EnvironmentStatus::Idle;
            record.last_used_at = Utc::now();
            if let Some(app_id) = app_id {
                state.leases.remove(&app_id);
            }
            state.idle.push_back(environment_id);
            debug!(environment = %environment_id, "recycled to idle pool");
        }
        drop(state);
        self.released.notify_waiters();
        Ok(())
    }

    /// Tear an environment down. Idempotent.
    pub async fn destroy(&self, environment_id: EnvironmentId) -> Result<()> {
        let record = {
            let mut state = self.state.lock().await;
            let record = state.environments.remove(&environment_id);
            state.idle.retain(|id| *id != environment_id);
            if let Some(record) = &record {
                if let Some(app_id) = &record.app_id {
                    state.leases.remove(app_id);
                }
            }
            record
        };

        let Some(record) = record else {
            return Ok(());
        };

        if let Err(e) = self.driver.destroy(&record.container).await {
            warn!(environment = %environment_id, "container teardown failed: {}", e);
        }
        info!(environment = %environment_id, "environment destroyed");
        drop(record); // frees the capacity permit
        self.released.notify_waiters();
        Ok(())
    }

    /// Flag a leased environment as unhealthy; it will be destroyed rather
    /// than recycled.
    pub async fn mark_unhealthy(&self, environment_id: EnvironmentId) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.environments.get_mut(&environment_id) {
            if record.status.can_transition_to(EnvironmentStatus::Unhealthy) {
                record.status = EnvironmentStatus::Unhealthy;
            }
        }
    }

    /// Refresh an environment's activity timestamp.
    pub async fn touch(&self, environment_id: EnvironmentId) {
        let mut state = self.state.lock().await;
        if let Some(record) = state.environments.get_mut(&environment_id) {
            record.last_used_at = Utc::now();
        }
    }

    pub async fn get(&self, environment_id: EnvironmentId) -> Option<EnvironmentView> {
        let state = self.state.lock().await;
        state.environments.get(&environment_id).map(|r| r.view())
    }

    /// The environment currently leased to the application, if any.
    pub async fn lease_for(&self, app_id: &AppId) -> Option<EnvironmentView> {
        let state = self.state.lock().await;
        let id = state.leases.get(app_id)?;
        state.environments.get(id).map(|r| r.view())
    }

    /// Environments alive right now (provisioning + idle + leased).
    pub async fn live_count(&self) -> usize {
        self.state.lock().await.environments.len()
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    pub async fn snapshot(&self) -> Vec<EnvironmentView> {
        let state = self.state.lock().await;
        state.environments.values().map(|r| r.view()).collect()
    }

    /// Stop the reaper and destroy every environment. Called once at
    /// process shutdown.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }
        let ids: Vec<EnvironmentId> = {
            let state = self.state.lock().await;
            state.environments.keys().copied().collect()
        };
        for id in ids {
            if let Err(e) = self.destroy(id).await {
                warn!(environment = %id, "shutdown teardown failed: {}", e);
            }
        }
    }

    async fn check_existing_lease(&self, app_id: &AppId) -> LeaseCheck {
        let state = self.state.lock().await;
        let Some(id) = state.leases.get(app_id) else {
            return LeaseCheck::None;
        };
        match state.environments.get(id) {
            Some(record) if record.status == EnvironmentStatus::Leased => {
                LeaseCheck::Ready(record.view())
            }
            Some(record) if record.status == EnvironmentStatus::Provisioning => {
                LeaseCheck::InFlight
            }
            _ => LeaseCheck::None,
        }
    }

    async fn lease_idle(&self, app_id: &AppId) -> Option<EnvironmentView> {
        let mut state = self.state.lock().await;
        while let Some(id) = state.idle.pop_front() {
            if let Some(record) = state.environments.get_mut(&id) {
                if record.status != EnvironmentStatus::Idle {
                    continue;
                }
                record.status = EnvironmentStatus::Leased;
                record.app_id = Some(app_id.clone());
                record.last_used_at = Utc::now();
                let view = record.view();
                state.leases.insert(app_id.clone(), id);
                return Some(view);
            }
        }
        None
    }

    /// Cold path: reserve the lease slot, then provision with bounded
    /// exponential backoff. Returns `None` when another acquirer claimed
    /// the app's lease first.
    async fn provision_for(
        &self,
        app_id: &AppId,
        permit: OwnedSemaphorePermit,
    ) -> Result<Option<EnvironmentView>> {
        let environment_id = {
            let mut state = self.state.lock().await;
            if state.leases.contains_key(app_id) {
                drop(state);
                drop(permit);
                self.released.notify_waiters();
                return Ok(None);
            }
            let id = EnvironmentId::new();
            let now = Utc::now();
            state.environments.insert(
                id,
                EnvironmentRecord {
                    id,
                    app_id: Some(app_id.clone()),
                    status: EnvironmentStatus::Provisioning,
                    internal_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                    container: ContainerRef::new("pending"),
                    created_at: now,
                    last_used_at: now,
                    _permit: permit,
                },
            );
            state.leases.insert(app_id.clone(), id);
            id
        };

        let mut attempt = 0u32;
        let provisioned = loop {
            attempt += 1;
            match self.driver.provision(&self.config.limits).await {
                Ok(provisioned) => break provisioned,
                Err(e) if attempt < self.config.provision_attempts => {
                    let backoff = self.config.provision_backoff * 2u32.pow(attempt - 1);
                    warn!(
                        app_id = %app_id,
                        attempt,
                        "cold start failed, retrying in {:?}: {}",
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    state.environments.remove(&environment_id);
                    state.leases.remove(app_id);
                    drop(state);
                    self.released.notify_waiters();
                    return Err(SandboxError::Provision {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        };

        let mut state = self.state.lock().await;
        let Some(record) = state.environments.get_mut(&environment_id) else {
            // Destroyed while provisioning; release the fresh container.
            drop(state);
            let _ = self.driver.destroy(&provisioned.container).await;
            return Ok(None);
        };
        record.status = EnvironmentStatus::Leased;
        record.internal_addr = provisioned.internal_addr;
        record.container = provisioned.container;
        record.last_used_at = Utc::now();
        let view = record.view();
        drop(state);
        self.released.notify_waiters();
        info!(app_id = %app_id, environment = %view.id, "cold start complete");
        Ok(Some(view))
    }

    async fn wait_for_release(&self, deadline: Instant) -> std::result::Result<(), ()> {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(());
        };
        tokio::select! {
            _ = self.released.notified() => Ok(()),
            _ = tokio::time::sleep(remaining) => Err(()),
        }
    }

    fn capacity_exceeded(&self, started: Instant) -> SandboxError {
        SandboxError::CapacityExceeded {
            capacity: self.config.capacity,
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn spawn_reaper(pool: Weak<PoolManager>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval = match pool.upgrade() {
                    Some(pool) => pool.config.reap_interval,
                    None => return,
                };
                tokio::time::sleep(interval).await;

                let Some(pool) = pool.upgrade() else {
                    return;
                };
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(pool.config.idle_ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                let expired: Vec<EnvironmentId> = {
                    let state = pool.state.lock().await;
                    state
                        .environments
                        .values()
                        .filter(|r| {
                            r.status == EnvironmentStatus::Idle && r.last_used_at < cutoff
                        })
                        .map(|r| r.id)
                        .collect()
                };
                for id in expired {
                    info!(environment = %id, "reaping idle environment past TTL");
                    if let Err(e) = pool.destroy(id).await {
                        warn!(environment = %id, "reap failed: {}", e);
                    }
                }
            }
        })
    }
}
