//! Server configuration: TOML file plus environment overrides.

use appforge_sandbox::{PoolConfig, ResourceLimits, RuntimeManagerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub pool: PoolSettings,
    pub runtime: RuntimeSettings,
    pub proxy: ProxySettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8720".to_string(),
            pool: PoolSettings::default(),
            runtime: RuntimeSettings::default(),
            proxy: ProxySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub capacity: usize,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    pub provision_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub provision_backoff: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            capacity: defaults.capacity,
            acquire_timeout: defaults.acquire_timeout,
            idle_ttl: defaults.idle_ttl,
            reap_interval: defaults.reap_interval,
            provision_attempts: defaults.provision_attempts,
            provision_backoff: defaults.provision_backoff,
        }
    }
}

impl PoolSettings {
    pub fn into_pool_config(self) -> PoolConfig {
        PoolConfig {
            capacity: self.capacity,
            acquire_timeout: self.acquire_timeout,
            idle_ttl: self.idle_ttl,
            reap_interval: self.reap_interval,
            provision_attempts: self.provision_attempts,
            provision_backoff: self.provision_backoff,
            limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub max_log_lines: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let defaults = RuntimeManagerConfig::default();
        Self {
            startup_timeout: defaults.startup_timeout,
            poll_interval: defaults.poll_interval,
            max_log_lines: defaults.max_log_lines,
        }
    }
}

impl RuntimeSettings {
    pub fn into_runtime_config(self) -> RuntimeManagerConfig {
        RuntimeManagerConfig {
            startup_timeout: self.startup_timeout,
            poll_interval: self.poll_interval,
            max_log_lines: self.max_log_lines,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file (or defaults), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };

        if let Ok(addr) = std::env::var("APPFORGE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(capacity) = std::env::var("APPFORGE_POOL_CAPACITY") {
            if let Ok(capacity) = capacity.parse() {
                config.pool.capacity = capacity;
            }
        }
        Ok(config)
    }
}
