//! Resource limits applied to execution environments at provision time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits for one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory for the application process
    pub max_memory_bytes: Option<u64>,

    /// CPU ceiling as a percentage of one core
    pub max_cpu_percent: Option<u8>,

    /// Maximum writable disk space inside the environment
    pub max_disk_bytes: Option<u64>,

    /// How long the install/build step may run before it is killed
    pub build_timeout: Option<Duration>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: Some(256 * 1024 * 1024), // 256 MB
            max_cpu_percent: Some(100),
            max_disk_bytes: Some(512 * 1024 * 1024), // 512 MB
            build_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl ResourceLimits {
    /// Unlimited configuration, for trusted local development only.
    pub fn unlimited() -> Self {
        Self {
            max_memory_bytes: None,
            max_cpu_percent: None,
            max_disk_bytes: None,
            build_timeout: None,
        }
    }

    /// Tight limits for fully untrusted generations.
    pub fn strict() -> Self {
        Self {
            max_memory_bytes: Some(128 * 1024 * 1024), // 128 MB
            max_cpu_percent: Some(50),
            max_disk_bytes: Some(128 * 1024 * 1024), // 128 MB
            build_timeout: Some(Duration::from_secs(60)),
        }
    }
}
