//! Core identifiers and the environment data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Application identifier, assigned by the caller's persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppId(pub String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AppId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier for an execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentId(pub uuid::Uuid);

impl EnvironmentId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to the underlying isolation primitive (container / micro-VM).
///
/// Only the container driver interprets the contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerRef(pub String);

impl ContainerRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Environment lifecycle status.
///
/// Transitions: `Provisioning → Idle ⇄ Leased → {Idle | Unhealthy} → Destroyed`.
/// `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Provisioning,
    Idle,
    Leased,
    Unhealthy,
    Destroyed,
}

impl EnvironmentStatus {
    /// Whether this status counts against pool capacity.
    pub fn is_live(self) -> bool {
        !matches!(self, EnvironmentStatus::Destroyed)
    }

    /// Valid state-machine transitions.
    pub fn can_transition_to(self, next: EnvironmentStatus) -> bool {
        use EnvironmentStatus::*;
        matches!(
            (self, next),
            (Provisioning, Idle)
                | (Provisioning, Leased)
                | (Provisioning, Destroyed)
                | (Idle, Leased)
                | (Idle, Destroyed)
                | (Leased, Idle)
                | (Leased, Unhealthy)
                | (Leased, Destroyed)
                | (Unhealthy, Destroyed)
        )
    }
}

impl std::fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EnvironmentStatus::Provisioning => "provisioning",
            EnvironmentStatus::Idle => "idle",
            EnvironmentStatus::Leased => "leased",
            EnvironmentStatus::Unhealthy => "unhealthy",
            EnvironmentStatus::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// Snapshot of an environment, safe to hand across API boundaries.
///
/// The live pool record never leaves the pool manager; callers only ever
/// see these copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentView {
    pub id: EnvironmentId,
    pub app_id: Option<AppId>,
    pub status: EnvironmentStatus,
    pub internal_addr: SocketAddr,
    pub container: ContainerRef,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// Best-effort runtime statistics for a running environment.
///
/// Missing values mean "unknown", never an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
    pub uptime_secs: Option<u64>,
}

impl Stats {
    pub fn unknown() -> Self {
        Self::default()
    }
}

/// Transient result of a deploy attempt. Not persisted anywhere; carried
/// back to the caller for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub environment_id: EnvironmentId,
    pub success: bool,
    pub logs: Vec<String>,
    pub error: Option<String>,
}

impl DeploymentRecord {
    pub fn succeeded(environment_id: EnvironmentId, logs: Vec<String>) -> Self {
        Self {
            environment_id,
            success: true,
            logs,
            error: None,
        }
    }

    pub fn failed(
        environment_id: EnvironmentId,
        logs: Vec<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            environment_id,
            success: false,
            logs,
            error: Some(error.into()),
        }
    }
}

/// Application lifecycle status surfaced to the caller's persistence layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppLifecycleStatus {
    Draft,
    Active,
}
