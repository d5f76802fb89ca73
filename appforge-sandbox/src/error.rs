//! Error taxonomy for the sandbox subsystem.

use crate::validator::SecurityFinding;
use appforge_common::{AppId, EnvironmentId};

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Sandbox-specific errors
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Blocking security finding; the caller must regenerate the source
    #[error("security validation rejected the source ({} blocking finding(s))", blocking_count(.0))]
    SecurityViolation(Vec<SecurityFinding>),

    /// Malformed source; the caller must regenerate the source
    #[error("transpile failed in {file}: {message}")]
    Transpile { file: String, message: String },

    /// Cold-start failure after internal retries were exhausted
    #[error("environment provisioning failed after {attempts} attempt(s): {message}")]
    Provision { attempts: u32, message: String },

    /// Pool is at capacity and no environment freed up within the wait budget
    #[error("pool at capacity ({capacity}) after waiting {waited_ms}ms")]
    CapacityExceeded { capacity: usize, waited_ms: u64 },

    /// Build/install step failed inside the environment
    #[error("deploy to environment {environment_id} failed: {message}")]
    Deploy {
        environment_id: EnvironmentId,
        message: String,
        logs: Vec<String>,
    },

    /// Application process never bound its port
    #[error("app in environment {environment_id} did not accept connections within {timeout_ms}ms")]
    StartupTimeout {
        environment_id: EnvironmentId,
        timeout_ms: u64,
    },

    /// No running environment for the application
    #[error("app '{app_id}' has no running environment")]
    AppNotRunning { app_id: AppId },

    /// Running environment exists but could not be reached
    #[error("upstream environment for app '{app_id}' unreachable: {message}")]
    UpstreamUnavailable { app_id: AppId, message: String },

    /// Environment id is unknown (already destroyed or never existed)
    #[error("environment {0} not found")]
    EnvironmentNotFound(EnvironmentId),

    /// Container driver failure
    #[error("container driver error: {0}")]
    Driver(String),
}

fn blocking_count(findings: &[SecurityFinding]) -> usize {
    findings.iter().filter(|f| f.blocks()).count()
}

impl SandboxError {
    /// Whether the caller may retry the same request unchanged.
    ///
    /// Validation and transpile failures require regenerated source and are
    /// never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::CapacityExceeded { .. }
                | SandboxError::Deploy { .. }
                | SandboxError::StartupTimeout { .. }
                | SandboxError::UpstreamUnavailable { .. }
                | SandboxError::Driver(_)
        )
    }

    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            SandboxError::SecurityViolation(_) => 422,
            SandboxError::Transpile { .. } => 422,
            SandboxError::Provision { .. } => 500,
            SandboxError::CapacityExceeded { .. } => 503,
            SandboxError::Deploy { .. } => 500,
            SandboxError::StartupTimeout { .. } => 504,
            SandboxError::AppNotRunning { .. } => 503,
            SandboxError::UpstreamUnavailable { .. } => 502,
            SandboxError::EnvironmentNotFound(_) => 404,
            SandboxError::Driver(_) => 500,
        }
    }

    /// Captured logs, when the failure carries diagnostics worth surfacing.
    pub fn logs(&self) -> &[String] {
        match self {
            SandboxError::Deploy { logs, .. } => logs,
            _ => &[],
        }
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        SandboxError::Driver(err.to_string())
    }
}
