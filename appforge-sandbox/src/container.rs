//! Container driver abstraction over the isolation primitive.
//!
//! The pool and runtime managers never touch containers directly; they go
//! through [`ContainerDriver`]. Production deployments back this with a
//! container or micro-VM runtime. [`LocalProcessDriver`] runs each
//! application as a supervised local process with a private working
//! directory and loopback port, which is what development and the test
//! suite use.

use crate::error::{Result, SandboxError};
use crate::limits::ResourceLimits;
use appforge_common::{ContainerRef, Stats};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Result of provisioning a fresh container.
#[derive(Debug, Clone)]
pub struct ProvisionedContainer {
    pub container: ContainerRef,
    /// Address the application inside will listen on.
    pub internal_addr: SocketAddr,
}

/// Captured output of a build/install step.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub logs: Vec<String>,
}

impl CommandOutput {
    pub fn empty_success() -> Self {
        Self {
            success: true,
            logs: Vec::new(),
        }
    }
}

/// Operations the pool and runtime managers need from the isolation layer.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Create a fresh container and reserve its internal address.
    async fn provision(&self, limits: &ResourceLimits) -> Result<ProvisionedContainer>;

    /// Write files into the container's application workspace.
    async fn write_files(&self, container: &ContainerRef, files: &[(String, String)])
        -> Result<()>;

    /// Run the install/build step, capturing its output.
    async fn run_install(&self, container: &ContainerRef) -> Result<CommandOutput>;

    /// Launch the application process. Does not wait for the port to open.
    async fn spawn_app(&self, container: &ContainerRef, entry: &str) -> Result<()>;

    /// Stop the application process, leaving the container reusable.
    async fn stop_app(&self, container: &ContainerRef) -> Result<()>;

    /// Best-effort runtime statistics.
    async fn stats(&self, container: &ContainerRef) -> Result<Stats>;

    /// Whether the container (and its app process, if any) is sound.
    async fn health_check(&self, container: &ContainerRef) -> bool;

    /// Tear the container down and release its resources.
    async fn destroy(&self, container: &ContainerRef) -> Result<()>;
}

struct LocalContainer {
    workdir: PathBuf,
    addr: SocketAddr,
    limits: ResourceLimits,
    child: Option<Child>,
    started_at: Option<Instant>,
}

/// Process-backed driver: one working directory and one supervised child
/// process per container, listening on a reserved loopback port.
pub struct LocalProcessDriver {
    root: PathBuf,
    node_binary: String,
    install_command: Option<String>,
    containers: Mutex<HashMap<ContainerRef, LocalContainer>>,
}

impl LocalProcessDriver {
    pub fn new() -> Self {
        Self::with_root(std::env::temp_dir().join("appforge-envs"))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            node_binary: "node".to_string(),
            install_command: None,
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Override the interpreter binary (tests point this at stubs).
    pub fn with_node_binary(mut self, binary: impl Into<String>) -> Self {
        self.node_binary = binary.into();
        self
    }

    /// Shell command to run as the install/build step inside the workdir.
    pub fn with_install_command(mut self, command: impl Into<String>) -> Self {
        self.install_command = Some(command.into());
        self
    }

    async fn reserve_loopback_port() -> Result<SocketAddr> {
        // Bind-then-drop reserves a free port; the app process rebinds it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        Ok(listener.local_addr()?)
    }
}

impl Default for LocalProcessDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerDriver for LocalProcessDriver {
    fn name(&self) -> &str {
        "local-process"
    }

    async fn provision(&self, limits: &ResourceLimits) -> Result<ProvisionedContainer> {
        let id = ContainerRef::new(uuid::Uuid::new_v4().to_string());
        let workdir = self.root.join(&id.0);
        tokio::fs::create_dir_all(&workdir).await?;
        let addr = Self::reserve_loopback_port().await?;

        self.containers.lock().await.insert(
            id.clone(),
            LocalContainer {
                workdir,
                addr,
                limits: limits.clone(),
                child: None,
                started_at: None,
            },
        );

        debug!(container = %id, %addr, "provisioned local container");
        Ok(ProvisionedContainer {
            container: id,
            internal_addr: addr,
        })
    }

    async fn write_files(
        &self,
        container: &ContainerRef,
        files: &[(String, String)],
    ) -> Result<()> {
        let workdir = {
            let containers = self.containers.lock().await;
            let entry = containers
                .get(container)
                .ok_or_else(|| SandboxError::Driver(format!("unknown container {}", container)))?;
            entry.workdir.clone()
        };

        for (path, content) in files {
            let relative = sanitize_relative(path)?;
            let target = workdir.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
        }
        Ok(())
    }

    async fn run_install(&self, container: &ContainerRef) -> Result<CommandOutput> {
        let Some(command) = self.install_command.clone() else {
            return Ok(CommandOutput::empty_success());
        };

        let (workdir, timeout) = {
            let containers = self.containers.lock().await;
            let entry = containers
                .get(container)
                .ok_or_else(|| SandboxError::Driver(format!("unknown container {}", container)))?;
            (entry.workdir.clone(), entry.limits.build_timeout)
        };

        let output_future = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&workdir)
            .output();

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, output_future)
                .await
                .map_err(|_| {
                    SandboxError::Driver(format!(
                        "install step exceeded {}s in container {}",
                        limit.as_secs(),
                        container
                    ))
                })??,
            None => output_future.await?,
        };

        let mut logs: Vec<String> = Vec::new();
        logs.extend(String::from_utf8_lossy(&output.stdout).lines().map(String::from));
        logs.extend(String::from_utf8_lossy(&output.stderr).lines().map(String::from));
        Ok(CommandOutput {
            success: output.status.success(),
            logs,
        })
    }

    async fn spawn_app(&self, container: &ContainerRef, entry: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;
        let state = containers
            .get_mut(container)
            .ok_or_else(|| SandboxError::Driver(format!("unknown container {}", container)))?;

        // A stale process from a previous start is replaced, not joined.
        if let Some(mut old) = state.child.take() {
            let _ = old.kill().await;
        }

        let mut command = Command::new(&self.node_binary);
        command
            .arg(entry)
            .current_dir(&state.workdir)
            .env("HOST", state.addr.ip().to_string())
            .env("PORT", state.addr.port().to_string())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null());
        if let Some(max_memory) = state.limits.max_memory_bytes {
            command.env(
                "NODE_OPTIONS",
                format!("--max-old-space-size={}", max_memory / (1024 * 1024)),
            );
        }

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::Driver(format!("failed to spawn app process: {}", e)))?;

        if let Some(stdout) = child.stdout.take() {
            let tag = container.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    debug!(container = %tag, "app stdout: {}", line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tag = container.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    debug!(container = %tag, "app stderr: {}", line);
                }
            });
        }

        state.child = Some(child);
        state.started_at = Some(Instant::now());
        Ok(())
    }

    async fn stop_app(&self, container: &ContainerRef) -> Result<()> {
        let mut containers = self.containers.lock().await;
        if let Some(state) = containers.get_mut(container) {
            if let Some(mut child) = state.child.take() {
                if let Err(e) = child.kill().await {
                    warn!(container = %container, "failed to kill app process: {}", e);
                }
            }
            state.started_at = None;
        }
        Ok(())
    }

    async fn stats(&self, container: &ContainerRef) -> Result<Stats> {
        let containers = self.containers.lock().await;
        let state = containers
            .get(container)
            .ok_or_else(|| SandboxError::Driver(format!("unknown container {}", container)))?;

        let mut stats = Stats::unknown();
        if let Some(started_at) = state.started_at {
            stats.uptime_secs = Some(started_at.elapsed().as_secs());
        }
        #[cfg(target_os = "linux")]
        if let Some(child) = &state.child {
            if let Some(pid) = child.id() {
                stats.memory_bytes = read_resident_bytes(pid);
            }
        }
        Ok(stats)
    }

    async fn health_check(&self, container: &ContainerRef) -> bool {
        let mut containers = self.containers.lock().await;
        let Some(state) = containers.get_mut(container) else {
            return false;
        };
        match state.child.as_mut() {
            // No app process: an idle container is healthy.
            None => true,
            Some(child) => matches!(child.try_wait(), Ok(None)),
        }
    }

    async fn destroy(&self, container: &ContainerRef) -> Result<()> {
        let state = self.containers.lock().await.remove(container);
        if let Some(mut state) = state {
            if let Some(mut child) = state.child.take() {
                let _ = child.kill().await;
            }
            if let Err(e) = tokio::fs::remove_dir_all(&state.workdir).await {
                warn!(container = %container, "failed to remove workdir: {}", e);
            }
        }
        debug!(container = %container, "destroyed local container");
        Ok(())
    }
}

/// Resident set size for a process, via procfs.
#[cfg(target_os = "linux")]
fn read_resident_bytes(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

/// Reject absolute paths and parent traversal in submitted file paths.
fn sanitize_relative(path: &str) -> Result<&Path> {
    let candidate = Path::new(path);
    let safe = candidate.components().all(|c| {
        matches!(c, Component::Normal(_) | Component::CurDir)
    });
    if !safe || candidate.is_absolute() {
        return Err(SandboxError::Driver(format!(
            "unsafe file path in artifact: {}",
            path
        )));
    }
    Ok(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn driver() -> LocalProcessDriver {
        LocalProcessDriver::with_root(tempfile::tempdir().unwrap().into_path())
    }

    #[tokio::test]
    async fn test_provision_allocates_distinct_addresses() {
        let driver = driver();
        let first = driver.provision(&ResourceLimits::default()).await.unwrap();
        let second = driver.provision(&ResourceLimits::default()).await.unwrap();
        assert_ne!(first.container, second.container);
        assert_ne!(first.internal_addr, second.internal_addr);
    }

    #[tokio::test]
    async fn test_write_files_lands_in_workdir() {
        let driver = driver();
        let provisioned = driver.provision(&ResourceLimits::default()).await.unwrap();
        driver
            .write_files(
                &provisioned.container,
                &[
                    ("index.mjs".to_string(), "export default 1".to_string()),
                    ("lib/util.mjs".to_string(), "export const x = 2".to_string()),
                ],
            )
            .await
            .unwrap();

        let stats = driver.stats(&provisioned.container).await.unwrap();
        assert!(stats.uptime_secs.is_none());
        assert!(driver.health_check(&provisioned.container).await);
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected() {
        let driver = driver();
        let provisioned = driver.provision(&ResourceLimits::default()).await.unwrap();
        let err = driver
            .write_files(
                &provisioned.container,
                &[("../escape.txt".to_string(), "x".to_string())],
            )
            .await
            .unwrap_err();
        assert_matches!(err, SandboxError::Driver(ref message) if message.contains("unsafe"));
    }

    #[tokio::test]
    async fn test_destroy_forgets_container() {
        let driver = driver();
        let provisioned = driver.provision(&ResourceLimits::default()).await.unwrap();
        driver.destroy(&provisioned.container).await.unwrap();
        assert!(!driver.health_check(&provisioned.container).await);
        // Idempotent
        driver.destroy(&provisioned.container).await.unwrap();
    }

    #[tokio::test]
    async fn test_install_without_command_succeeds() {
        let driver = driver();
        let provisioned = driver.provision(&ResourceLimits::default()).await.unwrap();
        let output = driver.run_install(&provisioned.container).await.unwrap();
        assert!(output.success);
        assert!(output.logs.is_empty());
    }

    #[tokio::test]
    async fn test_install_command_captures_output() {
        let driver = driver().with_install_command("echo building && false");
        let provisioned = driver.provision(&ResourceLimits::default()).await.unwrap();
        let output = driver.run_install(&provisioned.container).await.unwrap();
        assert!(!output.success);
        assert!(output.logs.iter().any(|l| l.contains("building")));
    }
}
