//! Container driver stubs used by the test suites.
//!
//! `HttpStubDriver` answers app traffic with a tiny hand-rolled HTTP
//! responder so tests control exactly when the app port opens and closes.
//! `MockBackedDriver` fronts each environment with a wiremock server so
//! tests can assert what the proxy actually sent upstream.

use appforge_common::{ContainerRef, Stats};
use appforge_sandbox::{
    CommandOutput, ContainerDriver, ProvisionedContainer, ResourceLimits, Result, SandboxError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Stub driver whose "app process" is a minimal HTTP/1.1 responder.
///
/// The responder omits `content-type` so content-type inference in the
/// proxy is observable, and sends a `proxy-connection` header so
/// hop-by-hop stripping is observable.
pub struct HttpStubDriver {
    ports: Mutex<HashMap<ContainerRef, SocketAddr>>,
    servers: Mutex<HashMap<ContainerRef, JoinHandle<()>>>,
    pub write_calls: AtomicU32,
    pub install_calls: AtomicU32,
    pub install_ok: AtomicBool,
    pub open_port_on_spawn: AtomicBool,
}

impl HttpStubDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            write_calls: AtomicU32::new(0),
            install_calls: AtomicU32::new(0),
            install_ok: AtomicBool::new(true),
            open_port_on_spawn: AtomicBool::new(true),
        })
    }

    /// Close every stub app listener, leaving environments "running" but
    /// unreachable.
    pub async fn kill_all_apps(&self) {
        let mut servers = self.servers.lock().await;
        for (_, handle) in servers.drain() {
            handle.abort();
        }
    }

    async fn serve(listener: TcpListener) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read_total = 0usize;
                loop {
                    match stream.read(&mut buf[read_total..]).await {
                        Ok(0) => break,
                        Ok(n) => {
                            read_total += n;
                            if buf[..read_total].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                            if read_total == buf.len() {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let head = String::from_utf8_lossy(&buf[..read_total]);
                let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                let body = format!("stub app response for {}", path);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nx-upstream: stub\r\nproxy-connection: keep-alive\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    }
}

#[async_trait]
impl ContainerDriver for HttpStubDriver {
    fn name(&self) -> &str {
        "http-stub"
    }

    async fn provision(&self, _limits: &ResourceLimits) -> Result<ProvisionedContainer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener); // reserved; reopened when the app "starts"
        let container = ContainerRef::new(uuid::Uuid::new_v4().to_string());
        self.ports.lock().await.insert(container.clone(), addr);
        Ok(ProvisionedContainer {
            container,
            internal_addr: addr,
        })
    }

    async fn write_files(
        &self,
        _container: &ContainerRef,
        _files: &[(String, String)],
    ) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_install(&self, _container: &ContainerRef) -> Result<CommandOutput> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        if self.install_ok.load(Ordering::SeqCst) {
            Ok(CommandOutput {
                success: true,
                logs: vec!["resolved 0 packages".to_string()],
            })
        } else {
            Ok(CommandOutput {
                success: false,
                logs: vec!["error: build exploded".to_string()],
            })
        }
    }

    async fn spawn_app(&self, container: &ContainerRef, _entry: &str) -> Result<()> {
        // Replace a previous app instance; wait for its listener to close
        // so rebinding the reserved port cannot race.
        if let Some(handle) = self.servers.lock().await.remove(container) {
            handle.abort();
            let _ = handle.await;
        }
        if !self.open_port_on_spawn.load(Ordering::SeqCst) {
            return Ok(());
        }
        let addr = self
            .ports
            .lock()
            .await
            .get(container)
            .copied()
            .ok_or_else(|| SandboxError::Driver("unknown container".into()))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SandboxError::Driver(e.to_string()))?;
        let handle = tokio::spawn(Self::serve(listener));
        self.servers.lock().await.insert(container.clone(), handle);
        Ok(())
    }

    async fn stop_app(&self, container: &ContainerRef) -> Result<()> {
        if let Some(handle) = self.servers.lock().await.remove(container) {
            handle.abort();
        }
        Ok(())
    }

    async fn stats(&self, _container: &ContainerRef) -> Result<Stats> {
        Ok(Stats {
            cpu_percent: Some(0.5),
            memory_bytes: Some(16 * 1024 * 1024),
            uptime_secs: Some(1),
        })
    }

    async fn health_check(&self, container: &ContainerRef) -> bool {
        self.ports.lock().await.contains_key(container)
    }

    async fn destroy(&self, container: &ContainerRef) -> Result<()> {
        if let Some(handle) = self.servers.lock().await.remove(container) {
            handle.abort();
        }
        self.ports.lock().await.remove(container);
        Ok(())
    }
}

/// Driver whose environments are wiremock servers, for asserting exactly
/// what the proxy forwarded.
pub struct MockBackedDriver {
    servers: Mutex<HashMap<ContainerRef, MockServer>>,
}

impl MockBackedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Requests the environment's mock server has received so far.
    pub async fn received_requests(&self, container: &ContainerRef) -> Vec<wiremock::Request> {
        let servers = self.servers.lock().await;
        match servers.get(container) {
            Some(server) => server.received_requests().await.unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Shut the environment's upstream down, making it unreachable.
    pub async fn kill(&self, container: &ContainerRef) {
        self.servers.lock().await.remove(container);
    }
}

#[async_trait]
impl ContainerDriver for MockBackedDriver {
    fn name(&self) -> &str {
        "wiremock"
    }

    async fn provision(&self, _limits: &ResourceLimits) -> Result<ProvisionedContainer> {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-upstream", "wiremock")
                    .set_body_string("mock upstream response"),
            )
            .mount(&server)
            .await;

        let addr = *server.address();
        let container = ContainerRef::new(uuid::Uuid::new_v4().to_string());
        self.servers.lock().await.insert(container.clone(), server);
        Ok(ProvisionedContainer {
            container,
            internal_addr: addr,
        })
    }

    async fn write_files(
        &self,
        _container: &ContainerRef,
        _files: &[(String, String)],
    ) -> Result<()> {
        Ok(())
    }

    async fn run_install(&self, _container: &ContainerRef) -> Result<CommandOutput> {
        Ok(CommandOutput::empty_success())
    }

    async fn spawn_app(&self, _container: &ContainerRef, _entry: &str) -> Result<()> {
        // The mock server listens from provision time onward.
        Ok(())
    }

    async fn stop_app(&self, _container: &ContainerRef) -> Result<()> {
        Ok(())
    }

    async fn stats(&self, _container: &ContainerRef) -> Result<Stats> {
        Ok(Stats::unknown())
    }

    async fn health_check(&self, container: &ContainerRef) -> bool {
        self.servers.lock().await.contains_key(container)
    }

    async fn destroy(&self, container: &ContainerRef) -> Result<()> {
        self.servers.lock().await.remove(container);
        Ok(())
    }
}
