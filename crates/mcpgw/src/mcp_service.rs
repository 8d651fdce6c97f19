use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::McpServerConfig;
use crate::error::{GatewayError, Result};
use crate::logging;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
        }
    }
}

struct ServiceState {
    status: ServiceStatus,
    port: u16,
    pid: Option<u32>,
    stop_signal: Option<CancellationToken>,
    retry_count: u32,
    sessions: HashMap<String, Arc<Session>>,
}

/// A single backend instance: either a remote HTTP+SSE endpoint adopted
/// as-is, or a subprocess supervised under the `supergateway` shim.
///
/// Remote and subprocess backends share this one type (tagged by
/// `config.is_remote()`) rather than two structs behind a trait object,
/// since the capability surface (URL accessors, `send_message`) is
/// identical and only the lifecycle fields differ.
pub struct McpService {
    pub name: String,
    pub config: McpServerConfig,
    port_allocator: Arc<crate::port::PortAllocator>,
    logs_dir: std::path::PathBuf,
    shim_command: String,
    retry_limit: u32,
    stability_window: Duration,
    http_client: reqwest::Client,
    state: RwLock<ServiceState>,
}

impl McpService {
    pub fn new(
        name: String,
        config: McpServerConfig,
        port_allocator: Arc<crate::port::PortAllocator>,
        logs_dir: std::path::PathBuf,
        shim_command: String,
        retry_limit: u32,
        stability_window: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let http_client = reqwest::Client::builder()
            .http1_only()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();

        Arc::new(Self {
            name,
            config,
            port_allocator,
            logs_dir,
            shim_command,
            retry_limit,
            stability_window,
            http_client,
            state: RwLock::new(ServiceState {
                status: ServiceStatus::Stopped,
                port: 0,
                pid: None,
                stop_signal: None,
                retry_count: 0,
                sessions: HashMap::new(),
            }),
        })
    }

    pub fn is_remote(&self) -> bool {
        self.config.is_remote()
    }

    pub async fn status(&self) -> ServiceStatus {
        if self.is_remote() {
            return ServiceStatus::Running;
        }
        self.state.read().await.status
    }

    pub async fn port(&self) -> u16 {
        self.state.read().await.port
    }

    /// `http://localhost:<port>` for a running subprocess, the configured
    /// remote URL for a remote service, or `""` if not running.
    pub async fn get_url(&self) -> String {
        if self.is_remote() {
            return self.config.url.clone().unwrap_or_default();
        }
        let state = self.state.read().await;
        if state.status != ServiceStatus::Running || state.port == 0 {
            return String::new();
        }
        format!("http://localhost:{}", state.port)
    }

    pub async fn get_sse_url(&self) -> String {
        let base = self.get_url().await;
        if base.is_empty() {
            return String::new();
        }
        format!("{base}/sse")
    }

    pub async fn get_message_url(&self) -> String {
        let base = self.get_url().await;
        if base.is_empty() {
            return String::new();
        }
        format!("{base}/message")
    }

    pub async fn send_message(&self, body: &str) -> Result<()> {
        let url = self.get_message_url().await;
        if url.is_empty() {
            return Err(GatewayError::NotRunning(self.name.clone()));
        }
        let response = self
            .http_client
            .post(&url)
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Other(anyhow::anyhow!(
                "service '{}' rejected message with status {}",
                self.name,
                response.status()
            )));
        }
        Ok(())
    }

    /// Start a subprocess backend. No-op error for remote backends and for
    /// already-running ones.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_remote() {
            return Err(GatewayError::InvalidConfig {
                name: self.name.clone(),
                reason: "remote services do not need starting".to_string(),
            });
        }

        let mut allocated_port = None;
        {
            let mut state = self.state.write().await;
            if state.status == ServiceStatus::Running {
                return Err(GatewayError::AlreadyRunning(self.name.clone()));
            }
            state.status = ServiceStatus::Starting;
            if state.port == 0 {
                let port = self.port_allocator.acquire();
                state.port = port;
                allocated_port = Some(port);
            }
        }

        let port = self.state.read().await.port;
        let stop_signal = CancellationToken::new();

        match self.launch_child(port, stop_signal.clone()).await {
            Ok(child) => {
                let mut state = self.state.write().await;
                state.status = ServiceStatus::Running;
                state.pid = child.id();
                state.stop_signal = Some(stop_signal.clone());
                state.retry_count = 0;
                drop(state);

                tokio::spawn(supervise(self.clone(), child, stop_signal.clone(), port));
                spawn_stability_reset(self.clone(), stop_signal, self.stability_window);
                Ok(())
            }
            Err(error) => {
                let mut state = self.state.write().await;
                state.status = ServiceStatus::Stopped;
                if let Some(port) = allocated_port.take() {
                    self.port_allocator.release(port);
                    state.port = 0;
                }
                Err(GatewayError::StartFailed {
                    name: self.name.clone(),
                    source: error,
                })
            }
        }
    }

    /// Stop a subprocess backend. No-op for remote or already-stopped
    /// backends; safe to call repeatedly.
    pub async fn stop(&self) {
        if self.is_remote() {
            return;
        }
        let mut state = self.state.write().await;
        if state.status != ServiceStatus::Running && state.status != ServiceStatus::Starting {
            return;
        }
        if let Some(pid) = state.pid.take() {
            kill_pid(pid);
        }
        if let Some(signal) = state.stop_signal.take() {
            signal.cancel();
        }
        if state.port != 0 {
            self.port_allocator.release(state.port);
            state.port = 0;
        }
        state.status = ServiceStatus::Stopped;
        state.retry_count = 0;
    }

    pub async fn restart(self: &Arc<Self>) {
        if self.is_remote() {
            return;
        }
        self.stop().await;
        if let Err(error) = self.start().await {
            tracing::warn!(service = %self.name, error = %error, "restart failed");
        }
    }

    /// Drop owned sessions that have gone quiet for 5x the GC interval.
    pub async fn gc(&self, gc_interval: Duration) {
        let threshold = gc_interval * 5;
        let mut state = self.state.write().await;
        let mut stale = Vec::new();
        for (id, session) in state.sessions.iter() {
            if session.idle_for() > threshold {
                stale.push(id.clone());
            }
        }
        for id in stale {
            if let Some(session) = state.sessions.remove(&id) {
                session.close().await;
            }
        }
    }

    pub async fn add_session(&self, session: Arc<Session>) {
        self.state
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session);
    }

    pub async fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.state.read().await.sessions.get(id).cloned()
    }

    pub async fn remove_session(&self, id: &str) {
        self.state.write().await.sessions.remove(id);
    }

    async fn launch_child(
        self: &Arc<Self>,
        port: u16,
        stop_signal: CancellationToken,
    ) -> std::result::Result<Child, anyhow::Error> {
        let log_file = logging::open_log_file(&self.logs_dir, &format!("{}.log", self.name))?;
        let log_file = Arc::new(StdMutex::new(log_file));

        let command = self
            .config
            .command
            .clone()
            .ok_or_else(|| anyhow::anyhow!("subprocess service missing command"))?;
        let inner = if self.config.args.is_empty() {
            command
        } else {
            format!("{} {}", command, self.config.args.join(" "))
        };
        let script = format!("{} --stdio \"{}\" --port {}", self.shim_command, inner, port);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&script);
        cmd.envs(&self.config.env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_output(
                self.clone(),
                stdout,
                log_file.clone(),
                stop_signal.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_output(
                self.clone(),
                stderr,
                log_file.clone(),
                stop_signal.clone(),
            ));
        }

        Ok(child)
    }
}

fn spawn_stability_reset(service: Arc<McpService>, stop_signal: CancellationToken, window: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = stop_signal.cancelled() => {}
            _ = tokio::time::sleep(window) => {
                let mut state = service.state.write().await;
                if state.status == ServiceStatus::Running {
                    state.retry_count = 0;
                }
            }
        }
    });
}

async fn capture_output<R>(
    service: Arc<McpService>,
    reader: R,
    log_file: Arc<StdMutex<std::fs::File>>,
    stop_signal: CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let next = tokio::select! {
            _ = stop_signal.cancelled() => break,
            line = lines.next_line() => line,
        };
        match next {
            Ok(Some(line)) => {
                if let Ok(mut file) = log_file.lock() {
                    use std::io::Write;
                    let _ = writeln!(file, "{line}");
                }
                if line.contains("exited") {
                    service.stop().await;
                    break;
                }
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

/// One subprocess's supervision loop: waits on the child, relaunching on
/// unexpected exit up to `retry_limit` times. Implemented as a loop (not
/// recursive `start()` calls) so retry depth doesn't grow the call stack.
async fn supervise(
    service: Arc<McpService>,
    mut child: Child,
    stop_signal: CancellationToken,
    port: u16,
) {
    loop {
        tokio::select! {
            _ = stop_signal.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return;
            }
            wait_result = child.wait() => {
                if stop_signal.is_cancelled() {
                    return;
                }
                tracing::warn!(
                    service = %service.name,
                    exit = ?wait_result,
                    "subprocess exited unexpectedly, considering restart"
                );

                let give_up = {
                    let mut state = service.state.write().await;
                    state.retry_count += 1;
                    let give_up = state.retry_count > service.retry_limit;
                    if give_up {
                        state.status = ServiceStatus::Stopped;
                        state.retry_count = 0;
                        state.pid = None;
                        state.stop_signal = None;
                        service.port_allocator.release(port);
                        state.port = 0;
                    }
                    give_up
                };

                if give_up {
                    tracing::error!(service = %service.name, "retry count exceeded, giving up");
                    return;
                }

                match service.launch_child(port, stop_signal.clone()).await {
                    Ok(new_child) => {
                        {
                            let mut state = service.state.write().await;
                            state.pid = new_child.id();
                            state.status = ServiceStatus::Running;
                        }
                        spawn_stability_reset(
                            service.clone(),
                            stop_signal.clone(),
                            service.stability_window,
                        );
                        child = new_child;
                    }
                    Err(error) => {
                        tracing::error!(service = %service.name, error = %error, "relaunch failed, giving up");
                        let mut state = service.state.write().await;
                        state.status = ServiceStatus::Stopped;
                        state.retry_count = 0;
                        state.pid = None;
                        state.stop_signal = None;
                        service.port_allocator.release(port);
                        state.port = 0;
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    // SAFETY: `kill` has no preconditions beyond a valid signal number; an
    // already-exited pid simply yields ESRCH, which we ignore.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortAllocator;
    use std::collections::HashMap as Map;

    fn remote_config() -> McpServerConfig {
        McpServerConfig {
            url: Some("http://example.invalid/".to_string()),
            command: None,
            args: vec![],
            env: Map::new(),
        }
    }

    fn make_service(config: McpServerConfig) -> Arc<McpService> {
        McpService::new(
            "svc".to_string(),
            config,
            Arc::new(PortAllocator::new(10000)),
            std::env::temp_dir(),
            "/usr/local/bin/supergateway".to_string(),
            1,
            Duration::from_secs(300),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn remote_service_is_always_running() {
        let service = make_service(remote_config());
        assert_eq!(service.status().await, ServiceStatus::Running);
        assert_eq!(service.get_url().await, "http://example.invalid/");
        assert_eq!(
            service.get_sse_url().await,
            "http://example.invalid//sse"
        );
    }

    #[tokio::test]
    async fn remote_service_start_errors() {
        let service = make_service(remote_config());
        assert!(service.start().await.is_err());
    }

    #[tokio::test]
    async fn remote_service_stop_is_noop() {
        let service = make_service(remote_config());
        service.stop().await;
        assert_eq!(service.status().await, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn subprocess_service_starts_stopped_with_no_url() {
        let config = McpServerConfig {
            url: None,
            command: Some("true".to_string()),
            args: vec![],
            env: Map::new(),
        };
        let service = make_service(config);
        assert_eq!(service.status().await, ServiceStatus::Stopped);
        assert_eq!(service.get_url().await, "");
        assert_eq!(service.get_sse_url().await, "");
    }

    #[tokio::test]
    async fn double_stop_on_never_started_subprocess_is_safe() {
        let config = McpServerConfig {
            url: None,
            command: Some("true".to_string()),
            args: vec![],
            env: Map::new(),
        };
        let service = make_service(config);
        service.stop().await;
        service.stop().await;
        assert_eq!(service.status().await, ServiceStatus::Stopped);
    }
}
