use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::{save_configs, GatewayConfig, McpServerConfig};
use crate::error::{GatewayError, Result};
use crate::mcp_service::McpService;
use crate::port::PortAllocator;
use crate::session::Session;

/// Owns every backend and every open proxy session, and is the only thing
/// that touches the port allocator.
///
/// Lock order, enforced by construction (no function ever holds a lock from
/// a lower row while acquiring one from a higher row):
///   services  ->  proxy_sessions  ->  port allocator's own internal lock
///
/// Exception: `create_proxy_session` needs both maps at once, and per the
/// upstream contract takes them in the opposite order — proxy_sessions
/// (write) then services (read) — so the new session's backend set is fixed
/// under the proxy_sessions lock before the session becomes visible to GC or
/// a concurrent close.
pub struct ServiceManager {
    config: Arc<GatewayConfig>,
    port_allocator: Arc<PortAllocator>,
    http_client: reqwest::Client,
    services: RwLock<HashMap<String, Arc<McpService>>>,
    proxy_sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl ServiceManager {
    pub fn new(config: Arc<GatewayConfig>) -> Arc<Self> {
        let http_client = reqwest::Client::builder()
            .http1_only()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            port_allocator: Arc::new(PortAllocator::new(config.port_base)),
            http_client,
            config,
            services: RwLock::new(HashMap::new()),
            proxy_sessions: RwLock::new(HashMap::new()),
        })
    }

    fn build_service(&self, name: String, config: McpServerConfig) -> Arc<McpService> {
        McpService::new(
            name,
            config,
            self.port_allocator.clone(),
            self.config.logs_dir(),
            self.config.shim_command.clone(),
            self.config.default_retry_count,
            self.config.session_gc_interval,
            self.config.request_timeout,
        )
    }

    /// Deploy one or more named backends: restart in place if a name already
    /// exists, otherwise create, validate, start (subprocess backends only)
    /// and register it. The whole batch is persisted to disk only once every
    /// entry has been accepted; the first invalid entry aborts the rest,
    /// leaving previously-applied entries in this call running (matches the
    /// upstream proxy's deploy handler, which does not roll back partial
    /// progress on a later failure).
    pub async fn deploy(&self, requests: HashMap<String, McpServerConfig>) -> Result<()> {
        for (name, config) in requests {
            config.validate(&name)?;

            let existing = {
                let services = self.services.read().await;
                services.get(&name).cloned()
            };

            if let Some(service) = existing {
                service.restart().await;
                let mut services = self.services.write().await;
                services.insert(name, service);
                continue;
            }

            let service = self.build_service(name.clone(), config);
            if !service.is_remote() {
                service.start().await?;
            }

            let mut services = self.services.write().await;
            services.insert(name, service);
        }

        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        let services = self.services.read().await;
        let configs: HashMap<String, McpServerConfig> = services
            .iter()
            .map(|(name, service)| (name.clone(), service.config.clone()))
            .collect();
        drop(services);
        save_configs(&self.config.mcp_config_path(), &configs).await
    }

    /// Load `mcp_servers.json` (if present) and deploy every entry found.
    /// Failures are logged per-entry and do not abort the replay: a crash
    /// loop in one stale backend shouldn't prevent the rest from coming up.
    pub async fn replay_persisted(&self) -> Result<()> {
        let configs = crate::config::load_configs(&self.config.mcp_config_path()).await?;
        let Some(configs) = configs else {
            return Ok(());
        };
        for (name, config) in configs {
            if let Err(error) = config.validate(&name) {
                tracing::warn!(service = %name, error = %error, "skipping invalid persisted config");
                continue;
            }
            let service = self.build_service(name.clone(), config);
            if !service.is_remote() {
                if let Err(error) = service.start().await {
                    tracing::warn!(service = %name, error = %error, "failed to restart persisted service");
                    continue;
                }
            }
            self.services.write().await.insert(name, service);
        }
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let service = self.get(name).await?;
        service.stop().await;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Arc<McpService>> {
        self.services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::ServiceNotFound(name.to_string()))
    }

    pub async fn all_services(&self) -> Vec<Arc<McpService>> {
        self.services.read().await.values().cloned().collect()
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.services.read().await.keys().cloned().collect()
    }

    /// Open a new global session and subscribe it to a snapshot of every
    /// backend registered *right now*. A backend deployed after this point
    /// is not retroactively added to already-open sessions, matching the
    /// upstream proxy's session-creation semantics.
    pub async fn create_proxy_session(self: &Arc<Self>) -> (Arc<Session>, tokio::sync::mpsc::Receiver<String>) {
        let (session, rx) = Session::new(self.http_client.clone());

        let mut sessions = self.proxy_sessions.write().await;
        let backends: Vec<Arc<McpService>> = {
            let services = self.services.read().await;
            services.values().cloned().collect()
        };
        for service in backends {
            let sse_url = service.get_sse_url().await;
            if sse_url.is_empty() {
                continue;
            }
            session.subscribe(service.name.clone(), sse_url);
        }
        sessions.insert(session.id.clone(), session.clone());

        (session, rx)
    }

    pub async fn get_proxy_session(&self, id: &str) -> Result<Arc<Session>> {
        self.proxy_sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))
    }

    pub async fn close_proxy_session(&self, id: &str) {
        let session = self.proxy_sessions.write().await.remove(id);
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Broadcast one client message to every backend registered at session
    /// creation time. Per backend send failures are logged, not fatal,
    /// mirroring the upstream proxy's best-effort fan-out.
    pub async fn broadcast(&self, session: &Arc<Session>, body: &str) -> Result<()> {
        let services = self.all_services().await;
        for service in services {
            session.record_sent(&service.name, body);
            if let Err(error) = service.send_message(body).await {
                tracing::debug!(service = %service.name, error = %error, "broadcast send failed");
            }
        }
        Ok(())
    }

    /// Periodic sweep: GC stale sessions owned by each backend and stale
    /// global proxy sessions, at the configured interval.
    pub async fn run_gc_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.session_gc_interval);
        loop {
            ticker.tick().await;
            self.gc_once().await;
        }
    }

    async fn gc_once(&self) {
        let interval = self.config.session_gc_interval;
        for service in self.all_services().await {
            service.gc(interval).await;
        }

        let threshold = interval * 5;
        let stale: Vec<String> = {
            let sessions = self.proxy_sessions.read().await;
            let mut stale = Vec::new();
            for (id, session) in sessions.iter() {
                if session.idle_for() > threshold {
                    stale.push(id.clone());
                }
            }
            stale
        };
        for id in stale {
            self.close_proxy_session(&id).await;
        }
    }

    /// Stop every subprocess-backed service and close every open session;
    /// called during graceful shutdown.
    pub async fn shutdown(&self) {
        let session_ids: Vec<String> = self.proxy_sessions.read().await.keys().cloned().collect();
        for id in session_ids {
            self.close_proxy_session(&id).await;
        }
        for service in self.all_services().await {
            service.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn test_config() -> Arc<GatewayConfig> {
        Arc::new(GatewayConfig {
            config_dir: std::env::temp_dir().join(format!("mcpgw-test-{}", uuid::Uuid::new_v4())),
            http_bind: "127.0.0.1".into(),
            http_port: 0,
            session_gc_interval: Duration::from_secs(300),
            default_retry_count: 1,
            shim_command: "/usr/local/bin/supergateway".into(),
            request_timeout: Duration::from_secs(5),
            port_base: 19000,
        })
    }

    #[tokio::test]
    async fn deploy_remote_service_then_list() {
        let manager = ServiceManager::new(test_config());
        let mut requests = Map::new();
        requests.insert(
            "svc".to_string(),
            McpServerConfig {
                url: Some("http://example.invalid/".into()),
                command: None,
                args: vec![],
                env: Map::new(),
            },
        );
        manager.deploy(requests).await.unwrap();
        assert_eq!(manager.service_names().await, vec!["svc".to_string()]);
    }

    #[tokio::test]
    async fn deploy_rejects_invalid_config() {
        let manager = ServiceManager::new(test_config());
        let mut requests = Map::new();
        requests.insert(
            "bad".to_string(),
            McpServerConfig {
                url: None,
                command: None,
                args: vec![],
                env: Map::new(),
            },
        );
        assert!(manager.deploy(requests).await.is_err());
        assert!(manager.service_names().await.is_empty());
    }

    #[tokio::test]
    async fn get_missing_service_errors() {
        let manager = ServiceManager::new(test_config());
        assert!(manager.get("nope").await.is_err());
    }

    #[tokio::test]
    async fn proxy_session_lifecycle() {
        let manager = ServiceManager::new(test_config());
        let (session, _rx) = manager.create_proxy_session().await;
        let id = session.id.clone();
        assert!(manager.get_proxy_session(&id).await.is_ok());
        manager.close_proxy_session(&id).await;
        assert!(manager.get_proxy_session(&id).await.is_err());
    }
}
