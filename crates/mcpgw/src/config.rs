use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

const MCP_CONFIG_FILE: &str = "mcp_servers.json";
const DEFAULT_HTTP_BIND: &str = "0.0.0.0";
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_SESSION_GC_INTERVAL_SECS: u64 = 5 * 60;
const DEFAULT_SERVICE_RETRY_COUNT: u32 = 1;
const DEFAULT_SHIM_COMMAND: &str = "/usr/local/bin/supergateway";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PORT_BASE: u16 = 10000;

/// Declarative config for a single MCP backend.
///
/// Exactly one of `url` / `command` must be populated: `url` makes the backend
/// *remote* (the gateway never spawns anything for it), `command` makes it a
/// *subprocess* backend supervised under the shim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl McpServerConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        match (&self.url, &self.command) {
            (None, None) => Err(GatewayError::InvalidConfig {
                name: name.to_string(),
                reason: "exactly one of 'url' or 'command' must be set, neither was".to_string(),
            }),
            (Some(_), Some(_)) => Err(GatewayError::InvalidConfig {
                name: name.to_string(),
                reason: "exactly one of 'url' or 'command' must be set, both were".to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.url.is_some()
    }
}

/// Deploy request body: `{"mcpServers": {name: config, ...}}`.
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

/// Process-wide settings, layered: hard defaults, overridden by environment
/// variables under the `MCPGW_` prefix, following the same override-over-default
/// shape the rest of the ambient stack uses for its own settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub config_dir: PathBuf,
    pub http_bind: String,
    pub http_port: u16,
    pub session_gc_interval: Duration,
    pub default_retry_count: u32,
    pub shim_command: String,
    pub request_timeout: Duration,
    pub port_base: u16,
}

impl GatewayConfig {
    pub fn load() -> Self {
        Self {
            config_dir: default_config_dir(),
            http_bind: env_or("MCPGW_HTTP_BIND", DEFAULT_HTTP_BIND),
            http_port: env_parsed_or("MCPGW_HTTP_PORT", DEFAULT_HTTP_PORT),
            session_gc_interval: Duration::from_secs(env_parsed_or(
                "MCPGW_SESSION_GC_INTERVAL_SECS",
                DEFAULT_SESSION_GC_INTERVAL_SECS,
            )),
            default_retry_count: env_parsed_or(
                "MCPGW_SERVICE_RETRY_COUNT",
                DEFAULT_SERVICE_RETRY_COUNT,
            ),
            shim_command: env_or("MCPGW_SHIM_COMMAND", DEFAULT_SHIM_COMMAND),
            request_timeout: Duration::from_secs(env_parsed_or(
                "MCPGW_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
            port_base: env_parsed_or("MCPGW_PORT_BASE", DEFAULT_PORT_BASE),
        }
    }

    pub fn mcp_config_path(&self) -> PathBuf {
        self.config_dir.join(MCP_CONFIG_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_bind, self.http_port)
    }
}

/// `/etc/proxy` if it exists at startup, else the current directory — matches
/// the upstream proxy's behavior exactly (see original_source).
fn default_config_dir() -> PathBuf {
    let etc_proxy = Path::new("/etc/proxy");
    if etc_proxy.is_dir() {
        etc_proxy.to_path_buf()
    } else {
        PathBuf::from(".")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Serialize `configs` as pretty-printed JSON to `<configDir>/mcp_servers.json`.
pub async fn save_configs(
    path: &Path,
    configs: &HashMap<String, McpServerConfig>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(GatewayError::Persistence)?;
    }
    let json = serde_json::to_string_pretty(configs)
        .map_err(|e| GatewayError::Other(anyhow::anyhow!(e)))?;
    tokio::fs::write(path, json)
        .await
        .map_err(GatewayError::Persistence)?;
    set_mode(path, 0o644);
    Ok(())
}

/// Read the persisted name→config map, if the file exists.
pub async fn load_configs(path: &Path) -> Result<Option<HashMap<String, McpServerConfig>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let configs: HashMap<String, McpServerConfig> = serde_json::from_slice(&bytes)
                .map_err(|e| GatewayError::Other(anyhow::anyhow!(e)))?;
            Ok(Some(configs))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(GatewayError::Persistence(e)),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_neither_url_nor_command() {
        let cfg = McpServerConfig {
            url: None,
            command: None,
            args: vec![],
            env: HashMap::new(),
        };
        assert!(cfg.validate("svc").is_err());
    }

    #[test]
    fn validate_rejects_both_url_and_command() {
        let cfg = McpServerConfig {
            url: Some("http://x".into()),
            command: Some("npx".into()),
            args: vec![],
            env: HashMap::new(),
        };
        assert!(cfg.validate("svc").is_err());
    }

    #[test]
    fn validate_accepts_url_only() {
        let cfg = McpServerConfig {
            url: Some("http://x".into()),
            command: None,
            args: vec![],
            env: HashMap::new(),
        };
        assert!(cfg.validate("svc").is_ok());
        assert!(cfg.is_remote());
    }

    #[test]
    fn validate_accepts_command_only() {
        let cfg = McpServerConfig {
            url: None,
            command: Some("npx".into()),
            args: vec!["-y".into(), "thing".into()],
            env: HashMap::new(),
        };
        assert!(cfg.validate("svc").is_ok());
        assert!(!cfg.is_remote());
    }

    #[test]
    fn config_serializes_omitting_empty_fields() {
        let cfg = McpServerConfig {
            url: Some("http://x/".into()),
            command: None,
            args: vec![],
            env: HashMap::new(),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(json, r#"{"url":"http://x/"}"#);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_servers.json");
        let mut configs = HashMap::new();
        configs.insert(
            "a".to_string(),
            McpServerConfig {
                url: Some("http://x/".into()),
                command: None,
                args: vec![],
                env: HashMap::new(),
            },
        );

        save_configs(&path, &configs).await.unwrap();
        let loaded = load_configs(&path).await.unwrap().unwrap();
        assert_eq!(loaded, configs);
    }

    #[tokio::test]
    async fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(load_configs(&path).await.unwrap().is_none());
    }
}
