pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod mcp_service;
pub mod port;
pub mod proxy;
pub mod routes;
pub mod session;
pub mod sse;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use manager::ServiceManager;
pub use mcp_service::McpService;
pub use proxy::AppState;
pub use session::Session;
