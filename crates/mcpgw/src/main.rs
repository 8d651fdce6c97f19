use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use mcpgw::config::GatewayConfig;
use mcpgw::logging::open_log_file;
use mcpgw::manager::ServiceManager;
use mcpgw::proxy::AppState;
use mcpgw::routes::build_router;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(GatewayConfig::load());

    let gateway_log = open_log_file(&config.logs_dir(), "plugin-proxy.log")
        .context("failed to open gateway log file")?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(gateway_log))
                .with_ansi(false),
        )
        .try_init()
        .ok();

    tracing::info!(
        config_dir = %config.config_dir.display(),
        bind = %config.bind_addr(),
        "starting mcpgw",
    );

    let manager = ServiceManager::new(config.clone());
    if let Err(error) = manager.replay_persisted().await {
        tracing::warn!(error = %error, "failed to replay persisted service configuration");
    }

    let gc_manager = manager.clone();
    tokio::spawn(gc_manager.run_gc_loop());

    let http_client = reqwest::Client::builder()
        .http1_only()
        .timeout(config.request_timeout)
        .build()
        .unwrap_or_default();
    let state = Arc::new(AppState {
        manager: manager.clone(),
        http_client,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    tracing::info!(addr = %config.bind_addr(), "listening");

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_shutdown.cancelled().await;
            })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl_c")?;
    tracing::info!("shutdown signal received, draining sessions");
    shutdown.cancel();
    let _ = server.await;

    manager.shutdown().await;
    Ok(())
}
