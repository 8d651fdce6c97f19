use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::config::DeployRequest;
use crate::error::Result;
use crate::proxy::{global_message_handler, global_sse_handler, proxy_handler, AppState};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/deploy", post(deploy_handler))
        .route("/sse", get(global_sse_handler))
        .route("/message", post(global_message_handler))
        .route("/{name}/{*rest}", any(proxy_handler))
        .with_state(state)
}

/// `POST /deploy` — `{"mcpServers": {name: {url|command, args, env}, ...}}`.
/// Restarts a backend already registered under that name, otherwise creates
/// and starts it.
async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeployRequest>,
) -> Result<impl IntoResponse> {
    state.manager.deploy(request.mcp_servers).await?;
    Ok(Json(json!({ "status": "deployed" })))
}
