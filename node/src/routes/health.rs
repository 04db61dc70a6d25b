use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    build_id: String,
    workspace_id: String,
    encryption: bool,
    open_sessions: usize,
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let config = state.config();
    Json(HealthResponse {
        status: "ok",
        build_id: state.build_id().to_string(),
        workspace_id: config.workspace_id.clone(),
        encryption: config.encryption_enabled,
        open_sessions: state.open_sessions().await,
    })
}
