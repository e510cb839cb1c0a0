use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::metrics;
use crate::state::AppState;
use crate::websocket::ws_handler;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "service": "chat-service", "status": "ok" }))
}
