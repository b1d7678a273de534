//! Server status route.

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/status", get(get_status))
}

/// GET /api/status — liveness check.
async fn get_status() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "server is running!" }))
}
