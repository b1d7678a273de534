//! HTTP route handlers.

pub mod agent;
pub mod events;
pub mod projects;
pub mod status;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use agentdesk_core::Error;

/// Body shared by the routes that only need a project name.
#[derive(Debug, Deserialize)]
pub struct ProjectRequest {
    pub project_name: String,
}

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(status::routes())
        .merge(agent::routes())
        .merge(projects::routes())
        .merge(events::routes())
}

/// Map a domain error onto a status code and `{"error": ...}` body.
pub(crate) fn error_response(e: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        Error::UnknownProject(_) => StatusCode::NOT_FOUND,
        Error::RunRefused(_) | Error::ProjectExists(_) => StatusCode::CONFLICT,
        Error::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}
