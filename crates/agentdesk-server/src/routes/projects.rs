//! Project routes — registry, message history and the client bootstrap data.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use super::{error_response, ProjectRequest};
use crate::state::AppState;
use agentdesk_core::config::SEARCH_ENGINES;
use agentdesk_core::Error;
use agentdesk_store::ProjectRegistry;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/data", get(get_data))
        .route("/messages", post(get_messages))
        .route("/create-project", post(create_project))
        .route("/delete-project", post(delete_project))
}

/// Reduce a user-supplied project name to a filesystem-safe identifier.
/// Returns `None` when nothing usable remains.
pub fn sanitize_project_name(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn bad_name(raw: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": format!("Invalid project name: {:?}", raw) })),
    )
}

/// GET /api/data — projects, models and search engines for the client.
async fn get_data(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_projects() {
        Ok(projects) => {
            let names: Vec<String> = projects.into_iter().map(|p| p.name).collect();
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "projects": names,
                    "models": state.config.models,
                    "search_engines": SEARCH_ENGINES,
                })),
            )
        }
        Err(e) => error_response(&e),
    }
}

/// POST /api/messages — conversation history for a project.
async fn get_messages(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProjectRequest>,
) -> impl IntoResponse {
    match state.store.get_messages(&req.project_name) {
        Ok(messages) => (StatusCode::OK, Json(serde_json::json!({ "messages": messages }))),
        Err(e) => error_response(&e),
    }
}

/// POST /api/create-project
async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProjectRequest>,
) -> impl IntoResponse {
    let name = match sanitize_project_name(&req.project_name) {
        Some(n) => n,
        None => return bad_name(&req.project_name),
    };

    if let Err(e) = std::fs::create_dir_all(state.config.data_paths.projects.join(&name)) {
        return error_response(&Error::Io(e));
    }

    match state.store.create_project(&name) {
        Ok(project) => (
            StatusCode::OK,
            Json(serde_json::json!({ "message": "Project created", "project": project.name })),
        ),
        Err(e) => error_response(&e),
    }
}

/// POST /api/delete-project — removes the project, its history and run state.
async fn delete_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProjectRequest>,
) -> impl IntoResponse {
    let name = match sanitize_project_name(&req.project_name) {
        Some(n) => n,
        None => return bad_name(&req.project_name),
    };

    match state.orchestrator.delete_project(&name) {
        Ok(true) => {
            let dir = state.config.data_paths.projects.join(&name);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!("Failed to remove {}: {}", dir.display(), e);
                }
            }
            (
                StatusCode::OK,
                Json(serde_json::json!({ "message": "Project deleted" })),
            )
        }
        Ok(false) => error_response(&Error::UnknownProject(name)),
        Err(e) => error_response(&e),
    }
}
