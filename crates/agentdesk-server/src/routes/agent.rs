//! Agent routes — submit work items and read run state.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use super::{error_response, ProjectRequest};
use crate::state::AppState;
use agentdesk_runtime::RunInput;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/user-message", post(user_message))
        .route("/is-agent-active", post(is_agent_active))
        .route("/get-agent-state", post(get_agent_state))
        .route("/get-browser-session", get(get_browser_session))
        .route("/get-terminal-session", get(get_terminal_session))
        .route("/token-usage", get(token_usage))
}

#[derive(Debug, Deserialize)]
struct UserMessageRequest {
    message: String,
    #[serde(default)]
    base_model: String,
    project_name: String,
    #[serde(default)]
    search_engine: String,
}

#[derive(Debug, Deserialize)]
struct ProjectQuery {
    project_name: String,
}

/// POST /api/user-message — classify and dispatch a work item.
async fn user_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserMessageRequest>,
) -> impl IntoResponse {
    info!("User message for {}: {} chars", req.project_name, req.message.len());
    let input = RunInput {
        text: req.message,
        model_id: req.base_model,
        project_id: req.project_name,
        search_engine_id: req.search_engine.to_lowercase(),
    };

    match state.orchestrator.submit(input) {
        Ok(dispatch) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "run_id": dispatch.run_id,
                "mode": dispatch.mode,
            })),
        ),
        Err(e) => error_response(&e),
    }
}

/// POST /api/is-agent-active
async fn is_agent_active(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProjectRequest>,
) -> impl IntoResponse {
    match state.orchestrator.is_active(&req.project_name) {
        Ok(active) => (StatusCode::OK, Json(serde_json::json!({ "is_active": active }))),
        Err(e) => error_response(&e),
    }
}

/// POST /api/get-agent-state — full run state, `null` if the project never ran.
async fn get_agent_state(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProjectRequest>,
) -> impl IntoResponse {
    match state.orchestrator.state(&req.project_name) {
        Ok(run_state) => (StatusCode::OK, Json(serde_json::json!({ "state": run_state }))),
        Err(e) => error_response(&e),
    }
}

/// GET /api/get-browser-session?project_name=
async fn get_browser_session(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectQuery>,
) -> impl IntoResponse {
    match state.orchestrator.state(&q.project_name) {
        Ok(run_state) => {
            let session = run_state.and_then(|s| s.browser_session);
            (StatusCode::OK, Json(serde_json::json!({ "session": session })))
        }
        Err(e) => error_response(&e),
    }
}

/// GET /api/get-terminal-session?project_name=
async fn get_terminal_session(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectQuery>,
) -> impl IntoResponse {
    match state.orchestrator.state(&q.project_name) {
        Ok(run_state) => {
            let terminal = run_state.and_then(|s| s.terminal_session);
            (StatusCode::OK, Json(serde_json::json!({ "terminal_state": terminal })))
        }
        Err(e) => error_response(&e),
    }
}

/// GET /api/token-usage?project_name=
async fn token_usage(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProjectQuery>,
) -> impl IntoResponse {
    match state.orchestrator.token_usage(&q.project_name) {
        Ok(tokens) => (StatusCode::OK, Json(serde_json::json!({ "token_usage": tokens }))),
        Err(e) => error_response(&e),
    }
}
