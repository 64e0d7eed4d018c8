//! Read-only REST view of the execution registry.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::AppState;

/// `GET /api/executions` — summaries of every tracked execution, oldest first.
pub async fn list(State(state): State<AppState>) -> Response {
    let executions = state.registry.list().await;
    Json(json!({ "executions": executions })).into_response()
}

/// `GET /api/executions/{id}` — one execution's summary.
///
/// # Error responses
///
/// - `404 Not Found` — no execution with that id
pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.summary(&id).await {
        Some(summary) => Json(summary).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Execution {id} not found")})),
        )
            .into_response(),
    }
}
