//! HTTP route handlers.
//!
//! Everything interesting happens over the WebSocket; these are the plain
//! REST endpoints beside it. All handlers except [`health`] sit behind the
//! [`crate::auth::require_token`] middleware.

pub mod executions;
pub mod health;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::{auth, ws, AppState};

/// Assemble the full HTTP surface.
///
/// | Method | Path                   | Auth | Description                     |
/// |--------|------------------------|------|---------------------------------|
/// | GET    | `/api/health`          | No   | Liveness check                  |
/// | GET    | `/api/executions`      | Yes  | Execution summaries             |
/// | GET    | `/api/executions/{id}` | Yes  | One execution                   |
/// | GET    | `/api/ws`              | Yes* | WebSocket for UIs and runners   |
///
/// *WebSocket auth is via `?token=<token>`, checked in the upgrade handler.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/executions", get(executions::list))
        .route("/api/executions/{id}", get(executions::get))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    let ws_route = Router::new().route("/api/ws", get(ws::ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
