//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness check.
///
/// Returns status, uptime, version and table sizes. No authentication
/// required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let executions = state.registry.len().await;
    let (ui, worker) = state.clients.counts().await;
    let tunnels = state.tunnels.len().await;
    let shutting_down = state.shutdown.is_shutting_down();

    Json(json!({
        "status": if shutting_down { "shutting_down" } else { "ok" },
        "shutting_down": shutting_down,
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "executions": executions,
        "clients": {
            "ui": ui,
            "worker": worker,
        },
        "tunnels": tunnels,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executions::ExecutionConfig;

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = AppState::new(Config::default());
        state.registry.create(ExecutionConfig::default(), None).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        state.clients.register(tx).await;

        let Json(body) = health(State(state.clone())).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["executions"], 1);
        assert_eq!(body["clients"]["ui"], 1);
        assert_eq!(body["clients"]["worker"], 0);
        assert_eq!(body["tunnels"], 0);

        state.shutdown.begin();
        let Json(body) = health(State(state)).await;
        assert_eq!(body["status"], "shutting_down");
        assert_eq!(body["shutting_down"], true);
    }
}
