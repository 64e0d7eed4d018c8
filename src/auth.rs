//! Optional shared-token authentication.
//!
//! When `auth.token` is configured, the WebSocket upgrade and the REST
//! endpoints under `/api/` (except `/api/health`) require it. Browsers and
//! spawned runners cannot set headers on a WebSocket upgrade, so the token is
//! accepted as a `?token=` query parameter as well as a
//! `Authorization: Bearer` header.

use axum::{
    extract::{Query, Request, State},
    http::{StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the token length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Whether `provided` satisfies the configured token. No token configured
/// means everything is accepted.
pub fn token_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => {
            provided.is_some_and(|p| constant_time_eq(expected.as_bytes(), p.as_bytes()))
        }
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Decoded `token` query parameter of `uri`.
pub fn query_token(uri: &Uri) -> Option<String> {
    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token)
}

/// Axum middleware enforcing the configured token on REST routes.
///
/// # Error responses
///
/// - `403 Forbidden` — token missing or wrong
pub async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    let from_query = query_token(request.uri());
    let provided = bearer.or(from_query.as_deref());

    if !token_matches(state.config.auth.token.as_deref(), provided) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid or missing token"})),
        )
            .into_response();
    }

    next.run(request).await
}
