//! Per-port HTTP ingress for webhooks.
//!
//! The server accepts any method on any path. Each request is either answered
//! directly (`200 {success, message, port}`) or forwarded to the port's
//! forwarding target, whose response is relayed back. A forward that fails at
//! the network level is answered with `502` and a structured error body.
//! Either way one [`WebhookReceived`] record is published.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TunnelManager;
use crate::protocol::WebhookReceived;
use crate::util::now_ms;

/// How long a stopping ingress may spend draining connections.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Request headers never copied onto a forwarded request. `host` is rewritten
/// to the target; the framing headers are recomputed for the new body.
const FORWARD_SKIP_HEADERS: [&str; 4] = ["host", "connection", "transfer-encoding", "content-length"];

/// Response headers dropped when relaying the target's answer.
const RELAY_SKIP_HEADERS: [&str; 3] = ["content-encoding", "transfer-encoding", "connection"];

/// A running ingress server.
pub(super) struct IngressServer {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct IngressState {
    port: u16,
    tunnels: TunnelManager,
}

impl IngressServer {
    /// Bind `0.0.0.0:<port>` and start serving.
    pub(super) async fn start(port: u16, tunnels: TunnelManager) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let app = Router::new()
            .fallback(receive)
            .with_state(IngressState { port, tunnels });

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!("Ingress {port}: server error: {e}");
            }
            debug!("Ingress {port}: stopped");
        });
        Ok(Self { shutdown, task })
    }

    /// Stop accepting, drain briefly, then abort whatever is left.
    pub(super) async fn stop(self) {
        self.shutdown.cancel();
        let abort = self.task.abort_handle();
        if tokio::time::timeout(STOP_TIMEOUT, self.task).await.is_err() {
            abort.abort();
        }
    }
}

/// A network-level forwarding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// Nothing accepted the connection on the target port.
    Refused(String),
    /// The target did not answer within the forward timeout.
    Timeout,
    /// Any other transport failure.
    Transport(String),
}

impl ForwardError {
    /// Short machine-readable code reported as `errorCode`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Refused(_) => "ECONNREFUSED",
            Self::Timeout => "ETIMEDOUT",
            Self::Transport(_) => "EFORWARD",
        }
    }

    fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                match io_err.kind() {
                    io::ErrorKind::ConnectionRefused => return Self::Refused(io_err.to_string()),
                    io::ErrorKind::TimedOut => return Self::Timeout,
                    _ => {}
                }
            }
            source = cause.source();
        }
        let message = error_chain(err);
        if err.is_connect() && message.to_lowercase().contains("refused") {
            Self::Refused(message)
        } else {
            Self::Transport(message)
        }
    }
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(msg) => write!(f, "Connection refused: {msg}"),
            Self::Timeout => write!(f, "Forward request timed out"),
            Self::Transport(msg) => write!(f, "Forward failed: {msg}"),
        }
    }
}

impl std::error::Error for ForwardError {}

/// `err` and its causes, joined with `": "`.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// The target's answer, buffered.
struct Forwarded {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Parse a body as JSON, falling back to its (lossy) text.
pub fn parse_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

async fn forward(
    tunnels: &TunnelManager,
    target: u16,
    method: Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Forwarded, ForwardError> {
    let mut outgoing = headers.clone();
    for name in FORWARD_SKIP_HEADERS {
        outgoing.remove(name);
    }
    let response = tunnels
        .forward_client()
        .request(method, format!("http://localhost:{target}{path}"))
        .headers(outgoing)
        .body(body)
        .timeout(tunnels.forward_timeout())
        .send()
        .await
        .map_err(|e| ForwardError::classify(&e))?;

    let status = response.status();
    let mut headers = response.headers().clone();
    for name in RELAY_SKIP_HEADERS {
        headers.remove(name);
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| ForwardError::classify(&e))?;
    Ok(Forwarded {
        status,
        headers,
        body,
    })
}

fn relay_response(forwarded: Forwarded) -> Response {
    let mut response = Response::new(Body::from(forwarded.body));
    *response.status_mut() = forwarded.status;
    *response.headers_mut() = forwarded.headers;
    response
}

/// Fallback handler: every request on the ingress lands here.
async fn receive(
    State(ingress): State<IngressState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let port = ingress.port;
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

    let mut event = WebhookReceived {
        port,
        method: method.to_string(),
        path: path.clone(),
        headers: header_map(&headers),
        body: parse_body(&body),
        timestamp: now_ms(),
        forwarded: false,
        forwarded_to: None,
        forward_status: None,
        forward_failed: None,
        forward_error: None,
    };

    let response = match ingress.tunnels.forward_target(port).await {
        None => {
            info!("Ingress {port}: {method} {path}");
            Json(json!({
                "success": true,
                "message": "Webhook received",
                "port": port,
            }))
            .into_response()
        }
        Some(target) => match forward(
            &ingress.tunnels,
            target,
            method.clone(),
            &path,
            &headers,
            body,
        )
        .await
        {
            Ok(forwarded) => {
                info!(
                    "Ingress {port}: {method} {path} forwarded to {target} ({})",
                    forwarded.status
                );
                event.forwarded = true;
                event.forwarded_to = Some(target);
                event.forward_status = Some(forwarded.status.as_u16());
                relay_response(forwarded)
            }
            Err(e) => {
                warn!("Ingress {port}: {method} {path} forward to {target} failed: {e}");
                event.forward_failed = Some(true);
                event.forward_error = Some(e.to_string());
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "success": false,
                        "error": e.to_string(),
                        "errorCode": e.code(),
                        "port": port,
                        "targetPort": target,
                    })),
                )
                    .into_response()
            }
        },
    };

    ingress.tunnels.publish(event);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(br#"{"a":[1,2]}"#), json!({"a": [1, 2]}));
        assert_eq!(parse_body(b"key=value"), json!("key=value"));
        assert_eq!(parse_body(b""), json!(""));
    }

    #[test]
    fn test_forward_error_codes() {
        assert_eq!(ForwardError::Refused(String::new()).code(), "ECONNREFUSED");
        assert_eq!(ForwardError::Timeout.code(), "ETIMEDOUT");
        assert_eq!(ForwardError::Transport("dns".to_string()).code(), "EFORWARD");
    }

    #[test]
    fn test_header_map_is_lossy_and_sorted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-b", "2".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        let map = header_map(&headers);
        assert_eq!(
            map.keys().collect::<Vec<_>>(),
            vec!["content-type", "x-b"]
        );
    }
}
