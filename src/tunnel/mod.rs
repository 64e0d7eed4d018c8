//! Webhook tunnels, keyed by local port.
//!
//! Each port owns at most one HTTP ingress server (see [`ingress`]), an
//! optional public tunnel (see [`public`]) and an optional forwarding target.
//! Creating a tunnel on a port that is already bound updates that port's
//! state; the ingress server is started once and reused.
//!
//! Every request an ingress receives is published on a broadcast channel as a
//! [`WebhookReceived`] record. WebSocket connections subscribe and filter by
//! the ports they care about.

pub mod ingress;
pub mod public;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::config::TunnelConfig;
use crate::protocol::{HttpOutcome, TunnelInfo, WebhookReceived};
use crate::util::now_ms;
use ingress::IngressServer;
use public::PublicTunnel;

/// Upper bound for `test_tunnel` and `send_webhook` requests.
const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

/// Path used by `send_webhook` when the caller gives none.
const DEFAULT_WEBHOOK_PATH: &str = "/endpoint";

/// Everything known about one port.
struct PortTunnel {
    ingress: IngressServer,
    forward_to: Option<u16>,
    public: Option<PublicTunnel>,
}

/// Errors returned by tunnel operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// The ingress server could not bind its port.
    Bind { port: u16, message: String },
    /// No tunnel exists for the port.
    NotFound(u16),
    /// No public tunnel command is configured.
    PublicUnavailable,
    /// The public tunnel command failed or never printed a URL.
    Provision(String),
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { port, message } => write!(f, "Failed to bind port {port}: {message}"),
            Self::NotFound(port) => write!(f, "No tunnel on port {port}"),
            Self::PublicUnavailable => write!(f, "Public tunnels are not configured"),
            Self::Provision(msg) => write!(f, "Public tunnel failed: {msg}"),
        }
    }
}

impl std::error::Error for TunnelError {}

/// Result of [`TunnelManager::create`]. The local ingress is up whenever this
/// is returned; `public_error` reports a public tunnel that could not be
/// established.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOutcome {
    pub port: u16,
    pub forward_to: Option<u16>,
    pub public_url: Option<String>,
    pub tunnel_id: Option<String>,
    pub public_error: Option<String>,
}

/// Cloneable handle to the per-port tunnel table.
#[derive(Clone)]
pub struct TunnelManager {
    ports: Arc<RwLock<HashMap<u16, PortTunnel>>>,
    config: Arc<TunnelConfig>,
    /// Client for forwarded requests. Redirects are relayed, never followed.
    forward_client: reqwest::Client,
    http_client: reqwest::Client,
    webhooks: broadcast::Sender<WebhookReceived>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        let forward_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to build HTTP client");
        let http_client = reqwest::Client::builder()
            .timeout(OUTBOUND_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");
        let (webhooks, _) = broadcast::channel(256);
        Self {
            ports: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
            forward_client,
            http_client,
            webhooks,
        }
    }

    /// Receive every webhook any ingress gets from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WebhookReceived> {
        self.webhooks.subscribe()
    }

    pub(crate) fn publish(&self, event: WebhookReceived) {
        // No subscribers is fine.
        let _ = self.webhooks.send(event);
    }

    pub(crate) fn forward_client(&self) -> &reqwest::Client {
        &self.forward_client
    }

    pub(crate) fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.config.forward_timeout_ms)
    }

    /// Current forwarding target, read by the ingress on every request.
    pub async fn forward_target(&self, port: u16) -> Option<u16> {
        self.ports.read().await.get(&port).and_then(|t| t.forward_to)
    }

    /// Bind (or reuse) the ingress for `port`, record the forwarding target,
    /// and optionally establish a public tunnel.
    pub async fn create(
        &self,
        port: u16,
        public: bool,
        forward_to: Option<u16>,
    ) -> Result<CreateOutcome, TunnelError> {
        let existing_public = {
            let mut ports = self.ports.write().await;
            if let Some(tunnel) = ports.get_mut(&port) {
                tunnel.forward_to = forward_to;
                info!("Tunnel {port}: updated, forwardTo={forward_to:?}");
                tunnel
                    .public
                    .as_ref()
                    .map(|p| (p.url.clone(), p.id.clone()))
            } else {
                let ingress = IngressServer::start(port, self.clone())
                    .await
                    .map_err(|e| TunnelError::Bind {
                        port,
                        message: e.to_string(),
                    })?;
                ports.insert(
                    port,
                    PortTunnel {
                        ingress,
                        forward_to,
                        public: None,
                    },
                );
                info!("Tunnel {port}: ingress listening, forwardTo={forward_to:?}");
                None
            }
        };

        let mut outcome = CreateOutcome {
            port,
            forward_to,
            ..CreateOutcome::default()
        };

        if let Some((url, id)) = existing_public {
            outcome.public_url = Some(url);
            outcome.tunnel_id = Some(id);
        } else if public {
            match PublicTunnel::open(&self.config, port).await {
                Ok(tunnel) => {
                    outcome.public_url = Some(tunnel.url.clone());
                    outcome.tunnel_id = Some(tunnel.id.clone());
                    self.store_public(port, tunnel).await;
                }
                Err(e) => {
                    warn!("Tunnel {port}: {e}");
                    outcome.public_error = Some(e.to_string());
                }
            }
        }
        Ok(outcome)
    }

    /// Attach a freshly opened public tunnel, unless the port was deleted (or
    /// given another public tunnel) while it was being provisioned.
    async fn store_public(&self, port: u16, tunnel: PublicTunnel) {
        let leftover = {
            let mut ports = self.ports.write().await;
            match ports.get_mut(&port) {
                Some(entry) if entry.public.is_none() => {
                    info!("Tunnel {port}: public URL {}", tunnel.url);
                    entry.public = Some(tunnel);
                    None
                }
                _ => Some(tunnel),
            }
        };
        if let Some(tunnel) = leftover {
            tunnel.close().await;
        }
    }

    /// Change or clear the forwarding target. The ingress keeps running.
    pub async fn update_forwarding(
        &self,
        port: u16,
        forward_to: Option<u16>,
    ) -> Result<(), TunnelError> {
        let mut ports = self.ports.write().await;
        let tunnel = ports.get_mut(&port).ok_or(TunnelError::NotFound(port))?;
        tunnel.forward_to = forward_to;
        info!("Tunnel {port}: forwardTo={forward_to:?}");
        Ok(())
    }

    /// Close the public tunnel, stop the ingress and forget the port.
    pub async fn delete(&self, port: u16) -> Result<(), TunnelError> {
        let tunnel = self
            .ports
            .write()
            .await
            .remove(&port)
            .ok_or(TunnelError::NotFound(port))?;
        if let Some(public) = tunnel.public {
            public.close().await;
        }
        tunnel.ingress.stop().await;
        info!("Tunnel {port}: deleted");
        Ok(())
    }

    /// Every known port, sorted.
    pub async fn state(&self) -> Vec<TunnelInfo> {
        let ports = self.ports.read().await;
        let mut tunnels: Vec<TunnelInfo> = ports
            .iter()
            .map(|(port, t)| TunnelInfo {
                port: *port,
                public_url: t.public.as_ref().map(|p| p.url.clone()),
                tunnel_id: t.public.as_ref().map(|p| p.id.clone()),
                forward_to: t.forward_to,
            })
            .collect();
        tunnels.sort_by_key(|t| t.port);
        tunnels
    }

    pub async fn len(&self) -> usize {
        self.ports.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ports.read().await.is_empty()
    }

    /// Tear down every tunnel (shutdown). Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(u16, PortTunnel)> = self.ports.write().await.drain().collect();
        let count = drained.len();
        for (port, tunnel) in drained {
            if let Some(public) = tunnel.public {
                public.close().await;
            }
            tunnel.ingress.stop().await;
            info!("Tunnel {port}: closed");
        }
        count
    }

    /// POST a synthetic payload straight to `url`, bypassing local state.
    pub async fn test(&self, url: &str, payload: Value) -> HttpOutcome {
        let payload = if payload.is_null() {
            json!({
                "test": true,
                "message": "rulebookd tunnel test",
                "timestamp": now_ms(),
            })
        } else {
            payload
        };
        self.post_json(url, &payload).await
    }

    /// POST `payload` to a local webhook listener on `port`.
    pub async fn send_webhook(&self, port: u16, path: Option<&str>, payload: &Value) -> HttpOutcome {
        let path = path.filter(|p| !p.is_empty()).unwrap_or(DEFAULT_WEBHOOK_PATH);
        let separator = if path.starts_with('/') { "" } else { "/" };
        let url = format!("http://localhost:{port}{separator}{path}");
        self.post_json(&url, payload).await
    }

    async fn post_json(&self, url: &str, payload: &Value) -> HttpOutcome {
        let response = match self.http_client.post(url).json(payload).send().await {
            Ok(r) => r,
            Err(e) => {
                return HttpOutcome {
                    success: false,
                    error: Some(e.to_string()),
                    ..HttpOutcome::default()
                }
            }
        };
        let status = response.status();
        let body = match response.bytes().await {
            Ok(bytes) => ingress::parse_body(&bytes),
            Err(e) => {
                return HttpOutcome {
                    success: false,
                    status: Some(status.as_u16()),
                    error: Some(e.to_string()),
                    ..HttpOutcome::default()
                }
            }
        };
        HttpOutcome {
            success: status.is_success(),
            status: Some(status.as_u16()),
            body: Some(body),
            error: (!status.is_success()).then(|| format!("HTTP {status}")),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{http::StatusCode, Router};
    use tokio::net::TcpListener;

    /// A port nothing is listening on (at the time of the call).
    pub(crate) fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn manager() -> TunnelManager {
        TunnelManager::new(TunnelConfig {
            forward_timeout_ms: 2000,
            ..TunnelConfig::default()
        })
    }

    async fn next_event(rx: &mut broadcast::Receiver<WebhookReceived>) -> WebhookReceived {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no webhook broadcast")
            .unwrap()
    }

    #[tokio::test]
    async fn test_unforwarded_webhook_is_acknowledged() {
        let tunnels = manager();
        let port = free_port();
        let mut rx = tunnels.subscribe();
        let outcome = tunnels.create(port, false, None).await.unwrap();
        assert_eq!(outcome.port, port);
        assert!(outcome.public_error.is_none());

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/hooks/alert"))
            .json(&json!({"severity": "high"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["port"], port);

        let event = next_event(&mut rx).await;
        assert_eq!(event.port, port);
        assert_eq!(event.method, "POST");
        assert_eq!(event.path, "/hooks/alert");
        assert_eq!(event.body, json!({"severity": "high"}));
        assert!(!event.forwarded);
        assert!(event.forward_failed.is_none());

        tunnels.delete(port).await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_body_falls_back_to_string() {
        let tunnels = manager();
        let port = free_port();
        let mut rx = tunnels.subscribe();
        tunnels.create(port, false, None).await.unwrap();

        reqwest::Client::new()
            .put(format!("http://127.0.0.1:{port}/"))
            .body("plain text")
            .send()
            .await
            .unwrap();
        let event = next_event(&mut rx).await;
        assert_eq!(event.method, "PUT");
        assert_eq!(event.body, json!("plain text"));
        tunnels.close_all().await;
    }

    #[tokio::test]
    async fn test_forward_refused_returns_502() {
        let tunnels = manager();
        let port = free_port();
        let target = free_port();
        let mut rx = tunnels.subscribe();
        tunnels.create(port, false, Some(target)).await.unwrap();

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/hook"))
            .json(&json!({"a": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["errorCode"], "ECONNREFUSED");
        assert_eq!(body["port"], port);
        assert_eq!(body["targetPort"], target);

        let event = next_event(&mut rx).await;
        assert!(!event.forwarded);
        assert_eq!(event.forward_failed, Some(true));
        assert!(event.forward_error.is_some());
        tunnels.delete(port).await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_relays_target_response() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = target_listener.local_addr().unwrap().port();
        let app = Router::new().fallback(|uri: axum::http::Uri, headers: axum::http::HeaderMap| async move {
            let host = headers
                .get("host")
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default()
                .to_string();
            (
                StatusCode::CREATED,
                [("x-target", "yes")],
                format!("{uri} via {host}"),
            )
        });
        tokio::spawn(async move {
            axum::serve(target_listener, app).await.ok();
        });

        let tunnels = manager();
        let port = free_port();
        let mut rx = tunnels.subscribe();
        tunnels.create(port, false, Some(target)).await.unwrap();

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/a/b?x=1"))
            .body("{}")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["x-target"], "yes");
        let text = resp.text().await.unwrap();
        assert!(text.starts_with("/a/b?x=1 via "));
        assert!(text.ends_with(&format!(":{target}")));

        let event = next_event(&mut rx).await;
        assert!(event.forwarded);
        assert_eq!(event.forwarded_to, Some(target));
        assert_eq!(event.forward_status, Some(201));
        tunnels.delete(port).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_state_and_delete() {
        let tunnels = manager();
        let port = free_port();
        tunnels.create(port, false, None).await.unwrap();
        // Re-creating updates in place.
        tunnels.create(port, false, Some(9000)).await.unwrap();
        assert_eq!(tunnels.len().await, 1);
        assert_eq!(tunnels.forward_target(port).await, Some(9000));

        tunnels.update_forwarding(port, None).await.unwrap();
        assert_eq!(
            tunnels.state().await,
            vec![TunnelInfo {
                port,
                public_url: None,
                tunnel_id: None,
                forward_to: None
            }]
        );
        assert_eq!(
            tunnels.update_forwarding(port + 1, Some(1)).await,
            Err(TunnelError::NotFound(port + 1))
        );

        tunnels.delete(port).await.unwrap();
        assert!(tunnels.is_empty().await);
        assert_eq!(tunnels.delete(port).await, Err(TunnelError::NotFound(port)));
        // The port is free again.
        assert!(TcpListener::bind(("0.0.0.0", port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_public_failure_keeps_local_ingress() {
        let tunnels = manager();
        let port = free_port();
        let outcome = tunnels.create(port, true, None).await.unwrap();
        assert_eq!(
            outcome.public_error.as_deref(),
            Some("Public tunnels are not configured")
        );
        assert!(outcome.public_url.is_none());

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        tunnels.close_all().await;
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let held = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let err = manager().create(port, false, None).await.unwrap_err();
        assert!(matches!(err, TunnelError::Bind { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn test_send_webhook_reaches_ingress() {
        let tunnels = manager();
        let port = free_port();
        let mut rx = tunnels.subscribe();
        tunnels.create(port, false, None).await.unwrap();

        let outcome = tunnels
            .send_webhook(port, None, &json!({"event": "ping"}))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.status, Some(200));
        assert_eq!(outcome.body.unwrap()["success"], true);
        assert_eq!(next_event(&mut rx).await.path, "/endpoint");

        let outcome = tunnels.test(&format!("http://127.0.0.1:{}/", free_port()), Value::Null).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        tunnels.close_all().await;
    }
}
