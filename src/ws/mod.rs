//! WebSocket transport for UI clients and runner workers.
//!
//! ## Connection lifecycle
//!
//! 1. A peer connects to `GET /api/ws[?token=<token>]`. The token is checked
//!    before the upgrade completes when one is configured.
//! 2. The connection is registered in the client table with role `ui`. A
//!    runner that dials back sends `Worker {activation_id}` and becomes a
//!    `worker` bound to that execution.
//! 3. All frames are JSON objects with a `"type"` field (see
//!    [`crate::protocol`]). Frames are handled one at a time in arrival order;
//!    slow operations (outbound webhooks, diagnostics, stopping a process) reply from a
//!    spawned task. Malformed or unknown frames are dropped.
//! 4. On disconnect the client is removed. A worker's execution keeps running
//!    with `workerConnected = false`; a UI's executions are untouched.
//!
//! ## Message types (UI → server)
//!
//! | Type                       | Reply                                        |
//! |----------------------------|----------------------------------------------|
//! | `register_ui`              | `registered`                                 |
//! | `start_execution`          | `execution_started` or `error`               |
//! | `stop_execution`           | `execution_stopped`                          |
//! | `attach_execution`         | `execution_attached` or `error`              |
//! | `list_executions`          | `execution_list`                             |
//! | `send_webhook`             | `webhook_response`                           |
//! | `check_binary`             | `binary_status`                              |
//! | `check_prerequisites`      | `prerequisites_status`                       |
//! | `install_ansible_rulebook` | `installation_progress`*, `installation_complete` |
//! | `get_ansible_version`      | `ansible_version_response`                   |
//! | `get_collection_list`      | `collection_list_response`                   |
//! | `test_tunnel`              | `test_tunnel_response`                       |
//! | `create_tunnel`            | `tunnel_created`                             |
//! | `delete_tunnel`            | `tunnel_deleted`                             |
//! | `update_tunnel_forwarding` | `tunnel_forwarding_updated`                  |
//! | `get_tunnel_state`         | `tunnel_state`                               |
//!
//! ## Server-originated
//!
//! `process_output`, `process_error`, `process_exited`, `worker_connected`,
//! `rulebook_event`, `session_stats` go to the execution's owning UI.
//! `tunnel_webhook_received` goes to every connection watching that port.

pub mod handlers;

use std::collections::HashSet;

use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::protocol::{parse_frame, Outbound, ServerMessage};
use crate::util::short_id;
use crate::AppState;

/// Per-connection state owned by the connection loop.
pub struct Connection {
    pub client_id: String,
    /// Outgoing frames, drained by the writer task.
    pub tx: mpsc::Sender<Outbound>,
    /// Ports whose webhook broadcasts this connection receives.
    pub watched_ports: HashSet<u16>,
}

impl Connection {
    pub fn new(client_id: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            client_id,
            tx,
            watched_ports: HashSet::new(),
        }
    }

    /// Queue a frame for this connection. A closed connection is ignored.
    pub async fn send(&self, msg: impl Into<Outbound>) {
        let _ = self.tx.send(msg.into()).await;
    }
}

/// `GET /api/ws[?token=<token>]` — WebSocket upgrade handler.
///
/// Returns `403 Forbidden` on a token mismatch and `503` once shutdown has
/// begun.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let provided = auth::query_token(&uri);
    if !auth::token_matches(state.config.auth.token.as_deref(), provided.as_deref()) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }

    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Main WebSocket event loop.
///
/// Outgoing frames are funneled through an mpsc channel so handlers and
/// background tasks can send without holding the socket. The loop selects
/// over incoming frames, webhook broadcasts and shutdown.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(256);

    let client_id = state.clients.register(tx.clone()).await;
    let mut conn = Connection::new(client_id, tx);
    let mut webhooks = state.tunnels.subscribe();
    let shutdown = state.shutdown.token();
    info!("WebSocket client {} connected", short_id(&conn.client_id));

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    Message::Text(text) => match parse_frame(&text) {
                        Some((frame, raw)) => {
                            handlers::dispatch(&state, &mut conn, frame, raw).await;
                        }
                        None => debug!(
                            "Client {}: dropping malformed frame",
                            short_id(&conn.client_id)
                        ),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = webhooks.recv() => match event {
                Ok(event) => {
                    if conn.watched_ports.contains(&event.port) {
                        conn.send(ServerMessage::TunnelWebhookReceived(event)).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Client {}: skipped {n} webhook broadcast(s)", short_id(&conn.client_id));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handlers::disconnect(&state, &conn).await;
    info!("WebSocket client {} disconnected", short_id(&conn.client_id));
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::config::Config;
    use crate::{routes, AppState};

    async fn serve(config: Config) -> (AppState, String) {
        let state = AppState::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = routes::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, format!("ws://{addr}/api/ws"))
    }

    async fn next_json<S>(stream: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), stream.next())
                .await
                .expect("no frame received")
                .expect("stream ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_token_is_required_when_configured() {
        let mut config = Config::default();
        config.auth.token = Some("s3cret".to_string());
        let (_state, url) = serve(config).await;

        assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
        assert!(tokio_tungstenite::connect_async(format!("{url}?token=wrong"))
            .await
            .is_err());
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}?token=s3cret"))
            .await
            .unwrap();
        ws.send(WsMessage::text(json!({"type": "register_ui"}).to_string()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "registered");
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let (state, url) = serve(Config::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        ws.send(WsMessage::text("not json")).await.unwrap();
        ws.send(WsMessage::text(json!({"no": "type"}).to_string()))
            .await
            .unwrap();
        ws.send(WsMessage::text(json!({"type": "no_such_thing"}).to_string()))
            .await
            .unwrap();
        ws.send(WsMessage::text(json!({"type": "list_executions"}).to_string()))
            .await
            .unwrap();
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "execution_list");
        assert_eq!(state.clients.counts().await, (1, 0));

        ws.close(None).await.unwrap();
        for _ in 0..50 {
            if state.clients.counts().await == (0, 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state.clients.counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_webhooks_reach_watching_connections_only() {
        let (_state, url) = serve(Config::default()).await;
        let (mut watcher, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut bystander, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let port = crate::tunnel::tests::free_port();

        watcher
            .send(WsMessage::text(
                json!({"type": "create_tunnel", "port": port}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(next_json(&mut watcher).await["success"], true);

        let status = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/hook?x=1"))
            .json(&json!({"alert": "disk"}))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, 200);

        let event = next_json(&mut watcher).await;
        assert_eq!(event["type"], "tunnel_webhook_received");
        assert_eq!(event["port"], port);
        assert_eq!(event["method"], "POST");
        assert_eq!(event["body"]["alert"], "disk");

        bystander
            .send(WsMessage::text(json!({"type": "list_executions"}).to_string()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut bystander).await["type"], "execution_list");
    }

    #[tokio::test]
    async fn test_upgrade_refused_during_shutdown() {
        let (state, url) = serve(Config::default()).await;
        state.shutdown.begin();
        assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
    }
}
