//! Frame handlers: one function per concern, dispatched from
//! [`dispatch`] by pattern-matching the decoded [`ClientMessage`].
//!
//! Handlers read and mutate the shared tables in [`AppState`]. Anything read
//! from a table may be stale after an `.await`; the registry re-checks status
//! under its own lock, so handlers only act on what it returns.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::Connection;
use crate::clients::ClientRole;
use crate::diagnostics;
use crate::executions::{ExecutionConfig, StopRequest};
use crate::protocol::{
    ClientMessage, HttpOutcome, ServerMessage, StartExecution, TunnelCreated, WorkerMessage,
};
use crate::runner::launch::{launch, worker_url, LaunchContext, LaunchError};
use crate::runner::process::{ExitInfo, ProcessHandle, ProcessOutput};
use crate::util::short_id;
use crate::AppState;

const INVALID_REQUEST: &str = "INVALID_REQUEST";
const NOT_FOUND: &str = "NOT_FOUND";

/// Route one decoded frame.
pub async fn dispatch(state: &AppState, conn: &mut Connection, msg: ClientMessage, raw: Value) {
    match msg {
        ClientMessage::RegisterUi => {
            conn.send(ServerMessage::Registered {
                client_id: conn.client_id.clone(),
            })
            .await;
        }
        ClientMessage::StartExecution(req) => start_execution(state, conn, req).await,
        ClientMessage::StopExecution { execution_id } => {
            stop_execution(state, conn, execution_id).await;
        }
        ClientMessage::AttachExecution {
            execution_id,
            since,
        } => attach_execution(state, conn, &execution_id, since).await,
        ClientMessage::ListExecutions => {
            conn.send(ServerMessage::ExecutionList {
                executions: state.registry.list().await,
            })
            .await;
        }
        ClientMessage::SendWebhook {
            port,
            payload,
            path,
        } => {
            let tunnels = state.tunnels.clone();
            reply_later(conn, async move {
                ServerMessage::WebhookResponse(
                    tunnels.send_webhook(port, path.as_deref(), &payload).await,
                )
            });
        }
        ClientMessage::CheckBinary { path } => {
            let config = Arc::clone(&state.config);
            reply_later(conn, async move {
                ServerMessage::BinaryStatus(
                    diagnostics::check_binary(&config.runner, path.as_deref()).await,
                )
            });
        }
        ClientMessage::CheckPrerequisites {
            execution_mode,
            ansible_rulebook_path,
            container_image,
        } => {
            let config = Arc::clone(&state.config);
            reply_later(conn, async move {
                ServerMessage::PrerequisitesStatus(
                    diagnostics::check_prerequisites(
                        &config.runner,
                        execution_mode.unwrap_or_default(),
                        ansible_rulebook_path.as_deref(),
                        container_image.as_deref(),
                    )
                    .await,
                )
            });
        }
        ClientMessage::InstallAnsibleRulebook => install(conn),
        ClientMessage::GetAnsibleVersion { path } => {
            let config = Arc::clone(&state.config);
            reply_later(conn, async move {
                ServerMessage::AnsibleVersionResponse(
                    diagnostics::ansible_version(&config.runner, path.as_deref()).await,
                )
            });
        }
        ClientMessage::GetCollectionList => {
            reply_later(conn, async {
                ServerMessage::CollectionListResponse(diagnostics::collection_list().await)
            });
        }
        ClientMessage::TestTunnel { url, payload } => {
            if url.trim().is_empty() {
                conn.send(ServerMessage::TestTunnelResponse(HttpOutcome {
                    success: false,
                    error: Some("url is required".to_string()),
                    ..HttpOutcome::default()
                }))
                .await;
                return;
            }
            let tunnels = state.tunnels.clone();
            reply_later(conn, async move {
                ServerMessage::TestTunnelResponse(tunnels.test(&url, payload).await)
            });
        }
        ClientMessage::CreateTunnel {
            port,
            public,
            forward_to,
        } => create_tunnel(state, conn, port, public, forward_to).await,
        ClientMessage::DeleteTunnel { port } => {
            conn.watched_ports.remove(&port);
            let tunnels = state.tunnels.clone();
            reply_later(conn, async move {
                let result = tunnels.delete(port).await;
                ServerMessage::TunnelDeleted {
                    success: result.is_ok(),
                    port,
                    error: result.err().map(|e| e.to_string()),
                }
            });
        }
        ClientMessage::UpdateTunnelForwarding { port, forward_to } => {
            let result = state.tunnels.update_forwarding(port, forward_to).await;
            if result.is_ok() {
                conn.watched_ports.insert(port);
            }
            conn.send(ServerMessage::TunnelForwardingUpdated {
                success: result.is_ok(),
                port,
                forward_to,
                error: result.err().map(|e| e.to_string()),
            })
            .await;
        }
        ClientMessage::GetTunnelState => {
            let tunnels = state.tunnels.state().await;
            conn.watched_ports.extend(tunnels.iter().map(|t| t.port));
            conn.send(ServerMessage::TunnelState { tunnels }).await;
        }
        ClientMessage::Heartbeat => {
            if let Some(id) = worker_execution(state, conn).await {
                state.registry.touch_heartbeat(&id).await;
            }
        }
        ClientMessage::Worker { activation_id } => worker_hello(state, conn, &activation_id).await,
        ClientMessage::SessionStats => relay_session_stats(state, conn, raw).await,
        ClientMessage::Job
        | ClientMessage::AnsibleEvent
        | ClientMessage::Action
        | ClientMessage::Shutdown => relay_runner_event(state, conn, raw).await,
        ClientMessage::Unknown => {
            debug!(
                "Client {}: ignoring frame type {}",
                short_id(&conn.client_id),
                raw["type"]
            );
        }
    }
}

/// Run `reply` off the connection loop and send its result back.
fn reply_later<F>(conn: &Connection, reply: F)
where
    F: Future<Output = ServerMessage> + Send + 'static,
{
    let tx = conn.tx.clone();
    tokio::spawn(async move {
        let _ = tx.send(reply.await.into()).await;
    });
}

/// Validate a `start_execution` body into a configuration snapshot.
pub fn execution_config(req: StartExecution) -> Result<ExecutionConfig, String> {
    let rulebook = req
        .rulebook
        .filter(|r| !r.trim().is_empty())
        .ok_or("rulebook is required")?;
    Ok(ExecutionConfig {
        rulebook,
        extra_vars: req.extra_vars.filter(|v| !v.is_null()),
        env_vars: req.env_vars.unwrap_or_default(),
        mode: req.execution_mode.unwrap_or_default(),
        container_image: req.container_image,
        binary_path: req.ansible_rulebook_path,
        working_dir: req.working_directory.filter(|d| !d.trim().is_empty()),
        heartbeat_secs: req.heartbeat,
        extra_cli_args: req.extra_cli_args.filter(|a| !a.trim().is_empty()),
    })
}

async fn start_execution(state: &AppState, conn: &Connection, req: StartExecution) {
    let config = match execution_config(req) {
        Ok(c) => c,
        Err(message) => {
            conn.send(ServerMessage::error(INVALID_REQUEST, message)).await;
            return;
        }
    };

    let ws_url = worker_url(
        &state.config.server,
        state.config.auth.token.as_deref(),
        config.mode,
        state.host_network,
    );
    let execution_id = state
        .registry
        .create(config.clone(), Some(&conn.client_id))
        .await;
    state
        .clients
        .bind(&conn.client_id, ClientRole::Ui, Some(&execution_id))
        .await;
    conn.send(ServerMessage::ExecutionStarted {
        execution_id: execution_id.clone(),
        ws_url: ws_url.clone(),
    })
    .await;

    match launch_runner(state, &execution_id, &config, ws_url) {
        Ok((handle, output)) => {
            if state
                .registry
                .attach_process(&execution_id, handle.clone())
                .await
            {
                tokio::spawn(supervise(state.clone(), execution_id, handle, output));
            } else {
                // Stopped or evicted while launching.
                let grace = Duration::from_millis(state.config.runner.stop_grace_ms);
                tokio::spawn(async move {
                    handle.stop(grace).await;
                });
            }
        }
        Err(e) => {
            let message = e.to_string();
            error!("Execution {execution_id}: {message}");
            if let Some(Some(owner)) = state.registry.mark_error(&execution_id, message.clone()).await {
                state
                    .clients
                    .send(
                        &owner,
                        ServerMessage::ProcessError {
                            execution_id,
                            error: message,
                        },
                    )
                    .await;
            }
        }
    }
}

fn launch_runner(
    state: &AppState,
    execution_id: &str,
    config: &ExecutionConfig,
    worker_url: String,
) -> Result<(ProcessHandle, mpsc::Receiver<ProcessOutput>), LaunchError> {
    let ctx = LaunchContext {
        execution_id,
        worker_url,
        runner: &state.config.runner,
        host_network: state.host_network,
        path_var: std::env::var_os("PATH"),
    };
    launch(config, &ctx)
}

/// How long output is still relayed once the runner has exited. Descendants
/// that inherited its pipes can keep them open indefinitely.
const EXIT_DRAIN: Duration = Duration::from_secs(1);

async fn relay_output(state: &AppState, execution_id: &str, chunk: ProcessOutput) {
    if let Some(owner) = state.registry.owner(execution_id).await {
        state
            .clients
            .send(
                &owner,
                ServerMessage::ProcessOutput {
                    execution_id: execution_id.to_string(),
                    stream: chunk.stream.as_str().to_string(),
                    data: String::from_utf8_lossy(&chunk.data).into_owned(),
                },
            )
            .await;
    }
}

/// Relay a runner's output to the execution's current owner and record its
/// exit as soon as the process ends.
async fn supervise(
    state: AppState,
    execution_id: String,
    handle: ProcessHandle,
    mut output: mpsc::Receiver<ProcessOutput>,
) {
    let info = loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(chunk) => relay_output(&state, &execution_id, chunk).await,
                None => break handle.wait().await,
            },
            info = handle.wait() => break info,
        }
    };

    let drained = tokio::time::timeout(EXIT_DRAIN, async {
        while let Some(chunk) = output.recv().await {
            relay_output(&state, &execution_id, chunk).await;
        }
    })
    .await;
    if drained.is_err() {
        debug!("Execution {execution_id}: output still open after exit, no longer relayed");
    }
    drop(output);

    if let Some(Some(owner)) = state.registry.mark_exited(&execution_id, info).await {
        state
            .clients
            .send(
                &owner,
                ServerMessage::ProcessExited {
                    execution_id,
                    exit_code: info.code,
                    signal: info.signal,
                },
            )
            .await;
    }
}

async fn stop_execution(state: &AppState, conn: &Connection, execution_id: String) {
    match state.registry.begin_stop(&execution_id).await {
        StopRequest::NotFound => {
            debug!("Stop for unknown execution {execution_id}, nothing to do");
            conn.send(ServerMessage::ExecutionStopped {
                execution_id,
                success: true,
                exit_code: None,
                signal: None,
            })
            .await;
        }
        StopRequest::NotRunning(status) => {
            debug!("Execution {execution_id} already {}", status.as_str());
            let summary = state.registry.summary(&execution_id).await;
            conn.send(ServerMessage::ExecutionStopped {
                execution_id,
                success: true,
                exit_code: summary.as_ref().and_then(|s| s.exit_code),
                signal: summary.as_ref().and_then(|s| s.signal),
            })
            .await;
        }
        StopRequest::Stopping(handle) => {
            let grace = Duration::from_millis(state.config.runner.stop_grace_ms);
            let state = state.clone();
            let tx = conn.tx.clone();
            tokio::spawn(async move {
                let info = match handle {
                    Some(handle) => handle.stop(grace).await.unwrap_or_else(|| {
                        warn!("Execution {execution_id}: process did not exit after SIGKILL");
                        ExitInfo::default()
                    }),
                    None => ExitInfo::default(),
                };
                state.registry.mark_exited(&execution_id, info).await;
                let _ = tx
                    .send(
                        ServerMessage::ExecutionStopped {
                            execution_id: execution_id.clone(),
                            success: true,
                            exit_code: info.code,
                            signal: info.signal,
                        }
                        .into(),
                    )
                    .await;
                state.registry.remove(&execution_id).await;
            });
        }
    }
}

async fn attach_execution(state: &AppState, conn: &Connection, execution_id: &str, since: u64) {
    let Some(replay) = state.registry.events_since(execution_id, since).await else {
        conn.send(ServerMessage::error(
            NOT_FOUND,
            format!("Execution {execution_id} not found"),
        ))
        .await;
        return;
    };
    state.registry.set_owner(execution_id, &conn.client_id).await;
    state
        .clients
        .bind(&conn.client_id, ClientRole::Ui, Some(execution_id))
        .await;
    info!(
        "Execution {execution_id}: attached by {} ({} event(s) replayed)",
        short_id(&conn.client_id),
        replay.events.len()
    );
    conn.send(ServerMessage::ExecutionAttached {
        execution_id: execution_id.to_string(),
        status: replay.status,
        events: replay.events,
        dropped: replay.dropped,
    })
    .await;
}

fn install(conn: &Connection) {
    let tx = conn.tx.clone();
    tokio::spawn(async move {
        let (progress_tx, mut progress_rx) = mpsc::channel::<String>(64);
        let lines_tx = tx.clone();
        let relay = tokio::spawn(async move {
            while let Some(line) = progress_rx.recv().await {
                let _ = lines_tx
                    .send(ServerMessage::InstallationProgress { line }.into())
                    .await;
            }
        });
        let result = diagnostics::install(&progress_tx).await;
        drop(progress_tx);
        let _ = relay.await;
        if let Err(e) = &result {
            warn!("Installation failed: {e}");
        }
        let _ = tx
            .send(
                ServerMessage::InstallationComplete {
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                }
                .into(),
            )
            .await;
    });
}

async fn create_tunnel(
    state: &AppState,
    conn: &mut Connection,
    port: u16,
    public: bool,
    forward_to: Option<u16>,
) {
    if port == 0 || forward_to == Some(port) {
        conn.send(ServerMessage::TunnelCreated(TunnelCreated {
            success: false,
            port,
            error: Some("port must be non-zero and differ from forwardTo".to_string()),
            ..TunnelCreated::default()
        }))
        .await;
        return;
    }
    conn.watched_ports.insert(port);
    let tunnels = state.tunnels.clone();
    reply_later(conn, async move {
        let created = match tunnels.create(port, public, forward_to).await {
            Ok(outcome) => TunnelCreated {
                success: outcome.public_error.is_none(),
                port,
                public_url: outcome.public_url,
                tunnel_id: outcome.tunnel_id,
                forward_to: outcome.forward_to,
                error: outcome.public_error,
            },
            Err(e) => TunnelCreated {
                success: false,
                port,
                error: Some(e.to_string()),
                ..TunnelCreated::default()
            },
        };
        ServerMessage::TunnelCreated(created)
    });
}

/// Extra vars as YAML text: strings pass through, structures are rendered.
fn extra_vars_yaml(vars: &Value) -> Option<String> {
    match vars {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => match serde_yaml::to_string(other) {
            Ok(yaml) => Some(yaml),
            Err(e) => {
                warn!("Failed to render extra vars: {e}");
                None
            }
        },
    }
}

/// Frames answering a runner's `Worker` request.
pub fn workload_frames(config: &ExecutionConfig) -> Vec<WorkerMessage> {
    let mut frames = vec![WorkerMessage::Rulebook {
        data: STANDARD.encode(config.rulebook.as_bytes()),
    }];
    if let Some(yaml) = config.extra_vars.as_ref().and_then(extra_vars_yaml) {
        frames.push(WorkerMessage::ExtraVars {
            data: STANDARD.encode(yaml.as_bytes()),
        });
    }
    frames.push(WorkerMessage::EndOfResponse);
    frames
}

async fn worker_hello(state: &AppState, conn: &Connection, execution_id: &str) {
    let Some(binding) = state
        .registry
        .bind_worker(execution_id, &conn.client_id)
        .await
    else {
        warn!(
            "Client {}: Worker frame for unknown or finished execution {execution_id}",
            short_id(&conn.client_id)
        );
        return;
    };
    state
        .clients
        .bind(&conn.client_id, ClientRole::Worker, Some(execution_id))
        .await;
    for frame in workload_frames(&binding.config) {
        conn.send(frame).await;
    }
    if let Some(owner) = binding.owner {
        state
            .clients
            .send(
                &owner,
                ServerMessage::WorkerConnected {
                    execution_id: execution_id.to_string(),
                },
            )
            .await;
    }
}

/// The execution a worker connection is bound to.
async fn worker_execution(state: &AppState, conn: &Connection) -> Option<String> {
    let client = state.clients.get(&conn.client_id).await?;
    if client.role == ClientRole::Worker {
        client.execution_id
    } else {
        None
    }
}

async fn relay_runner_event(state: &AppState, conn: &Connection, raw: Value) {
    let Some(execution_id) = worker_execution(state, conn).await else {
        debug!(
            "Client {}: runner event from unbound connection",
            short_id(&conn.client_id)
        );
        return;
    };
    if let Some(Some(owner)) = state.registry.record_event(&execution_id, raw.clone()).await {
        state
            .clients
            .send(
                &owner,
                ServerMessage::RulebookEvent {
                    execution_id,
                    event: raw,
                },
            )
            .await;
    }
}

async fn relay_session_stats(state: &AppState, conn: &Connection, raw: Value) {
    let Some(execution_id) = worker_execution(state, conn).await else {
        return;
    };
    state.registry.touch_heartbeat(&execution_id).await;
    if let Some(Some(owner)) = state.registry.record_event(&execution_id, raw.clone()).await {
        let stats = raw.get("stats").cloned().unwrap_or(raw);
        state
            .clients
            .send(
                &owner,
                ServerMessage::SessionStats {
                    execution_id,
                    stats,
                },
            )
            .await;
    }
}

/// Connection teardown: drop the client, and unbind a worker from its
/// execution. Executions themselves are never removed here.
pub async fn disconnect(state: &AppState, conn: &Connection) {
    let Some(client) = state.clients.remove(&conn.client_id).await else {
        return;
    };
    if client.role == ClientRole::Worker {
        if let Some(execution_id) = client.execution_id {
            state
                .registry
                .release_worker(&execution_id, &conn.client_id)
                .await;
        }
    }
}
