//! Background sweep and process-wide shutdown.
//!
//! ## Janitor
//!
//! Every `janitor.interval_secs` the registry evicts executions that are not
//! `running` and are older than `janitor.stale_after_secs`.
//!
//! ## Shutdown
//!
//! The first SIGINT/SIGTERM flips [`ShutdownCoordinator`] into the shutting
//! down state, arms a force-exit timer and cancels the shared token (which
//! stops the HTTP server, the janitor and every WebSocket loop). Later signals
//! are logged and ignored. [`shutdown`] then stops every live runner process
//! and closes every tunnel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::JanitorConfig;
use crate::executions::ExecutionRegistry;
use crate::state::AppState;

/// Start the periodic stale-execution sweep. Stops when `cancel` fires.
pub fn spawn_janitor(
    registry: ExecutionRegistry,
    config: &JanitorConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = Duration::from_secs(config.interval_secs.max(1));
    let stale_after = Duration::from_secs(config.stale_after_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let evicted = registry.sweep_stale(Instant::now(), stale_after).await;
                    if !evicted.is_empty() {
                        info!("Janitor evicted {} stale execution(s)", evicted.len());
                    }
                }
            }
        }
        info!("Janitor stopped");
    })
}

/// Process-wide "shutting down" flag plus the token everything listens on.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    shutting_down: Arc<AtomicBool>,
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the shutting down state. Returns `true` only for the first call.
    pub fn begin(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Child token, cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Exit the process if teardown has not finished within `limit`. Runs on a
/// plain thread so a wedged runtime cannot hold it up.
pub fn arm_force_exit(limit: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(limit);
        error!("Shutdown did not finish within {}s, forcing exit", limit.as_secs());
        std::process::exit(1);
    });
}

/// Wait for SIGINT/SIGTERM. The first one begins shutdown and arms the
/// force-exit timer; repeats are ignored.
pub async fn watch_signals(coordinator: ShutdownCoordinator, force_exit: Duration) {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                None
            }
        };
    loop {
        let name = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            Some(()) = async {
                match sigterm.as_mut() {
                    Some(s) => s.recv().await,
                    None => std::future::pending().await,
                }
            } => "SIGTERM",
        };
        on_signal(&coordinator, name, || arm_force_exit(force_exit));
    }
}

/// Handle one shutdown signal. `arm` runs only for the signal that begins
/// shutdown.
fn on_signal(coordinator: &ShutdownCoordinator, name: &str, arm: impl FnOnce()) -> bool {
    if coordinator.begin() {
        info!("Received {name}, shutting down");
        arm();
        true
    } else {
        warn!("Received {name} while already shutting down, ignoring");
        false
    }
}

/// Stop every live runner process: graceful signal, then kill after `grace`.
/// Returns how many processes were signalled. The registry is emptied.
pub async fn stop_all_executions(registry: &ExecutionRegistry, grace: Duration) -> usize {
    let live = registry.live_processes().await;
    let count = live.len();
    if count > 0 {
        info!("Stopping {count} running execution(s)");
    }
    let stops = live.into_iter().map(|(id, handle)| {
        let registry = registry.clone();
        async move {
            registry.begin_stop(&id).await;
            match handle.stop(grace).await {
                Some(info) => {
                    registry.mark_exited(&id, info).await;
                }
                None => warn!("Execution {id}: process did not exit, abandoning it"),
            }
        }
    });
    join_all(stops).await;
    let dropped = registry.clear().await;
    if dropped > 0 {
        info!("Dropped {dropped} execution(s)");
    }
    count
}

/// Tear down everything the process owns. Safe to call once shutdown began.
pub async fn shutdown(state: &AppState) {
    let grace = Duration::from_millis(state.config.runner.stop_grace_ms);
    let stopped = stop_all_executions(&state.registry, grace).await;
    let tunnels = state.tunnels.close_all().await;
    info!("Shutdown complete: {stopped} process(es) stopped, {tunnels} tunnel(s) closed");
}
