//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::clients::ClientTable;
use crate::config::Config;
use crate::executions::ExecutionRegistry;
use crate::lifecycle::ShutdownCoordinator;
use crate::tunnel::TunnelManager;

/// Shared application state for the rulebookd server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Every execution, keyed by id.
    pub registry: ExecutionRegistry,
    /// Every connected WebSocket peer, keyed by client id.
    pub clients: ClientTable,
    /// Webhook ingress servers, forwarding targets and public tunnels.
    pub tunnels: TunnelManager,
    pub shutdown: ShutdownCoordinator,
    /// Whether spawned containers may share the host network.
    pub host_network: bool,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = ExecutionRegistry::new(config.runner.event_log_capacity);
        let tunnels = TunnelManager::new(config.tunnel.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            clients: ClientTable::new(),
            tunnels,
            shutdown: ShutdownCoordinator::new(),
            host_network: crate::runner::launch::host_network_supported(),
        }
    }
}
