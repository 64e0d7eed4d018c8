#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # rulebookd
//!
//! Execution coordinator for ansible-rulebook.
//!
//! rulebookd spawns rulebook runners on behalf of browser UIs, routes the
//! WebSocket traffic between each runner and the UI that owns it, and runs
//! per-port webhook receivers that can forward to a local service or be
//! exposed through a public tunnel.
//!
//! ## Subcommands
//!
//! - `rulebookd serve` (default) — run the HTTP/WS server
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! routes/          — router assembly, /api/health, /api/executions
//! ws/
//!   mod.rs         — WebSocket upgrade, connection loop, webhook fan-out
//!   handlers.rs    — per-frame handlers
//! executions/      — ExecutionRegistry, state machine, event ring buffer
//! runner/          — launch plans, process groups, escalating stop
//! clients.rs       — ClientTable (ui/worker roles)
//! tunnel/
//!   mod.rs         — TunnelManager
//!   ingress.rs     — per-port HTTP receiver and forwarder
//!   public.rs      — external public tunnel provider
//! diagnostics.rs   — check_binary, prerequisites, install, collections
//! lifecycle.rs     — janitor, signal handling, teardown
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use rulebookd::{lifecycle, routes, AppState, Config};

/// Execution coordinator for ansible-rulebook.
#[derive(Parser)]
#[command(name = "rulebookd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file (when no subcommand is given).
    #[arg(long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config.or(cli.config),
        None => cli.config,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("rulebookd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.auth.token.is_none() {
        warn!("No auth token configured, the API is open to anyone who can reach it");
    }
    if config.tunnel.public_command.is_none() {
        info!("No public tunnel provider configured, public tunnels are disabled");
    }

    let state = AppState::new(config);
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    let janitor = lifecycle::spawn_janitor(
        state.registry.clone(),
        &state.config.janitor,
        state.shutdown.token(),
    );
    let signals = tokio::spawn(lifecycle::watch_signals(
        state.shutdown.clone(),
        Duration::from_secs(state.config.shutdown.force_exit_secs),
    ));

    let coordinator = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { coordinator.cancelled().await })
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    state.shutdown.begin();
    janitor.abort();
    lifecycle::shutdown(&state).await;
    signals.abort();
    info!("Goodbye");
}
