//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `RULEBOOKD_LISTEN`, `RULEBOOKD_TOKEN`,
//!    `RULEBOOKD_RUNNER_BINARY`, `RULEBOOKD_CONTAINER_RUNTIME`,
//!    `RULEBOOKD_TUNNEL_COMMAND`
//! 2. **Config file** — path via `--config <path>`, or `rulebookd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:5555"
//! advertise_host = "192.168.1.20"   # optional
//!
//! [auth]
//! token = "your-secret-token"       # optional
//!
//! [runner]
//! binary = "ansible-rulebook"
//! container_runtime = "podman"
//! container_image = "quay.io/ansible/ansible-rulebook:main"
//! container_workdir = "/workspace"
//! stop_grace_ms = 5000
//! event_log_capacity = 2000
//!
//! [janitor]
//! interval_secs = 300
//! stale_after_secs = 3600
//!
//! [shutdown]
//! force_exit_secs = 10
//!
//! [tunnel]
//! forward_timeout_ms = 10000
//! public_command = "ngrok"
//! public_args = ["http", "{port}", "--log", "stdout"]
//! public_timeout_secs = 20
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Main HTTP/WS listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:5555`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Host written into the websocket URL handed to spawned runners.
    /// When unset, loopback is used (or a detected LAN address for
    /// containers that cannot reach the host loopback).
    pub advertise_host: Option<String>,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared token for `/api/ws` and `/api/executions`. Override with
    /// `RULEBOOKD_TOKEN`. `None` accepts every connection.
    pub token: Option<String>,
}

/// How runner processes are launched and stopped.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Runner binary name or path for `direct` mode (default `ansible-rulebook`).
    #[serde(default = "default_runner_binary")]
    pub binary: String,
    /// Container runtime CLI for `container` mode (default `podman`).
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    /// Image used when a `container` execution does not name one.
    #[serde(default = "default_container_image")]
    pub container_image: String,
    /// In-container mount point for the execution's working directory.
    #[serde(default = "default_container_workdir")]
    pub container_workdir: String,
    /// Milliseconds between SIGTERM and SIGKILL when stopping (default 5000).
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Maximum runner events retained per execution (default 2000).
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
}

/// Stale execution sweep settings.
#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfig {
    /// Seconds between sweeps (default 300).
    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,
    /// Age after which a non-running execution is evicted (default 3600).
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

/// Process-wide shutdown settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Hard deadline for teardown before the process force-exits (default 10).
    #[serde(default = "default_force_exit_secs")]
    pub force_exit_secs: u64,
}

/// Webhook ingress, forwarding and public tunnel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Upper bound on a forwarded request (default 10 000 ms).
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    /// Command that provisions a public tunnel (e.g. `ngrok`). Public
    /// tunnels are unavailable when unset.
    pub public_command: Option<String>,
    /// Arguments for `public_command`; `{port}` is replaced with the local port.
    #[serde(default = "default_public_args")]
    pub public_args: Vec<String>,
    /// Seconds to wait for the provider to print its public URL (default 20).
    #[serde(default = "default_public_timeout")]
    pub public_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:5555".to_string()
}
fn default_runner_binary() -> String {
    "ansible-rulebook".to_string()
}
fn default_container_runtime() -> String {
    "podman".to_string()
}
fn default_container_image() -> String {
    "quay.io/ansible/ansible-rulebook:main".to_string()
}
fn default_container_workdir() -> String {
    "/workspace".to_string()
}
fn default_stop_grace_ms() -> u64 {
    5000
}
fn default_event_log_capacity() -> usize {
    2000
}
fn default_janitor_interval() -> u64 {
    300
}
fn default_stale_after() -> u64 {
    60 * 60
}
fn default_force_exit_secs() -> u64 {
    10
}
fn default_forward_timeout_ms() -> u64 {
    10_000
}
fn default_public_args() -> Vec<String> {
    ["http", "{port}", "--log", "stdout"]
        .iter()
        .map(ToString::to_string)
        .collect()
}
fn default_public_timeout() -> u64 {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            advertise_host: None,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            binary: default_runner_binary(),
            container_runtime: default_container_runtime(),
            container_image: default_container_image(),
            container_workdir: default_container_workdir(),
            stop_grace_ms: default_stop_grace_ms(),
            event_log_capacity: default_event_log_capacity(),
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_janitor_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            force_exit_secs: default_force_exit_secs(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            forward_timeout_ms: default_forward_timeout_ms(),
            public_command: None,
            public_args: default_public_args(),
            public_timeout_secs: default_public_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Port component of `listen`, used to build the worker websocket URL.
    pub fn listen_port(&self) -> u16 {
        self.listen
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5555)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `rulebookd.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("rulebookd.toml").exists() {
            let content =
                std::fs::read_to_string("rulebookd.toml").expect("Failed to read rulebookd.toml");
            toml::from_str(&content).expect("Failed to parse rulebookd.toml")
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("RULEBOOKD_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(token) = lookup("RULEBOOKD_TOKEN") {
            self.auth.token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(binary) = lookup("RULEBOOKD_RUNNER_BINARY") {
            self.runner.binary = binary;
        }
        if let Some(runtime) = lookup("RULEBOOKD_CONTAINER_RUNTIME") {
            self.runner.container_runtime = runtime;
        }
        if let Some(cmd) = lookup("RULEBOOKD_TUNNEL_COMMAND") {
            self.tunnel.public_command = Some(cmd).filter(|c| !c.is_empty());
        }
    }
}
