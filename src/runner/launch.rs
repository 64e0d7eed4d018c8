//! Turns an execution's configuration snapshot into a concrete command line
//! and starts it.
//!
//! Three modes are supported:
//!
//! - **direct** — the configured runner binary, resolved on `PATH`.
//! - **custom** — an explicit binary path supplied with the request.
//! - **container** — `<runtime> run --rm -i ... <image> ansible-rulebook ...`,
//!   with every environment override injected as `-e`, the working directory
//!   mounted read-write and the rulebook's webhook ports reachable from the host.
//!
//! Every mode ends with the worker flags that make the runner dial back into
//! this server: `--worker --id <execution id> --websocket-url <url>`.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::net::{Ipv4Addr, UdpSocket};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::args::{tokenize_cli_args, webhook_ports_from_source};
use super::process::{spawn_pgroup, ProcessHandle, ProcessOutput};
use crate::config::{RunnerConfig, ServerConfig};
use crate::executions::ExecutionConfig;
use crate::util::expand_tilde;

/// Environment variable the runner reads its collection search path from.
pub const COLLECTIONS_PATH_VAR: &str = "ANSIBLE_COLLECTIONS_PATH";

/// Binary name inside runner container images.
const CONTAINER_RUNNER_BINARY: &str = "ansible-rulebook";

/// How the runner process is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Direct,
    Custom,
    Container,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Custom => "custom",
            Self::Container => "container",
        }
    }
}

/// A fully resolved command, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    /// Merged into the inherited environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

/// Everything besides the execution's own snapshot that shapes a launch.
#[derive(Debug, Clone)]
pub struct LaunchContext<'a> {
    pub execution_id: &'a str,
    pub worker_url: String,
    pub runner: &'a RunnerConfig,
    /// Whether containers may use `--network host`.
    pub host_network: bool,
    /// Search path used to resolve bare binary names.
    pub path_var: Option<std::ffi::OsString>,
}

/// Why a runner could not be started. The message is captured verbatim on
/// the execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// Runner binary missing (bare name not on `PATH`, or path not a file).
    BinaryNotFound(String),
    /// Container runtime CLI missing.
    RuntimeMissing(String),
    /// The configuration snapshot cannot produce a command.
    InvalidConfig(String),
    /// The OS refused to start the process.
    Spawn(String),
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BinaryNotFound(name) => write!(f, "ansible-rulebook binary not found: {name}"),
            Self::RuntimeMissing(name) => write!(f, "Container runtime not found: {name}"),
            Self::InvalidConfig(msg) => write!(f, "Invalid execution configuration: {msg}"),
            Self::Spawn(msg) => write!(f, "Failed to start process: {msg}"),
        }
    }
}

impl std::error::Error for LaunchError {}

/// Whether the platform lets containers share the host network namespace.
/// Docker/Podman desktop VMs on macOS do not.
pub fn host_network_supported() -> bool {
    !cfg!(target_os = "macos")
}

/// Best-effort non-loopback IPv4 address of this host.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which
/// local address would route to the target.
pub fn detect_lan_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Websocket URL a runner should dial back into.
///
/// Containers without host networking cannot reach our loopback, so they get
/// a LAN address instead. `advertise_host` overrides both.
pub fn worker_url(
    server: &ServerConfig,
    token: Option<&str>,
    mode: ExecutionMode,
    host_network: bool,
) -> String {
    let host = match &server.advertise_host {
        Some(host) => host.clone(),
        None if mode == ExecutionMode::Container && !host_network => detect_lan_ipv4()
            .map_or_else(|| Ipv4Addr::LOCALHOST.to_string(), |ip| ip.to_string()),
        None => Ipv4Addr::LOCALHOST.to_string(),
    };
    let base = format!("ws://{host}:{}/api/ws", server.listen_port());
    let Some(token) = token else {
        return base;
    };
    match reqwest::Url::parse(&base) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("token", token);
            url.into()
        }
        Err(e) => {
            warn!("Cannot build worker URL from {base}: {e}");
            format!("{base}?token={token}")
        }
    }
}

/// Resolve a binary: paths (anything containing `/`) must name an existing
/// file; bare names are looked up on `path_var` and must be executable.
pub fn resolve_binary(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = PathBuf::from(expand_tilde(name).as_ref());
        return path.is_file().then_some(path);
    }
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Derive a collections path from the environment a binary lives in.
///
/// For `<env>/bin/ansible-rulebook`, looks for
/// `<env>/lib/<python>/site-packages/ansible_collections` and returns the
/// `site-packages` directory.
pub fn derive_collections_path(binary: &Path) -> Option<PathBuf> {
    let bin_dir = binary.parent()?;
    if bin_dir.file_name() != Some(OsStr::new("bin")) {
        return None;
    }
    let lib_dir = bin_dir.parent()?.join("lib");
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&lib_dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path().join("site-packages"))
        .filter(|site| site.join("ansible_collections").is_dir())
        .collect();
    candidates.sort();
    candidates.pop()
}

/// Flags shared by every mode.
fn worker_args(config: &ExecutionConfig, ctx: &LaunchContext<'_>) -> Vec<String> {
    let mut args = vec![
        "--worker".to_string(),
        "--id".to_string(),
        ctx.execution_id.to_string(),
        "--websocket-url".to_string(),
        ctx.worker_url.clone(),
    ];
    if let Some(secs) = config.heartbeat_secs.filter(|s| *s > 0) {
        args.push("--heartbeat".to_string());
        args.push(secs.to_string());
    }
    if let Some(extra) = &config.extra_cli_args {
        args.extend(tokenize_cli_args(extra));
    }
    args
}

/// Build the command for an execution without starting it.
pub fn build_plan(
    config: &ExecutionConfig,
    ctx: &LaunchContext<'_>,
) -> Result<LaunchPlan, LaunchError> {
    match config.mode {
        ExecutionMode::Direct | ExecutionMode::Custom => build_local_plan(config, ctx),
        ExecutionMode::Container => build_container_plan(config, ctx),
    }
}

fn build_local_plan(
    config: &ExecutionConfig,
    ctx: &LaunchContext<'_>,
) -> Result<LaunchPlan, LaunchError> {
    let requested = match (config.mode, config.binary_path.as_deref()) {
        (_, Some(path)) if !path.trim().is_empty() => path.trim(),
        (ExecutionMode::Custom, _) => {
            return Err(LaunchError::InvalidConfig(
                "custom mode requires ansibleRulebookPath".to_string(),
            ))
        }
        _ => ctx.runner.binary.as_str(),
    };
    let program = resolve_binary(requested, ctx.path_var.as_deref())
        .ok_or_else(|| LaunchError::BinaryNotFound(requested.to_string()))?;

    let mut env = config.env_vars.clone();
    if !env.contains_key(COLLECTIONS_PATH_VAR) {
        if let Some(path) = derive_collections_path(&program) {
            env.insert(
                COLLECTIONS_PATH_VAR.to_string(),
                path.to_string_lossy().into_owned(),
            );
        }
    }

    Ok(LaunchPlan {
        program: program.to_string_lossy().into_owned(),
        args: worker_args(config, ctx),
        env,
        working_dir: config
            .working_dir
            .as_deref()
            .map(|d| PathBuf::from(expand_tilde(d).as_ref())),
    })
}

fn build_container_plan(
    config: &ExecutionConfig,
    ctx: &LaunchContext<'_>,
) -> Result<LaunchPlan, LaunchError> {
    let runtime = &ctx.runner.container_runtime;
    let program = resolve_binary(runtime, ctx.path_var.as_deref())
        .ok_or_else(|| LaunchError::RuntimeMissing(runtime.clone()))?;

    let image = config
        .container_image
        .as_deref()
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .unwrap_or(&ctx.runner.container_image);

    let mut args: Vec<String> = ["run", "--rm", "-i"].iter().map(ToString::to_string).collect();

    if ctx.host_network {
        args.push("--network".to_string());
        args.push("host".to_string());
    } else {
        let ports = webhook_ports_from_source(&config.rulebook).unwrap_or_else(|e| {
            warn!("Execution {}: {e}; no ports published", ctx.execution_id);
            Default::default()
        });
        for port in ports {
            args.push("-p".to_string());
            args.push(format!("{port}:{port}"));
        }
    }

    for (key, value) in &config.env_vars {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    if let Some(dir) = config.working_dir.as_deref().filter(|d| !d.trim().is_empty()) {
        let workdir = &ctx.runner.container_workdir;
        args.push("-v".to_string());
        args.push(format!("{}:{workdir}:rw", expand_tilde(dir)));
        args.push("-w".to_string());
        args.push(workdir.clone());
    }

    args.push(image.to_string());
    args.push(CONTAINER_RUNNER_BINARY.to_string());
    args.extend(worker_args(config, ctx));

    Ok(LaunchPlan {
        program: program.to_string_lossy().into_owned(),
        args,
        env: BTreeMap::new(),
        working_dir: None,
    })
}

/// Build and start the runner for an execution.
pub fn launch(
    config: &ExecutionConfig,
    ctx: &LaunchContext<'_>,
) -> Result<(ProcessHandle, mpsc::Receiver<ProcessOutput>), LaunchError> {
    let plan = build_plan(config, ctx)?;
    info!(
        "Execution {}: launching {} ({} mode) {}",
        ctx.execution_id,
        plan.program,
        config.mode.as_str(),
        plan.args.join(" ")
    );
    let child =
        spawn_pgroup(&plan).map_err(|e| LaunchError::Spawn(format!("{}: {e}", plan.program)))?;
    ProcessHandle::start(&format!("Execution {}", ctx.execution_id), child)
        .map_err(LaunchError::Spawn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    /// A PATH containing a fake executable named `name`.
    fn fake_path(name: &str) -> (PathBuf, OsString) {
        let dir = std::env::temp_dir().join(format!("rulebookd-launch-{}", uuid::Uuid::new_v4()));
        let bin = dir.join("venv").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let exe = bin.join(name);
        std::fs::write(&exe, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, bin.into_os_string())
    }

    fn config(mode: ExecutionMode) -> ExecutionConfig {
        ExecutionConfig {
            rulebook: "- name: r\n  sources:\n    - ansible.eda.webhook: {port: 5000}\n    - ansible.eda.webhook: {port: 5001}\n".to_string(),
            mode,
            ..ExecutionConfig::default()
        }
    }

    fn ctx<'a>(runner: &'a RunnerConfig, path_var: &OsString, host_network: bool) -> LaunchContext<'a> {
        LaunchContext {
            execution_id: "exec-1",
            worker_url: "ws://127.0.0.1:5555/api/ws".to_string(),
            runner,
            host_network,
            path_var: Some(path_var.clone()),
        }
    }

    #[test]
    fn test_direct_plan_appends_worker_flags() {
        let (dir, path) = fake_path("ansible-rulebook");
        let runner = RunnerConfig::default();
        let mut cfg = config(ExecutionMode::Direct);
        cfg.heartbeat_secs = Some(15);
        cfg.extra_cli_args = Some(r#"--message "hello world" -v"#.to_string());
        cfg.env_vars.insert("FOO".to_string(), "bar".to_string());

        let plan = build_plan(&cfg, &ctx(&runner, &path, true)).unwrap();
        assert!(plan.program.ends_with("venv/bin/ansible-rulebook"));
        assert_eq!(
            plan.args,
            vec![
                "--worker",
                "--id",
                "exec-1",
                "--websocket-url",
                "ws://127.0.0.1:5555/api/ws",
                "--heartbeat",
                "15",
                "--message",
                "\"hello world\"",
                "-v",
            ]
        );
        assert_eq!(plan.env.get("FOO").map(String::as_str), Some("bar"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_direct_plan_missing_binary() {
        let (dir, path) = fake_path("something-else");
        let runner = RunnerConfig::default();
        let err = build_plan(&config(ExecutionMode::Direct), &ctx(&runner, &path, true)).unwrap_err();
        assert_eq!(err, LaunchError::BinaryNotFound("ansible-rulebook".to_string()));
        assert!(err.to_string().contains("not found"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_custom_mode_requires_path() {
        let (dir, path) = fake_path("ansible-rulebook");
        let runner = RunnerConfig::default();
        let err = build_plan(&config(ExecutionMode::Custom), &ctx(&runner, &path, true)).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidConfig(_)));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_collections_path_derived_from_venv() {
        let (dir, path) = fake_path("ansible-rulebook");
        let site = dir.join("venv/lib/python3.12/site-packages");
        std::fs::create_dir_all(site.join("ansible_collections")).unwrap();
        let runner = RunnerConfig::default();

        let plan = build_plan(&config(ExecutionMode::Direct), &ctx(&runner, &path, true)).unwrap();
        assert_eq!(
            plan.env.get(COLLECTIONS_PATH_VAR).map(PathBuf::from),
            Some(site.clone())
        );

        // An explicit override wins.
        let mut cfg = config(ExecutionMode::Direct);
        cfg.env_vars
            .insert(COLLECTIONS_PATH_VAR.to_string(), "/opt/collections".to_string());
        let plan = build_plan(&cfg, &ctx(&runner, &path, true)).unwrap();
        assert_eq!(
            plan.env.get(COLLECTIONS_PATH_VAR).map(String::as_str),
            Some("/opt/collections")
        );
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_container_plan_host_network() {
        let (dir, path) = fake_path("podman");
        let runner = RunnerConfig::default();
        let mut cfg = config(ExecutionMode::Container);
        cfg.env_vars.insert("A".to_string(), "1".to_string());
        cfg.env_vars.insert("B".to_string(), "two words".to_string());
        cfg.working_dir = Some("/srv/project".to_string());
        cfg.container_image = Some("example/eda:1".to_string());

        let plan = build_plan(&cfg, &ctx(&runner, &path, true)).unwrap();
        assert!(plan.program.ends_with("/podman"));
        assert!(plan.env.is_empty());
        assert_eq!(
            plan.args,
            vec![
                "run", "--rm", "-i", "--network", "host", "-e", "A=1", "-e", "B=two words",
                "-v", "/srv/project:/workspace:rw", "-w", "/workspace", "example/eda:1",
                "ansible-rulebook", "--worker", "--id", "exec-1", "--websocket-url",
                "ws://127.0.0.1:5555/api/ws",
            ]
        );
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_container_plan_publishes_webhook_ports() {
        let (dir, path) = fake_path("podman");
        let runner = RunnerConfig::default();
        let plan = build_plan(&config(ExecutionMode::Container), &ctx(&runner, &path, false)).unwrap();
        assert!(!plan.args.contains(&"--network".to_string()));
        let joined = plan.args.join(" ");
        assert!(joined.contains("-p 5000:5000 -p 5001:5001"));
        assert!(joined.contains("quay.io/ansible/ansible-rulebook:main ansible-rulebook --worker"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_container_runtime_missing() {
        let (dir, path) = fake_path("ansible-rulebook");
        let runner = RunnerConfig::default();
        let err = build_plan(&config(ExecutionMode::Container), &ctx(&runner, &path, true)).unwrap_err();
        assert_eq!(err, LaunchError::RuntimeMissing("podman".to_string()));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_worker_url() {
        let mut server = ServerConfig::default();
        assert_eq!(
            worker_url(&server, None, ExecutionMode::Direct, true),
            "ws://127.0.0.1:5555/api/ws"
        );
        server.advertise_host = Some("eda.local".to_string());
        assert_eq!(
            worker_url(&server, Some("t0k"), ExecutionMode::Container, false),
            "ws://eda.local:5555/api/ws?token=t0k"
        );
        assert_eq!(
            worker_url(&server, Some("a&b #%"), ExecutionMode::Direct, true),
            "ws://eda.local:5555/api/ws?token=a%26b+%23%25"
        );
    }

    #[test]
    fn test_execution_mode_wire_names() {
        let mode: ExecutionMode = serde_json::from_str("\"container\"").unwrap();
        assert_eq!(mode, ExecutionMode::Container);
        assert_eq!(serde_json::to_string(&ExecutionMode::Custom).unwrap(), "\"custom\"");
    }
}
