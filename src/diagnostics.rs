//! Environment checks for the UI: runner binary, prerequisites, installation,
//! version and installed collections.
//!
//! Everything here shells out to helper commands and turns their text output
//! into the typed report structs from [`crate::protocol`]. Failures are part
//! of the report, never a dropped request.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::RunnerConfig;
use crate::protocol::{
    BinaryStatus, Collection, CollectionReport, PrerequisiteCheck, PrerequisitesStatus,
    VersionReport,
};
use crate::runner::launch::{resolve_binary, ExecutionMode};
use crate::runner::process::{exec_command, ExecError};

/// Timeout for version checks and listings.
const CHECK_TIMEOUT_MS: u64 = 15_000;

/// Upper bound on a package installation.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Installs the runner and Ansible into the current Python environment.
pub const INSTALL_COMMAND: &str = "python3 -m pip install ansible-rulebook ansible";

/// Oldest Java major version the runner's rules engine accepts.
pub const MIN_JAVA_MAJOR: u32 = 17;

/// Errors from a diagnostic command.
#[derive(Debug)]
pub enum CheckError {
    /// The binary could not be found.
    NotFound(String),
    /// The command could not run (spawn failure, timeout).
    Exec(ExecError),
    /// The command ran and exited non-zero.
    Failed { exit_code: i32, output: String },
    /// The command's output could not be understood.
    Parse(String),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(name) => write!(f, "{name} not found"),
            Self::Exec(e) => write!(f, "{e}"),
            Self::Failed { exit_code, output } => {
                write!(f, "Command failed (exit {exit_code}): {}", output.trim())
            }
            Self::Parse(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CheckError {}

impl From<ExecError> for CheckError {
    fn from(e: ExecError) -> Self {
        Self::Exec(e)
    }
}

/// Quote `s` for `/bin/sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn path_var() -> Option<OsString> {
    std::env::var_os("PATH")
}

/// Run a command line and return its combined stdout/stderr on success.
async fn run_check(command: &str) -> Result<String, CheckError> {
    debug!("diagnostics: {command}");
    let result = exec_command(command, CHECK_TIMEOUT_MS).await?;
    debug!(
        "diagnostics: {command} exited {} after {}ms",
        result.exit_code, result.duration_ms
    );
    let output = format!("{}{}", result.stdout, result.stderr);
    if result.success() {
        Ok(output)
    } else {
        Err(CheckError::Failed {
            exit_code: result.exit_code,
            output,
        })
    }
}

/// Version number from the first line of a `--version` output.
///
/// Accepts `1.1.2`, `__version__ = '0.13.0'` and `ansible-rulebook [core 1.0.4]`.
pub fn parse_version_line(output: &str) -> Option<String> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    line.split(|c: char| c.is_whitespace() || matches!(c, '\'' | '"' | '=' | '[' | ']'))
        .find(|t| t.starts_with(|c: char| c.is_ascii_digit()) && t.contains('.'))
        .map(|t| {
            t.trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
                .to_string()
        })
}

/// Java major version from the first line of `java -version`.
///
/// `openjdk version "21.0.2"` → 21, `java version "1.8.0_402"` → 8,
/// `openjdk 17.0.9 2023-10-17` → 17.
pub fn parse_java_major(first_line: &str) -> Result<u32, CheckError> {
    let unparsable = || CheckError::Parse(format!("failed to parse java version output: {first_line}"));
    let version = match first_line.split('"').nth(1) {
        Some(quoted) => quoted,
        None => first_line
            .split_whitespace()
            .find(|t| t.starts_with(|c: char| c.is_ascii_digit()))
            .ok_or_else(unparsable)?,
    };
    let component = if let Some(legacy) = version.strip_prefix("1.") {
        legacy.split('.').next().unwrap_or_default()
    } else {
        version.split('.').next().unwrap_or_default()
    };
    let digits = component
        .find(|c: char| !c.is_ascii_digit())
        .map_or(component, |end| &component[..end]);
    digits.parse().map_err(|_| unparsable())
}

/// Parse `ansible-galaxy collection list` output. Duplicates across
/// collection paths keep their first occurrence.
pub fn parse_collection_list(output: &str) -> Vec<Collection> {
    let mut seen = HashSet::new();
    output
        .lines()
        .map(str::trim)
        .filter(|l| {
            !l.is_empty() && !l.starts_with('#') && !l.starts_with('-') && !l.starts_with("Collection")
        })
        .filter_map(|l| {
            let mut parts = l.split_whitespace();
            let name = parts.next()?;
            let version = parts.next()?;
            name.contains('.').then(|| Collection {
                name: name.to_string(),
                version: version.to_string(),
            })
        })
        .filter(|c| seen.insert(c.name.clone()))
        .collect()
}

/// Runner binary to inspect: the explicit path, else the configured default.
fn requested_binary<'a>(runner: &'a RunnerConfig, path: Option<&'a str>) -> &'a str {
    path.map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(&runner.binary)
}

/// `check_binary`: is the runner installed, and which version.
pub async fn check_binary(runner: &RunnerConfig, path: Option<&str>) -> BinaryStatus {
    let name = requested_binary(runner, path);
    let Some(resolved) = resolve_binary(name, path_var().as_deref()) else {
        return BinaryStatus {
            found: false,
            error: Some(CheckError::NotFound(name.to_string()).to_string()),
            ..BinaryStatus::default()
        };
    };
    let resolved = resolved.to_string_lossy().into_owned();
    match run_check(&format!("{} --version", shell_quote(&resolved))).await {
        Ok(output) => BinaryStatus {
            found: true,
            path: Some(resolved),
            version: parse_version_line(&output),
            error: None,
        },
        Err(e) => BinaryStatus {
            found: true,
            path: Some(resolved),
            version: None,
            error: Some(e.to_string()),
        },
    }
}

/// `get_ansible_version`: full `--version` output plus the parsed version.
pub async fn ansible_version(runner: &RunnerConfig, path: Option<&str>) -> VersionReport {
    let name = requested_binary(runner, path);
    let result = match resolve_binary(name, path_var().as_deref()) {
        Some(resolved) => {
            run_check(&format!(
                "{} --version",
                shell_quote(&resolved.to_string_lossy())
            ))
            .await
        }
        None => Err(CheckError::NotFound(name.to_string())),
    };
    match result {
        Ok(output) => VersionReport {
            success: true,
            version: parse_version_line(&output),
            full_version: Some(output.trim().to_string()),
            error: None,
        },
        Err(e) => VersionReport {
            success: false,
            error: Some(e.to_string()),
            ..VersionReport::default()
        },
    }
}

/// `get_collection_list`: collections visible to `ansible-galaxy`.
pub async fn collection_list() -> CollectionReport {
    if resolve_binary("ansible-galaxy", path_var().as_deref()).is_none() {
        return CollectionReport {
            success: false,
            collections: Vec::new(),
            error: Some(CheckError::NotFound("ansible-galaxy".to_string()).to_string()),
        };
    }
    match run_check("ansible-galaxy collection list").await {
        Ok(output) => CollectionReport {
            success: true,
            collections: parse_collection_list(&output),
            error: None,
        },
        Err(e) => CollectionReport {
            success: false,
            collections: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

fn check(name: &str, result: Result<String, String>) -> PrerequisiteCheck {
    let (ok, detail) = match result {
        Ok(detail) => (true, detail),
        Err(detail) => (false, detail),
    };
    PrerequisiteCheck {
        name: name.to_string(),
        ok,
        detail,
    }
}

async fn java_check() -> Result<String, String> {
    if resolve_binary("java", path_var().as_deref()).is_none() {
        return Err(format!("java not found (Java {MIN_JAVA_MAJOR}+ required)"));
    }
    // `java -version` writes to stderr.
    let output = run_check("java -version 2>&1").await.map_err(|e| e.to_string())?;
    let first = output.lines().next().unwrap_or_default();
    let major = parse_java_major(first).map_err(|e| e.to_string())?;
    if major >= MIN_JAVA_MAJOR {
        Ok(format!("Java {major}"))
    } else {
        Err(format!("Java {major} found, {MIN_JAVA_MAJOR}+ required"))
    }
}

/// `check_prerequisites` for one execution mode.
pub async fn check_prerequisites(
    runner: &RunnerConfig,
    mode: ExecutionMode,
    binary_path: Option<&str>,
    image: Option<&str>,
) -> PrerequisitesStatus {
    let path = path_var();
    let mut checks = Vec::new();
    match mode {
        ExecutionMode::Direct | ExecutionMode::Custom => {
            let binary = if mode == ExecutionMode::Custom {
                binary_path.map(str::trim).filter(|p| !p.is_empty())
            } else {
                Some(requested_binary(runner, binary_path))
            };
            checks.push(check(
                "ansible-rulebook",
                match binary {
                    Some(name) => resolve_binary(name, path.as_deref())
                        .map(|p| p.to_string_lossy().into_owned())
                        .ok_or_else(|| format!("{name} not found")),
                    None => Err("custom mode requires ansibleRulebookPath".to_string()),
                },
            ));
            checks.push(check("java", java_check().await));
            checks.push(check(
                "python3",
                resolve_binary("python3", path.as_deref())
                    .map(|p| p.to_string_lossy().into_owned())
                    .ok_or_else(|| "python3 not found".to_string()),
            ));
        }
        ExecutionMode::Container => {
            let runtime = &runner.container_runtime;
            checks.push(check(
                "container-runtime",
                resolve_binary(runtime, path.as_deref())
                    .map(|p| p.to_string_lossy().into_owned())
                    .ok_or_else(|| format!("{runtime} not found")),
            ));
            let image = image
                .map(str::trim)
                .filter(|i| !i.is_empty())
                .unwrap_or(&runner.container_image);
            checks.push(check(
                "container-image",
                if image.is_empty() {
                    Err("no container image configured".to_string())
                } else {
                    Ok(image.to_string())
                },
            ));
        }
    }
    PrerequisitesStatus {
        mode,
        ready: checks.iter().all(|c| c.ok),
        checks,
    }
}

/// Run [`INSTALL_COMMAND`], streaming each output line into `progress`.
pub async fn install(progress: &mpsc::Sender<String>) -> Result<(), CheckError> {
    install_with(INSTALL_COMMAND, progress).await
}

async fn install_with(command: &str, progress: &mpsc::Sender<String>) -> Result<(), CheckError> {
    info!("Installing: {command}");
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("exec 2>&1; {command}"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CheckError::Exec(ExecError::SpawnFailed(e.to_string())))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CheckError::Exec(ExecError::ProcessFailed("Failed to take stdout pipe".to_string())))?;

    let run = async {
        let mut lines = BufReader::new(stdout).lines();
        let mut tail = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            tail.clone_from(&line);
            let _ = progress.send(line).await;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| CheckError::Exec(ExecError::ProcessFailed(e.to_string())))?;
        if status.success() {
            Ok(())
        } else {
            Err(CheckError::Failed {
                exit_code: status.code().unwrap_or(-1),
                output: tail,
            })
        }
    };
    match tokio::time::timeout(INSTALL_TIMEOUT, run).await {
        Ok(result) => result,
        Err(_) => Err(CheckError::Exec(ExecError::Timeout)),
    }
}
