//! A single managed run of the rulebook runner.
//!
//! ## State machine
//!
//! ```text
//!   waiting ──► running ──► stopped | exited | error
//!      └──────────────────► stopped | exited | error
//! ```
//!
//! `stopped`, `exited` and `error` are terminal: no method moves an execution
//! out of them. Exit codes are still recorded after a stop so the final
//! process outcome is never lost.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use super::events::EventLog;
use crate::runner::launch::ExecutionMode;
use crate::runner::process::{ExitInfo, ProcessHandle};
use crate::util::now_ms;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Waiting,
    Running,
    Stopped,
    Exited,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exited | Self::Error)
    }
}

/// Configuration captured when the execution is created. Never mutated;
/// re-running means creating a new execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Rulebook source text (YAML).
    pub rulebook: String,
    /// Extra variables handed to the runner on dial-back.
    pub extra_vars: Option<Value>,
    /// Environment overrides merged into the runner's environment.
    pub env_vars: BTreeMap<String, String>,
    pub mode: ExecutionMode,
    pub container_image: Option<String>,
    /// Runner binary path (`custom` mode, or an override in `direct` mode).
    pub binary_path: Option<String>,
    pub working_dir: Option<String>,
    pub heartbeat_secs: Option<u64>,
    /// Free-form extra CLI arguments, tokenized at launch.
    pub extra_cli_args: Option<String>,
}

/// Registry-owned record of one execution.
#[derive(Debug)]
pub struct Execution {
    pub id: String,
    pub config: Arc<ExecutionConfig>,
    pub status: ExecutionStatus,
    /// UI client that owns the execution and receives its events.
    pub owner: Option<String>,
    /// Present only while an OS process is attached.
    pub process: Option<ProcessHandle>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub last_error: Option<String>,
    pub worker_connected: bool,
    pub worker_client: Option<String>,
    /// Unix ms of the last heartbeat (or session stats) from the worker.
    pub last_heartbeat: Option<u64>,
    /// Monotonic creation time, used for staleness.
    pub created_at: Instant,
    /// Unix ms creation time, reported to clients.
    pub created_at_ms: u64,
    pub events: EventLog,
}

/// Serializable view of an execution (no process handle, no events).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub mode: ExecutionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub worker_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<u64>,
    pub created_at: u64,
    pub event_count: u64,
}

impl Execution {
    pub fn new(id: String, config: ExecutionConfig, owner: Option<String>, capacity: usize) -> Self {
        Self {
            id,
            config: Arc::new(config),
            status: ExecutionStatus::Waiting,
            owner,
            process: None,
            exit_code: None,
            exit_signal: None,
            last_error: None,
            worker_connected: false,
            worker_client: None,
            last_heartbeat: None,
            created_at: Instant::now(),
            created_at_ms: now_ms(),
            events: EventLog::new(capacity),
        }
    }

    /// `waiting` → `running`. Returns whether the status changed.
    pub fn mark_running(&mut self) -> bool {
        if self.status == ExecutionStatus::Waiting {
            self.status = ExecutionStatus::Running;
            true
        } else {
            false
        }
    }

    /// Any non-terminal status → `stopped`. Returns whether the status changed.
    pub fn mark_stopped(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ExecutionStatus::Stopped;
        true
    }

    /// Record the process outcome; moves a live execution to `exited`.
    pub fn mark_exited(&mut self, info: ExitInfo) -> bool {
        self.exit_code = self.exit_code.or(info.code);
        self.exit_signal = self.exit_signal.or(info.signal);
        self.process = None;
        self.worker_connected = false;
        if self.status.is_terminal() {
            return false;
        }
        self.status = ExecutionStatus::Exited;
        true
    }

    /// Launch or runtime failure; the message is kept verbatim.
    pub fn mark_error(&mut self, message: String) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ExecutionStatus::Error;
        self.last_error = Some(message);
        true
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Some(now_ms());
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.id.clone(),
            status: self.status,
            mode: self.config.mode,
            owner: self.owner.clone(),
            pid: self.process.as_ref().map(|p| p.pid),
            exit_code: self.exit_code,
            signal: self.exit_signal,
            error: self.last_error.clone(),
            worker_connected: self.worker_connected,
            last_heartbeat: self.last_heartbeat,
            created_at: self.created_at_ms,
            event_count: self.events.total(),
        }
    }
}
