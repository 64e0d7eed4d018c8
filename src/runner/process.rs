//! Low-level process spawning, process-group signals and output capture.
//!
//! Runner processes are spawned as process-group leaders (`setpgid(0, 0)`)
//! so that termination reaches every descendant, including sub-processes the
//! runner wraps (a JVM, a container runtime's helper, ...). A started process
//! is represented by a [`ProcessHandle`] plus a channel of [`ProcessOutput`]
//! chunks; the handle is cheap to clone and can be awaited from any task.
//!
//! One-shot helper commands (diagnostics) go through [`exec_command`].

use std::fmt::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::launch::LaunchPlan;

/// Max output size per stream for [`exec_command`] (1 MB).
const MAX_EXEC_OUTPUT: usize = 1024 * 1024;

/// Which stdio channel produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A chunk of bytes read from the runner's stdout or stderr.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// How a process ended. Either field may be absent: `code` is `None` when the
/// process was killed by a signal, `signal` is `None` on a normal exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Signals used to stop a runner's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KillSignal {
    /// Graceful request (SIGTERM), the default.
    #[default]
    Terminate,
    /// Immediate kill (SIGKILL).
    Kill,
}

impl KillSignal {
    /// The `kill(1)`-style flag for this signal.
    pub fn flag(self) -> &'static str {
        match self {
            Self::Terminate => "-TERM",
            Self::Kill => "-KILL",
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// A signal addressed to an entire process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSignal {
    pub pgid: u32,
    pub signal: KillSignal,
}

impl GroupSignal {
    pub fn new(pgid: u32, signal: KillSignal) -> Self {
        Self { pgid, signal }
    }

    /// The `kill(2)` target: the negated group id, which addresses every
    /// process in the group.
    #[allow(clippy::cast_possible_wrap)]
    pub fn target(&self) -> i32 {
        -(self.pgid as i32)
    }

    /// Equivalent `kill` argv, for logs.
    pub fn command(&self) -> Vec<String> {
        vec![
            "kill".to_string(),
            self.signal.flag().to_string(),
            "--".to_string(),
            self.target().to_string(),
        ]
    }

    /// Deliver the signal.
    pub fn send(&self) -> Result<(), String> {
        if self.pgid == 0 {
            return Err("No process group to signal".to_string());
        }
        // SAFETY: kill(2) has no memory-safety preconditions.
        let ret = unsafe { libc::kill(self.target(), self.signal.raw()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(format!(
                "{} failed: {}",
                self.command().join(" "),
                std::io::Error::last_os_error()
            ))
        }
    }
}

/// Spawn a launch plan in its own process group with piped stdout/stderr.
///
/// The child calls `setpgid(0, 0)` via `pre_exec`, making its pid the group
/// id. Environment overrides are merged into the inherited environment.
pub fn spawn_pgroup(plan: &LaunchPlan) -> std::io::Result<Child> {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .envs(&plan.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &plan.working_dir {
        cmd.current_dir(dir);
    }
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}

/// Handle to a running runner process.
///
/// Cloneable: every clone observes the same exit notification.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Equals `pid`: the runner is its group's leader.
    pub pgid: u32,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// Take ownership of a spawned child: start one reader task per stdio
    /// pipe and an exit watcher. Output chunks arrive on the returned channel,
    /// which closes once both pipes reach EOF.
    pub fn start(
        label: &str,
        mut child: Child,
    ) -> Result<(Self, mpsc::Receiver<ProcessOutput>), String> {
        let pid = child.id().ok_or("Process exited before it could be tracked")?;
        let stdout = child.stdout.take().ok_or("Failed to take stdout pipe")?;
        let stderr = child.stderr.take().ok_or("Failed to take stderr pipe")?;

        let (out_tx, out_rx) = mpsc::channel::<ProcessOutput>(256);
        tokio::spawn(pump(
            format!("{label} stdout"),
            stdout,
            OutputStream::Stdout,
            out_tx.clone(),
        ));
        tokio::spawn(pump(
            format!("{label} stderr"),
            stderr,
            OutputStream::Stderr,
            out_tx,
        ));

        let (exit_tx, exit_rx) = watch::channel(None);
        let label = label.to_string();
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => {
                    let info = ExitInfo::from(status);
                    info!(
                        "{label} (pid {pid}) exited: code={:?} signal={:?}",
                        info.code, info.signal
                    );
                    info
                }
                Err(e) => {
                    error!("{label} (pid {pid}) wait error: {e}");
                    ExitInfo::default()
                }
            };
            let _ = exit_tx.send(Some(info));
        });

        Ok((
            Self {
                pid,
                pgid: pid,
                exit_rx,
            },
            out_rx,
        ))
    }

    /// Exit information, if the process has already ended.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let exited = rx
            .wait_for(Option::is_some)
            .await
            .map(|info| (*info).unwrap_or_default());
        // Watcher task gone without reporting: treat as exited-unknown.
        exited.unwrap_or_default()
    }

    /// Wait for exit, giving up after `limit`.
    pub async fn wait_timeout(&self, limit: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    /// Signal the whole process group.
    pub fn signal(&self, signal: KillSignal) -> Result<(), String> {
        GroupSignal::new(self.pgid, signal).send()
    }

    /// Stop the process group: SIGTERM, wait up to `grace`, then SIGKILL and
    /// wait up to `grace` again. Returns `None` if the process still has not
    /// reported an exit.
    pub async fn stop(&self, grace: Duration) -> Option<ExitInfo> {
        if let Some(info) = self.exit_info() {
            return Some(info);
        }
        if let Err(e) = self.signal(KillSignal::Terminate) {
            debug!("pid {}: {e}", self.pid);
        }
        if let Some(info) = self.wait_timeout(grace).await {
            return Some(info);
        }
        info!("pid {} still running after {grace:?}, sending SIGKILL", self.pid);
        if let Err(e) = self.signal(KillSignal::Kill) {
            debug!("pid {}: {e}", self.pid);
        }
        self.wait_timeout(grace).await
    }
}

/// Length of a trailing UTF-8 sequence that is cut short, or 0 when `bytes`
/// ends on a character boundary. Invalid bytes are not held back.
pub fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

/// Read a pipe in chunks and forward each chunk. Ends on EOF, read error, or
/// when nobody is listening anymore.
///
/// Chunks never split a UTF-8 character: an incomplete trailing sequence is
/// carried over into the next read.
async fn pump(
    label: String,
    mut reader: impl tokio::io::AsyncRead + Unpin,
    stream: OutputStream,
    tx: mpsc::Sender<ProcessOutput>,
) {
    let mut tmp = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&tmp[..n]);
                let carry = incomplete_utf8_tail(&pending);
                if carry == pending.len() {
                    continue;
                }
                let tail = pending.split_off(pending.len() - carry);
                let chunk = ProcessOutput {
                    stream,
                    data: std::mem::replace(&mut pending, tail),
                };
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(ProcessOutput { stream, data: pending }).await;
    }
    debug!("{label} closed");
}

/// Execute a one-shot command via `sh -c "<command>"` and capture output.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock) and each
/// capped at [`MAX_EXEC_OUTPUT`] bytes. The entire operation is wrapped in a
/// `tokio::time::timeout`.
pub async fn exec_command(command: &str, timeout_ms: u64) -> Result<ExecResult, ExecError> {
    let start = std::time::Instant::now();

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

    let timeout = Duration::from_millis(timeout_ms);
    match Box::pin(tokio::time::timeout(timeout, async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_EXEC_OUTPUT),
            read_capped(&mut stderr, MAX_EXEC_OUTPUT),
        );
        drop(stdout);
        drop(stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(e.to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;

        Ok::<_, ExecError>(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_data,
            stderr: stderr_data,
            duration_ms,
        })
    }))
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout),
    }
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest. Keeps draining past the cap so the child never blocks on a full pipe.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(
            s,
            "\n[truncated: {total_read} bytes total, showing first {max_bytes}]"
        );
    }
    s
}

/// Successful result of [`exec_command`].
#[derive(Debug)]
pub struct ExecResult {
    /// Process exit code, or `-1` if the code was unavailable.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors that can occur during [`exec_command`].
#[derive(Debug)]
pub enum ExecError {
    /// The shell could not be started.
    SpawnFailed(String),
    /// The child process started but `wait()` failed.
    ProcessFailed(String),
    /// The command exceeded its timeout and was killed.
    Timeout,
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::SpawnFailed(e) => write!(f, "Failed to spawn process: {e}"),
            ExecError::ProcessFailed(e) => write!(f, "Process error: {e}"),
            ExecError::Timeout => write!(f, "Command timed out"),
        }
    }
}

impl std::error::Error for ExecError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sh_plan(script: &str) -> LaunchPlan {
        LaunchPlan {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    #[test]
    fn test_group_signal_flags() {
        let default = GroupSignal::new(4242, KillSignal::default());
        assert_eq!(default.signal.flag(), "-TERM");
        assert_eq!(default.signal.raw(), libc::SIGTERM);

        let kill = GroupSignal::new(4242, KillSignal::Kill);
        assert_eq!(kill.signal.flag(), "-KILL");
        assert_eq!(kill.signal.raw(), libc::SIGKILL);
    }

    #[test]
    fn test_group_signal_targets_whole_group() {
        let sig = GroupSignal::new(4242, KillSignal::Kill);
        assert_eq!(sig.target(), -4242);
        assert_eq!(sig.command(), vec!["kill", "-KILL", "--", "-4242"]);
    }

    #[test]
    fn test_group_signal_refuses_pgid_zero() {
        assert!(GroupSignal::new(0, KillSignal::Terminate).send().is_err());
    }

    #[tokio::test]
    async fn test_output_and_exit_code() {
        let child = spawn_pgroup(&sh_plan("echo out; echo err >&2; exit 3")).unwrap();
        let (handle, mut rx) = ProcessHandle::start("test", child).unwrap();
        assert_eq!(handle.pid, handle.pgid);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = rx.recv().await {
            match chunk.stream {
                OutputStream::Stdout => stdout.extend(chunk.data),
                OutputStream::Stderr => stderr.extend(chunk.data),
            }
        }
        assert_eq!(String::from_utf8_lossy(&stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&stderr), "err\n");

        let info = handle.wait().await;
        assert_eq!(info.code, Some(3));
        assert_eq!(info.signal, None);
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_stop_terminates_group_gracefully() {
        let child = spawn_pgroup(&sh_plan("sleep 30 & sleep 30")).unwrap();
        let (handle, _rx) = ProcessHandle::start("test", child).unwrap();
        let info = handle.stop(Duration::from_secs(3)).await.unwrap();
        assert_eq!(info.signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let child = spawn_pgroup(&sh_plan("trap '' TERM; sleep 30")).unwrap();
        let (handle, _rx) = ProcessHandle::start("test", child).unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let info = handle.stop(Duration::from_millis(300)).await.unwrap();
        assert_eq!(info.signal, Some(libc::SIGKILL));
    }

    #[test]
    fn test_incomplete_utf8_tail() {
        assert_eq!(incomplete_utf8_tail(b""), 0);
        assert_eq!(incomplete_utf8_tail(b"abc"), 0);
        assert_eq!(incomplete_utf8_tail("caf\u{e9}".as_bytes()), 0);
        assert_eq!(incomplete_utf8_tail(b"caf\xc3"), 1);
        assert_eq!(incomplete_utf8_tail(b"x\xe2\x82"), 2);
        assert_eq!(incomplete_utf8_tail(b"x\xf0\x9f\x98"), 3);
        assert_eq!(incomplete_utf8_tail("\u{1f600}".as_bytes()), 0);
        // A stray continuation byte is passed through, not held back.
        assert_eq!(incomplete_utf8_tail(b"a\x80"), 0);
    }

    #[tokio::test]
    async fn test_pump_keeps_characters_whole() {
        let mut input = vec![b'a'; 4095];
        input.extend_from_slice("\u{e9}\u{1f600} done\n".as_bytes());
        let (tx, mut rx) = mpsc::channel(16);
        pump("test".to_string(), &input[..], OutputStream::Stdout, tx).await;

        let mut joined = Vec::new();
        while let Some(chunk) = rx.recv().await {
            assert!(std::str::from_utf8(&chunk.data).is_ok());
            joined.extend_from_slice(&chunk.data);
        }
        assert_eq!(joined, input);
    }

    #[tokio::test]
    async fn test_exec_command_captures_output() {
        let result = exec_command("echo hello; exit 2", 5000).await.unwrap();
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, 2);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_exec_command_timeout() {
        let err = exec_command("sleep 5", 100).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout));
    }
}
