//! Execution registry: the authoritative table of runner executions.
//!
//! [`ExecutionRegistry`] exclusively owns every [`Execution`]. Other components
//! hold only ids and clones of process handles; anything they learn from the
//! registry may be stale after their next `.await`, so every mutating method
//! re-checks the execution's status under the write lock before acting.
//!
//! Executions leave the table in exactly three ways: an acknowledged stop
//! ([`ExecutionRegistry::remove`]), the janitor's staleness sweep
//! ([`ExecutionRegistry::sweep_stale`]), or process shutdown. Client
//! disconnects never remove them.

pub mod events;
pub mod execution;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::runner::process::{ExitInfo, ProcessHandle};
use crate::util::short_id;
use events::EventEntry;
pub use execution::{Execution, ExecutionConfig, ExecutionStatus, ExecutionSummary};

/// Cloneable handle to the shared execution table.
#[derive(Clone)]
pub struct ExecutionRegistry {
    executions: Arc<RwLock<HashMap<String, Execution>>>,
    event_capacity: usize,
}

/// Outcome of [`ExecutionRegistry::begin_stop`].
#[derive(Debug)]
pub enum StopRequest {
    NotFound,
    /// Already terminal; stopping is a successful no-op.
    NotRunning(ExecutionStatus),
    /// Marked `stopped`; the process (if one was attached) must be terminated.
    Stopping(Option<ProcessHandle>),
}

/// What a worker needs once it has been bound to its execution.
#[derive(Debug, Clone)]
pub struct WorkerBinding {
    pub owner: Option<String>,
    pub config: Arc<ExecutionConfig>,
}

/// Late-join replay returned by [`ExecutionRegistry::events_since`].
#[derive(Debug)]
pub struct Replay {
    pub status: ExecutionStatus,
    pub events: Vec<EventEntry>,
    pub dropped: u64,
}

impl ExecutionRegistry {
    /// `event_capacity` bounds each execution's event log.
    pub fn new(event_capacity: usize) -> Self {
        Self {
            executions: Arc::new(RwLock::new(HashMap::new())),
            event_capacity,
        }
    }

    /// Create a `waiting` execution and return its id.
    pub async fn create(&self, config: ExecutionConfig, owner: Option<&str>) -> String {
        let id = Uuid::new_v4().to_string();
        let execution = Execution::new(
            id.clone(),
            config,
            owner.map(ToString::to_string),
            self.event_capacity,
        );
        let mut executions = self.executions.write().await;
        info!(
            "Execution {id} created ({} mode), total: {}",
            execution.config.mode.as_str(),
            executions.len() + 1
        );
        executions.insert(id.clone(), execution);
        id
    }

    pub async fn summary(&self, id: &str) -> Option<ExecutionSummary> {
        self.executions.read().await.get(id).map(Execution::summary)
    }

    pub async fn config(&self, id: &str) -> Option<Arc<ExecutionConfig>> {
        self.executions
            .read()
            .await
            .get(id)
            .map(|e| Arc::clone(&e.config))
    }

    pub async fn status(&self, id: &str) -> Option<ExecutionStatus> {
        self.executions.read().await.get(id).map(|e| e.status)
    }

    pub async fn owner(&self, id: &str) -> Option<String> {
        self.executions
            .read()
            .await
            .get(id)
            .and_then(|e| e.owner.clone())
    }

    /// Hand ownership to another UI client (late-join attach).
    pub async fn set_owner(&self, id: &str, client_id: &str) -> bool {
        let mut executions = self.executions.write().await;
        match executions.get_mut(id) {
            Some(exec) => {
                exec.owner = Some(client_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Attach a freshly spawned process and mark the execution `running`.
    ///
    /// Returns `false` when the execution was stopped or evicted while the
    /// launch was in flight; the caller then owns terminating the process.
    pub async fn attach_process(&self, id: &str, handle: ProcessHandle) -> bool {
        let mut executions = self.executions.write().await;
        match executions.get_mut(id) {
            Some(exec) if !exec.status.is_terminal() => {
                exec.process = Some(handle);
                exec.mark_running();
                true
            }
            _ => false,
        }
    }

    /// Record a process exit. Returns the execution's owner when it is still
    /// tracked.
    pub async fn mark_exited(&self, id: &str, info: ExitInfo) -> Option<Option<String>> {
        let mut executions = self.executions.write().await;
        let exec = executions.get_mut(id)?;
        if exec.mark_exited(info) {
            info!(
                "Execution {id} exited (code={:?}, signal={:?})",
                info.code, info.signal
            );
        }
        Some(exec.owner.clone())
    }

    /// Record a launch/runtime failure. Returns the owner when still tracked.
    pub async fn mark_error(&self, id: &str, message: String) -> Option<Option<String>> {
        let mut executions = self.executions.write().await;
        let exec = executions.get_mut(id)?;
        if exec.mark_error(message) {
            info!("Execution {id} failed: {}", exec.last_error.as_deref().unwrap_or(""));
        }
        Some(exec.owner.clone())
    }

    /// Start stopping an execution: a live one is marked `stopped` at once
    /// and its process handle returned for termination.
    pub async fn begin_stop(&self, id: &str) -> StopRequest {
        let mut executions = self.executions.write().await;
        let Some(exec) = executions.get_mut(id) else {
            return StopRequest::NotFound;
        };
        if !exec.mark_stopped() {
            return StopRequest::NotRunning(exec.status);
        }
        info!("Execution {id} stopping");
        StopRequest::Stopping(exec.process.clone())
    }

    /// Bind a worker client that dialed back. Fails for unknown or terminal
    /// executions.
    pub async fn bind_worker(&self, id: &str, client_id: &str) -> Option<WorkerBinding> {
        let mut executions = self.executions.write().await;
        let exec = executions.get_mut(id)?;
        if exec.status.is_terminal() {
            return None;
        }
        exec.worker_connected = true;
        exec.worker_client = Some(client_id.to_string());
        exec.mark_running();
        exec.touch_heartbeat();
        info!(
            "Execution {id}: worker {} connected",
            short_id(client_id)
        );
        Some(WorkerBinding {
            owner: exec.owner.clone(),
            config: Arc::clone(&exec.config),
        })
    }

    /// Clear the worker flag when that worker's connection goes away. The
    /// execution itself stays.
    pub async fn release_worker(&self, id: &str, client_id: &str) {
        let mut executions = self.executions.write().await;
        if let Some(exec) = executions.get_mut(id) {
            if exec.worker_client.as_deref() == Some(client_id) {
                exec.worker_connected = false;
                exec.worker_client = None;
                info!("Execution {id}: worker disconnected");
            }
        }
    }

    pub async fn touch_heartbeat(&self, id: &str) -> bool {
        let mut executions = self.executions.write().await;
        match executions.get_mut(id) {
            Some(exec) => {
                exec.touch_heartbeat();
                true
            }
            None => false,
        }
    }

    /// Append a runner event. Returns the owner when the execution exists.
    pub async fn record_event(&self, id: &str, event: Value) -> Option<Option<String>> {
        let mut executions = self.executions.write().await;
        let exec = executions.get_mut(id)?;
        exec.events.push(event);
        Some(exec.owner.clone())
    }

    pub async fn events_since(&self, id: &str, since: u64) -> Option<Replay> {
        let executions = self.executions.read().await;
        let exec = executions.get(id)?;
        let (events, dropped) = exec.events.read_since(since);
        Some(Replay {
            status: exec.status,
            events,
            dropped,
        })
    }

    pub async fn remove(&self, id: &str) -> Option<Execution> {
        let mut executions = self.executions.write().await;
        let removed = executions.remove(id);
        if removed.is_some() {
            info!("Execution {id} removed, remaining: {}", executions.len());
        }
        removed
    }

    pub async fn list(&self) -> Vec<ExecutionSummary> {
        let executions = self.executions.read().await;
        let mut items: Vec<ExecutionSummary> = executions.values().map(Execution::summary).collect();
        items.sort_by_key(|s| s.created_at);
        items
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }

    /// Evict every execution that is not `running` and was created more than
    /// `max_age` before `now`. Running executions are never touched.
    pub async fn sweep_stale(&self, now: Instant, max_age: Duration) -> Vec<String> {
        let mut executions = self.executions.write().await;
        let stale: Vec<String> = executions
            .values()
            .filter(|e| {
                e.status != ExecutionStatus::Running
                    && now.saturating_duration_since(e.created_at) > max_age
            })
            .map(|e| e.id.clone())
            .collect();
        for id in &stale {
            executions.remove(id);
            info!("Execution {id} evicted (stale)");
        }
        stale
    }

    /// Executions whose process has not exited yet.
    pub async fn live_processes(&self) -> Vec<(String, ProcessHandle)> {
        self.executions
            .read()
            .await
            .values()
            .filter_map(|e| {
                e.process
                    .as_ref()
                    .filter(|p| !p.has_exited())
                    .map(|p| (e.id.clone(), p.clone()))
            })
            .collect()
    }

    /// Remove everything (shutdown). Returns the number of executions dropped.
    pub async fn clear(&self) -> usize {
        let mut executions = self.executions.write().await;
        let count = executions.len();
        executions.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::launch::ExecutionMode;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sample_config() -> ExecutionConfig {
        ExecutionConfig {
            rulebook: "- name: demo\n  hosts: all\n  sources: []\n".to_string(),
            extra_vars: Some(json!({"env": "dev"})),
            env_vars: BTreeMap::from([("TOKEN".to_string(), "abc".to_string())]),
            mode: ExecutionMode::Container,
            container_image: Some("example/eda:1".to_string()),
            binary_path: None,
            working_dir: Some("/srv".to_string()),
            heartbeat_secs: Some(10),
            extra_cli_args: Some("-v".to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_is_waiting_with_verbatim_config() {
        let registry = ExecutionRegistry::new(100);
        let a = registry.create(sample_config(), Some("ui-1")).await;
        let b = registry.create(sample_config(), Some("ui-1")).await;
        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);

        assert_eq!(registry.status(&a).await, Some(ExecutionStatus::Waiting));
        assert_eq!(*registry.config(&a).await.unwrap(), sample_config());
        assert_eq!(registry.owner(&a).await.as_deref(), Some("ui-1"));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let registry = ExecutionRegistry::new(100);
        let id = registry.create(sample_config(), None).await;

        assert!(matches!(
            registry.begin_stop(&id).await,
            StopRequest::Stopping(None)
        ));
        assert_eq!(registry.status(&id).await, Some(ExecutionStatus::Stopped));
        assert!(matches!(
            registry.begin_stop(&id).await,
            StopRequest::NotRunning(ExecutionStatus::Stopped)
        ));
        assert!(matches!(
            registry.begin_stop("missing").await,
            StopRequest::NotFound
        ));

        // A late exit report does not move it back.
        registry
            .mark_exited(&id, ExitInfo { code: Some(0), signal: None })
            .await;
        assert_eq!(registry.status(&id).await, Some(ExecutionStatus::Stopped));
    }

    #[tokio::test]
    async fn test_worker_binding() {
        let registry = ExecutionRegistry::new(100);
        let id = registry.create(sample_config(), Some("ui-1")).await;

        let binding = registry.bind_worker(&id, "worker-1").await.unwrap();
        assert_eq!(binding.owner.as_deref(), Some("ui-1"));
        assert_eq!(binding.config.extra_vars, Some(json!({"env": "dev"})));

        let summary = registry.summary(&id).await.unwrap();
        assert_eq!(summary.status, ExecutionStatus::Running);
        assert!(summary.worker_connected);
        assert!(summary.last_heartbeat.is_some());

        // Another client's disconnect leaves the binding alone.
        registry.release_worker(&id, "worker-2").await;
        assert!(registry.summary(&id).await.unwrap().worker_connected);

        registry.release_worker(&id, "worker-1").await;
        let summary = registry.summary(&id).await.unwrap();
        assert!(!summary.worker_connected);
        assert_eq!(summary.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_worker_cannot_bind_terminal_execution() {
        let registry = ExecutionRegistry::new(100);
        let id = registry.create(sample_config(), None).await;
        registry.mark_error(&id, "boom".to_string()).await;
        assert!(registry.bind_worker(&id, "worker-1").await.is_none());
        assert!(registry.bind_worker("nope", "worker-1").await.is_none());
    }

    #[tokio::test]
    async fn test_events_replay() {
        let registry = ExecutionRegistry::new(2);
        let id = registry.create(sample_config(), Some("ui-1")).await;
        for n in 0..3 {
            let owner = registry.record_event(&id, json!({"type": "Job", "n": n})).await;
            assert_eq!(owner, Some(Some("ui-1".to_string())));
        }
        let replay = registry.events_since(&id, 0).await.unwrap();
        assert_eq!(replay.dropped, 1);
        assert_eq!(replay.events.len(), 2);
        assert_eq!(replay.events[0].event["n"], 1);
        assert!(registry.record_event("nope", json!({})).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_spares_running_and_young() {
        let registry = ExecutionRegistry::new(100);
        let exited = registry.create(sample_config(), None).await;
        registry
            .mark_exited(&exited, ExitInfo { code: Some(0), signal: None })
            .await;
        let running = registry.create(sample_config(), None).await;
        registry.bind_worker(&running, "worker-1").await;

        let threshold = Duration::from_secs(60 * 60);
        let now = Instant::now();

        // 30 minutes later: nothing is old enough.
        let evicted = registry
            .sweep_stale(now + Duration::from_secs(30 * 60), threshold)
            .await;
        assert!(evicted.is_empty());

        // 61 minutes later: the exited one goes, the running one stays.
        let evicted = registry
            .sweep_stale(now + Duration::from_secs(61 * 60), threshold)
            .await;
        assert_eq!(evicted, vec![exited.clone()]);
        assert!(registry.status(&exited).await.is_none());
        assert_eq!(
            registry.status(&running).await,
            Some(ExecutionStatus::Running)
        );
    }
}
