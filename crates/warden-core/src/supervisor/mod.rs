//! Bounded pool of worker processes, one isolated workspace each.
//!
//! Every public operation returns a value: spawn failures come back in
//! [`SpawnResult`], everything after the process starts is reported on the
//! event bus.

mod monitor;
mod orchestrate;
mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};
use warden_config::{resolve_path, Config};

use crate::error::SupervisorError;
use crate::event::{AgentEvent, AgentStatus, ErrorSubtype, EventBus, OutputKind, StatusEvent};
use crate::persona::{slug, PersonaStore};
use crate::probe::CapabilityProbe;
use crate::workspace::{WorkspaceLease, WorkspacePool};

pub use orchestrate::{parse_directives, Directive, OrchestrateResult};
use process::ProcessControl;

/// Runtime settings, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub use_mock: bool,
    pub mock_delay: Duration,
    pub event_capacity: usize,
    pub worker_binary: String,
    pub worker_args: Vec<String>,
    pub probe_args: Vec<String>,
    pub probe_timeout: Duration,
    /// Added to the inherited environment of real workers.
    pub worker_env: HashMap<String, String>,
    pub workspace_root: PathBuf,
    pub base_repo: Option<PathBuf>,
    pub use_worktrees: bool,
    pub personas_dir: PathBuf,
    pub persona_file_name: String,
    pub git_timeout: Duration,
    pub coordinator: String,
    pub orchestration_agents: Vec<String>,
}

impl SupervisorOptions {
    pub fn from_config(config: &Config) -> Self {
        let worker = &config.worker;
        let mut worker_env = worker.env.clone();
        if !worker.api_base_url.is_empty() {
            worker_env.insert(worker.api_base_url_var.clone(), worker.api_base_url.clone());
        }
        if !worker.api_key.is_empty() {
            worker_env.insert(worker.api_key_var.clone(), worker.api_key.clone());
        }

        Self {
            max_concurrent: config.agents.max_concurrent,
            timeout: Duration::from_millis(config.agents.timeout_ms),
            kill_grace: Duration::from_millis(config.agents.kill_grace_ms),
            use_mock: config.agents.use_mock,
            mock_delay: Duration::from_millis(config.agents.mock_delay_ms),
            event_capacity: config.agents.event_capacity,
            worker_binary: worker.binary.clone(),
            worker_args: worker.args.clone(),
            probe_args: worker.probe_args.clone(),
            probe_timeout: Duration::from_millis(worker.probe_timeout_ms),
            worker_env,
            workspace_root: resolve_path(&config.workspace.root),
            base_repo: config.workspace.base_repo.as_deref().map(resolve_path),
            use_worktrees: config.workspace.use_worktrees,
            personas_dir: resolve_path(&config.workspace.personas_dir),
            persona_file_name: config.workspace.persona_file_name.clone(),
            git_timeout: Duration::from_millis(config.workspace.git_timeout_ms),
            coordinator: config.orchestration.coordinator.clone(),
            orchestration_agents: config.orchestration.agents.clone(),
        }
    }
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Point-in-time view of one agent instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub workspace: PathBuf,
    pub status: AgentStatus,
    pub task: String,
    pub is_mock: bool,
    pub spawned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AgentSnapshot {
    fn status_event(&self) -> StatusEvent {
        StatusEvent {
            agent: self.name.clone(),
            pid: self.pid,
            status: self.status,
            exit_code: self.exit_code,
            error_message: self.error_message.clone(),
            is_mock: self.is_mock,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpawnResult {
    pub success: bool,
    pub agent: String,
    pub mock: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the worker had already exited by the time spawn returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl SpawnResult {
    fn failed(agent: &str, mock: bool, error: String) -> Self {
        Self {
            success: false,
            agent: agent.to_string(),
            mock,
            pid: None,
            error: Some(error),
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    /// Worker executable probe; `None` until the first probe completes.
    pub tool_available: Option<bool>,
    /// git probe; `None` until the first worktree attempt.
    pub vcs_available: Option<bool>,
    pub use_mock: bool,
    pub cap: usize,
    pub timeout_ms: u64,
    pub active_count: usize,
    pub active_names: Vec<String>,
}

struct ActiveAgent {
    id: u64,
    snapshot: AgentSnapshot,
    control: ProcessControl,
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, ActiveAgent>,
    /// Last terminal snapshot per name, tagged with its instance id.
    finished: HashMap<String, (u64, AgentSnapshot)>,
}

impl Registry {
    /// Move instance `id` out of the active set and remember how it ended.
    /// A newer instance under the same name is left alone.
    fn retire(&mut self, id: u64, snapshot: &AgentSnapshot) {
        if self.active.get(&snapshot.name).map(|a| a.id) == Some(id) {
            self.active.remove(&snapshot.name);
        }
        let newer = self
            .finished
            .get(&snapshot.name)
            .map(|(prev, _)| *prev <= id)
            .unwrap_or(true);
        if newer {
            self.finished
                .insert(snapshot.name.clone(), (id, snapshot.clone()));
        }
    }
}

struct Inner {
    options: SupervisorOptions,
    bus: EventBus,
    workspaces: WorkspacePool,
    worker_probe: CapabilityProbe,
    registry: Mutex<Registry>,
    /// Held from the capacity check until the new instance is registered.
    spawn_lock: Mutex<()>,
    next_id: AtomicU64,
    /// Monitor tasks still waiting on a process.
    running: AtomicUsize,
}

/// Spawns, observes and tears down agent processes. Cheap to clone.
#[derive(Clone)]
pub struct AgentSupervisor {
    inner: Arc<Inner>,
}

impl AgentSupervisor {
    pub fn new(options: SupervisorOptions) -> Self {
        let workspaces = WorkspacePool::new(
            options.workspace_root.clone(),
            PersonaStore::new(options.personas_dir.clone()),
        )
        .with_base_repo(options.base_repo.clone())
        .with_worktrees(options.use_worktrees)
        .with_git_timeout(options.git_timeout)
        .with_persona_file_name(options.persona_file_name.clone());

        let worker_probe = CapabilityProbe::new(
            options.worker_binary.clone(),
            options.probe_args.clone(),
            options.probe_timeout,
        );

        Self {
            inner: Arc::new(Inner {
                bus: EventBus::new(options.event_capacity),
                workspaces,
                worker_probe,
                registry: Mutex::new(Registry::default()),
                spawn_lock: Mutex::new(()),
                next_id: AtomicU64::new(1),
                running: AtomicUsize::new(0),
                options,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(SupervisorOptions::from_config(config))
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.options
    }

    pub fn workspaces(&self) -> &WorkspacePool {
        &self.inner.workspaces
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.bus.subscribe()
    }

    /// Start `task` under `name`, replacing any running agent of that name.
    pub async fn spawn(&self, name: &str, task: &str) -> SpawnResult {
        let name = name.trim();
        match self.try_spawn(name, task).await {
            Ok(result) => result,
            Err(e) => {
                warn!(agent = %name, "Spawn failed: {e}");
                let message = e.to_string();
                self.inner
                    .bus
                    .error(name, ErrorSubtype::Spawn, message.clone(), None);
                SpawnResult::failed(name, self.inner.options.use_mock, message)
            }
        }
    }

    async fn try_spawn(&self, name: &str, task: &str) -> Result<SpawnResult, SupervisorError> {
        if !slug(name).chars().any(|c| c.is_ascii_alphanumeric()) {
            return Err(SupervisorError::InvalidName(name.to_string()));
        }

        let _spawning = self.inner.spawn_lock.lock().await;
        let cap = self.inner.options.max_concurrent;

        let evicted = {
            let mut registry = self.inner.registry.lock().await;
            if registry.active.len() >= cap {
                return Err(SupervisorError::CapacityExceeded { cap });
            }
            registry.active.remove(name)
        };
        if let Some(previous) = evicted {
            info!(agent = %name, pid = ?previous.snapshot.pid, "Evicting running instance");
            previous.control.terminate();
        }

        let lease = self.inner.workspaces.acquire(name).await?;
        let mock = self.inner.options.use_mock || !self.inner.worker_probe.available().await;

        let (mut child, is_mock) = match self.launch(name, &lease, mock) {
            Ok(launched) => launched,
            Err(e) => {
                self.inner.workspaces.release(&lease.path).await;
                return Err(e);
            }
        };

        let pid = child.id();
        let exit_code = match child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        };
        process::deliver_task(&mut child, name, task);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = AgentSnapshot {
            name: name.to_string(),
            pid,
            workspace: lease.path.clone(),
            status: AgentStatus::Working,
            task: task.to_string(),
            is_mock,
            spawned_at: Utc::now(),
            exit_code: None,
            error_message: None,
        };
        let (control, terminate_rx) = ProcessControl::new();
        self.inner.registry.lock().await.active.insert(
            name.to_string(),
            ActiveAgent {
                id,
                snapshot: snapshot.clone(),
                control,
            },
        );
        self.inner.bus.status(snapshot.status_event());
        info!(agent = %name, pid = ?pid, mock = is_mock, workspace = %lease.path.display(), "Agent spawned");

        self.inner.running.fetch_add(1, Ordering::SeqCst);
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor
                .monitor(id, snapshot, lease.path, child, terminate_rx)
                .await;
        });

        Ok(SpawnResult {
            success: true,
            agent: name.to_string(),
            mock: is_mock,
            pid,
            error: None,
            exit_code,
        })
    }

    /// Start the real worker, or the simulated one when `mock` is set or the
    /// real one cannot be started.
    fn launch(
        &self,
        name: &str,
        lease: &WorkspaceLease,
        mock: bool,
    ) -> Result<(tokio::process::Child, bool), SupervisorError> {
        let options = &self.inner.options;
        if !mock {
            match process::spawn_real(options, name, &lease.path) {
                Ok(child) => return Ok((child, false)),
                Err(e) => {
                    warn!(agent = %name, binary = %options.worker_binary, "Worker failed to start, substituting simulation: {e}");
                    self.inner.bus.output(
                        name,
                        OutputKind::Stderr,
                        format!(
                            "Failed to start '{}' ({e}); running a simulated worker instead.",
                            options.worker_binary
                        ),
                    );
                }
            }
        }
        let child = process::spawn_mock(options, name, &lease.path)
            .map_err(SupervisorError::ProcessSpawnFailed)?;
        Ok((child, true))
    }

    /// Ask the agent to stop: SIGTERM now, SIGKILL after the grace period.
    /// Returns whether an active agent by that name existed.
    pub async fn terminate(&self, name: &str) -> bool {
        let registry = self.inner.registry.lock().await;
        match registry.active.get(name) {
            Some(agent) => {
                info!(agent = %name, pid = ?agent.snapshot.pid, "Terminating agent");
                agent.control.terminate();
                true
            }
            None => false,
        }
    }

    /// Pid of the active instance for `name`, if any.
    async fn active_pid(&self, name: &str) -> Option<Option<u32>> {
        let registry = self.inner.registry.lock().await;
        registry.active.get(name).map(|a| a.snapshot.pid)
    }

    /// The active instance for `name`, or the last one that finished.
    pub async fn status(&self, name: &str) -> Option<AgentSnapshot> {
        let registry = self.inner.registry.lock().await;
        registry
            .active
            .get(name)
            .map(|a| a.snapshot.clone())
            .or_else(|| registry.finished.get(name).map(|(_, s)| s.clone()))
    }

    pub async fn list_active(&self) -> Vec<AgentSnapshot> {
        let registry = self.inner.registry.lock().await;
        let mut agents: Vec<AgentSnapshot> =
            registry.active.values().map(|a| a.snapshot.clone()).collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let options = &self.inner.options;
        let tool_available = self.inner.worker_probe.cached();
        let mut active_names: Vec<String> = self
            .inner
            .registry
            .lock()
            .await
            .active
            .keys()
            .cloned()
            .collect();
        active_names.sort();

        Diagnostics {
            tool_available,
            vcs_available: self.inner.workspaces.git_available(),
            use_mock: options.use_mock || tool_available == Some(false),
            cap: options.max_concurrent,
            timeout_ms: options.timeout.as_millis() as u64,
            active_count: active_names.len(),
            active_names,
        }
    }

    /// Re-run the worker availability probe.
    pub async fn reprobe_worker(&self) -> bool {
        self.inner.worker_probe.reprobe().await
    }

    /// Stop every agent, wait for them to exit, then reclaim all workspaces.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self
            .inner
            .registry
            .lock()
            .await
            .active
            .keys()
            .cloned()
            .collect();
        for name in &names {
            self.terminate(name).await;
        }

        let limit = self.inner.options.kill_grace + Duration::from_secs(2);
        let drained = tokio::time::timeout(limit, async {
            while self.inner.running.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                running = self.inner.running.load(Ordering::SeqCst),
                "Agents still running at shutdown"
            );
        }

        for e in self.inner.workspaces.cleanup().await {
            warn!("Workspace cleanup: {e}");
        }
        info!(stopped = names.len(), "Supervisor shut down");
    }
}
