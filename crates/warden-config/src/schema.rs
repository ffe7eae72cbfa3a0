use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub worker: WorkerConfig,
    pub workspace: WorkspaceConfig,
    pub orchestration: OrchestrationConfig,
}

/// Supervisor limits and lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    /// Maximum number of concurrently active agents.
    pub max_concurrent: usize,
    /// Wall-clock limit for a single agent run.
    pub timeout_ms: u64,
    /// How long a terminated worker gets before it is force-killed.
    pub kill_grace_ms: u64,
    /// Always run the simulated worker, even when the real one is installed.
    pub use_mock: bool,
    /// How long the simulated worker pretends to work.
    pub mock_delay_ms: u64,
    /// Buffered events per subscriber before it starts lagging.
    pub event_capacity: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout_ms: 5 * 60 * 1000,
            kill_grace_ms: 5000,
            use_mock: false,
            mock_delay_ms: 1500,
            event_capacity: 1024,
        }
    }
}

/// The external worker executable and how it is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub binary: String,
    pub args: Vec<String>,
    /// Arguments for the availability probe. The probe passes when the
    /// command exits successfully within `probe_timeout_ms`.
    pub probe_args: Vec<String>,
    pub probe_timeout_ms: u64,
    /// Extra environment for real workers.
    pub env: HashMap<String, String>,
    pub api_base_url: String,
    pub api_key: String,
    /// Variable the base URL is exported as.
    pub api_base_url_var: String,
    /// Variable the credential is exported as.
    pub api_key_var: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: "claude".into(),
            args: vec![
                "--print".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
                "--dangerously-skip-permissions".into(),
            ],
            probe_args: vec!["--version".into()],
            probe_timeout_ms: 5000,
            env: HashMap::from([(
                "CLAUDE_CODE_EXPERIMENTAL_AGENT_TEAMS".to_string(),
                "1".to_string(),
            )]),
            api_base_url: "https://api.anthropic.com".into(),
            api_key: String::new(),
            api_base_url_var: "ANTHROPIC_BASE_URL".into(),
            api_key_var: "ANTHROPIC_API_KEY".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceConfig {
    /// Directory holding one subdirectory per lease.
    pub root: String,
    /// Repository new worktrees branch from.
    /// When unset, a private repository is initialized under `root`.
    pub base_repo: Option<String>,
    pub use_worktrees: bool,
    /// Directory of per-agent persona documents.
    pub personas_dir: String,
    /// Name the persona document is copied to inside each lease.
    pub persona_file_name: String,
    pub git_timeout_ms: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: "~/.warden/workspaces".into(),
            base_repo: None,
            use_worktrees: true,
            personas_dir: "~/.warden/personas".into(),
            persona_file_name: "CLAUDE.md".into(),
            git_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestrationConfig {
    /// Agent that receives orchestrated tasks and delegates to the others.
    pub coordinator: String,
    /// Agents the coordinator may delegate to when the caller names none.
    pub agents: Vec<String>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            coordinator: "butler".into(),
            agents: vec![
                "researcher".into(),
                "coder".into(),
                "reviewer".into(),
                "writer".into(),
            ],
        }
    }
}
