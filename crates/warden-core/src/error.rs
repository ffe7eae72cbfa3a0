use std::path::PathBuf;

use thiserror::Error;

/// Failures of the workspace pool.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace '{}': {source}", path.display())]
    CreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove workspace '{}': {reason}", path.display())]
    RemovalFailed { path: PathBuf, reason: String },
}

/// Reasons a spawn is rejected before the agent starts running.
///
/// Failures after the process is up (non-zero exit, timeout, OS errors) are
/// reported as events instead.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Maximum agent limit ({cap}) reached.")]
    CapacityExceeded { cap: usize },
    #[error("invalid agent name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("failed to start worker process: {0}")]
    ProcessSpawnFailed(#[source] std::io::Error),
}
