//! Isolated, disposable working directories for agents.
//!
//! Leases are git worktrees when git is usable, plain directories otherwise.
//! Losing git at any point only changes which kind of lease is handed out.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::error::WorkspaceError;
use crate::persona::{slug, PersonaStore};
use crate::probe::CapabilityProbe;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    Worktree,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceLease {
    pub path: PathBuf,
    /// Unique identifier; the branch name for worktree leases.
    pub branch: String,
    pub agent: String,
    pub kind: LeaseKind,
    pub created_at: DateTime<Utc>,
}

/// Hands out one workspace per agent invocation and reclaims it afterwards.
pub struct WorkspacePool {
    root: PathBuf,
    base_repo: Option<PathBuf>,
    use_worktrees: bool,
    git: CapabilityProbe,
    git_timeout: Duration,
    personas: PersonaStore,
    persona_file_name: String,
    leases: Mutex<HashMap<PathBuf, WorkspaceLease>>,
    base_ready: OnceCell<Option<PathBuf>>,
}

impl WorkspacePool {
    pub fn new(root: impl Into<PathBuf>, personas: PersonaStore) -> Self {
        Self {
            root: root.into(),
            base_repo: None,
            use_worktrees: true,
            git: CapabilityProbe::new(
                "git",
                vec!["--version".to_string()],
                Duration::from_secs(5),
            ),
            git_timeout: Duration::from_secs(30),
            personas,
            persona_file_name: "CLAUDE.md".to_string(),
            leases: Mutex::new(HashMap::new()),
            base_ready: OnceCell::new(),
        }
    }

    /// Branch worktrees from an existing repository instead of a private one.
    pub fn with_base_repo(mut self, repo: Option<PathBuf>) -> Self {
        self.base_repo = repo;
        self
    }

    pub fn with_worktrees(mut self, enabled: bool) -> Self {
        self.use_worktrees = enabled;
        self
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn with_persona_file_name(mut self, name: impl Into<String>) -> Self {
        self.persona_file_name = name.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn personas(&self) -> &PersonaStore {
        &self.personas
    }

    /// Cached git probe result, `None` until the first worktree attempt.
    pub fn git_available(&self) -> Option<bool> {
        self.git.cached()
    }

    /// Create a fresh workspace for `agent`.
    ///
    /// Fails only when the directory itself cannot be created.
    pub async fn acquire(&self, agent: &str) -> Result<WorkspaceLease, WorkspaceError> {
        let id = lease_id(agent);
        let path = self.root.join(&id);
        let branch = format!("warden/{id}");

        let kind = if self.try_worktree(&path, &branch).await {
            LeaseKind::Worktree
        } else {
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|source| WorkspaceError::CreationFailed {
                    path: path.clone(),
                    source,
                })?;
            LeaseKind::Directory
        };

        self.personas
            .install(agent, &path, &self.persona_file_name)
            .await;

        let lease = WorkspaceLease {
            path: path.clone(),
            branch,
            agent: agent.to_string(),
            kind,
            created_at: Utc::now(),
        };
        self.leases.lock().await.insert(path, lease.clone());
        info!(agent = %agent, path = %lease.path.display(), kind = ?kind, "Workspace acquired");
        Ok(lease)
    }

    /// Reclaim a workspace. Unknown paths are ignored and failures are only
    /// logged.
    pub async fn release(&self, path: &Path) {
        if let Err(e) = self.try_release(path).await {
            warn!("{e}");
        }
    }

    /// Reclaim a workspace, reporting removal failures. Returns `Ok(false)`
    /// when `path` is not an active lease.
    pub async fn try_release(&self, path: &Path) -> Result<bool, WorkspaceError> {
        let Some(lease) = self.leases.lock().await.remove(path) else {
            return Ok(false);
        };

        if lease.kind == LeaseKind::Worktree && self.remove_worktree(&lease).await {
            info!(agent = %lease.agent, path = %path.display(), "Worktree released");
            return Ok(true);
        }

        remove_dir(&lease.path).await?;
        info!(agent = %lease.agent, path = %path.display(), "Workspace released");
        Ok(true)
    }

    /// Snapshot of every outstanding lease, oldest first.
    pub async fn active_leases(&self) -> Vec<WorkspaceLease> {
        let mut leases: Vec<WorkspaceLease> =
            self.leases.lock().await.values().cloned().collect();
        leases.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        leases
    }

    /// Release every lease, collecting failures instead of stopping at the first.
    pub async fn cleanup(&self) -> Vec<WorkspaceError> {
        let paths: Vec<PathBuf> = self.leases.lock().await.keys().cloned().collect();
        let mut errors = Vec::new();
        for path in paths {
            if let Err(e) = self.try_release(&path).await {
                warn!("{e}");
                errors.push(e);
            }
        }
        errors
    }

    async fn try_worktree(&self, path: &Path, branch: &str) -> bool {
        if !self.use_worktrees {
            return false;
        }
        if !self.git.available().await {
            debug!("git unavailable, using plain directories");
            return false;
        }
        let Some(base) = self.base().await else {
            return false;
        };
        if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
            warn!(root = %self.root.display(), "Failed to create workspace root: {e}");
            return false;
        }

        let args = [
            OsStr::new("worktree"),
            OsStr::new("add"),
            OsStr::new("-b"),
            OsStr::new(branch),
            path.as_os_str(),
        ];
        match self.git(&base, &args).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    "git worktree add failed, falling back to a plain directory: {e}"
                );
                false
            }
        }
    }

    async fn remove_worktree(&self, lease: &WorkspaceLease) -> bool {
        let Some(base) = self.base_ready.get().cloned().flatten() else {
            return false;
        };
        let args = [
            OsStr::new("worktree"),
            OsStr::new("remove"),
            OsStr::new("--force"),
            lease.path.as_os_str(),
        ];
        if let Err(e) = self.git(&base, &args).await {
            warn!(path = %lease.path.display(), "git worktree remove failed: {e}");
            // drop the stale registration once the directory is gone
            if remove_dir(&lease.path).await.is_ok() {
                let prune = [OsStr::new("worktree"), OsStr::new("prune")];
                let _ = self.git(&base, &prune).await;
            }
            return false;
        }
        let branch_args = [
            OsStr::new("branch"),
            OsStr::new("-D"),
            OsStr::new(&lease.branch),
        ];
        if let Err(e) = self.git(&base, &branch_args).await {
            debug!(branch = %lease.branch, "Failed to delete lease branch: {e}");
        }
        true
    }

    /// Repository worktrees branch from, initialized once per pool.
    async fn base(&self) -> Option<PathBuf> {
        self.base_ready
            .get_or_init(|| async {
                match &self.base_repo {
                    Some(repo) => Some(repo.clone()),
                    None => self.init_private_repo().await,
                }
            })
            .await
            .clone()
    }

    async fn init_private_repo(&self) -> Option<PathBuf> {
        let repo = self.root.join(".base");
        if repo.join(".git").exists() {
            return Some(repo);
        }
        if let Err(e) = tokio::fs::create_dir_all(&repo).await {
            warn!(path = %repo.display(), "Failed to create base repository: {e}");
            return None;
        }
        let steps: [&[&str]; 2] = [
            &["init", "-q"],
            &[
                "-c",
                "user.name=warden",
                "-c",
                "user.email=warden@localhost",
                "commit",
                "-q",
                "--allow-empty",
                "-m",
                "warden base",
            ],
        ];
        for step in steps {
            let args: Vec<&OsStr> = step.iter().map(OsStr::new).collect();
            if let Err(e) = self.git(&repo, &args).await {
                warn!(path = %repo.display(), "Failed to initialize base repository: {e}");
                return None;
            }
        }
        info!(path = %repo.display(), "Initialized base repository");
        Some(repo)
    }

    async fn git(&self, repo: &Path, args: &[&OsStr]) -> Result<(), String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.git_timeout, output).await {
            Ok(Ok(out)) if out.status.success() => Ok(()),
            Ok(Ok(out)) => Err(String::from_utf8_lossy(&out.stderr).trim().to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "timed out after {}ms",
                self.git_timeout.as_millis()
            )),
        }
    }
}

fn lease_id(agent: &str) -> String {
    let base = match slug(agent) {
        s if s.is_empty() => "agent".to_string(),
        s => s,
    };
    let suffix = uuid::Uuid::new_v4().to_string()[..8].to_string();
    format!("{base}-{}-{suffix}", Utc::now().timestamp_millis())
}

async fn remove_dir(path: &Path) -> Result<(), WorkspaceError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkspaceError::RemovalFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plain_pool(dir: &TempDir) -> WorkspacePool {
        WorkspacePool::new(
            dir.path().join("workspaces"),
            PersonaStore::new(dir.path().join("personas")),
        )
        .with_worktrees(false)
    }

    fn has_git() -> bool {
        which::which("git").is_ok()
    }

    #[test]
    fn test_lease_ids_are_unique() {
        let a = lease_id("Butler");
        let b = lease_id("Butler");
        assert_ne!(a, b);
        assert!(a.starts_with("butler-"));
        assert!(lease_id("!!!").starts_with("agent-"));
    }

    #[tokio::test]
    async fn test_acquire_plain_directory() {
        let dir = TempDir::new().unwrap();
        let pool = plain_pool(&dir);

        let lease = pool.acquire("coder").await.unwrap();
        assert_eq!(lease.kind, LeaseKind::Directory);
        assert_eq!(lease.agent, "coder");
        assert!(lease.path.is_dir());
        assert!(lease.path.starts_with(pool.root()));
        let persona = std::fs::read_to_string(lease.path.join("CLAUDE.md")).unwrap();
        assert!(persona.contains("**coder**"));
        assert_eq!(pool.active_leases().await, vec![lease]);
    }

    #[tokio::test]
    async fn test_repeated_acquire_never_collides() {
        let dir = TempDir::new().unwrap();
        let pool = plain_pool(&dir);
        let a = pool.acquire("x").await.unwrap();
        let b = pool.acquire("x").await.unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(pool.active_leases().await.len(), 2);
    }

    #[tokio::test]
    async fn test_release_removes_directory_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pool = plain_pool(&dir);
        let lease = pool.acquire("coder").await.unwrap();

        assert!(pool.try_release(&lease.path).await.unwrap());
        assert!(!lease.path.exists());
        assert!(pool.active_leases().await.is_empty());

        assert!(!pool.try_release(&lease.path).await.unwrap());
        pool.release(&lease.path).await;
        pool.release(Path::new("/definitely/not/a/lease")).await;
    }

    #[tokio::test]
    async fn test_creation_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let pool = WorkspacePool::new(&blocker, PersonaStore::new(dir.path().join("p")));

        let err = pool.acquire("coder").await.unwrap_err();
        assert!(matches!(err, WorkspaceError::CreationFailed { .. }));
        assert!(pool.active_leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_broken_base_repo_falls_back_to_directory() {
        let dir = TempDir::new().unwrap();
        let not_a_repo = dir.path().join("plain");
        std::fs::create_dir_all(&not_a_repo).unwrap();
        let pool = WorkspacePool::new(
            dir.path().join("workspaces"),
            PersonaStore::new(dir.path().join("personas")),
        )
        .with_base_repo(Some(not_a_repo));

        let lease = pool.acquire("coder").await.unwrap();
        assert_eq!(lease.kind, LeaseKind::Directory);
        assert!(lease.path.is_dir());
        pool.release(&lease.path).await;
        assert!(!lease.path.exists());
    }

    #[tokio::test]
    async fn test_missing_persona_dir_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("personas");
        std::fs::write(&blocker, "file, not a directory").unwrap();
        let pool = WorkspacePool::new(dir.path().join("ws"), PersonaStore::new(&blocker))
            .with_worktrees(false);

        let lease = pool.acquire("coder").await.unwrap();
        assert!(lease.path.is_dir());
        assert!(!lease.path.join("CLAUDE.md").exists());
    }

    #[tokio::test]
    async fn test_cleanup_releases_everything() {
        let dir = TempDir::new().unwrap();
        let pool = plain_pool(&dir);
        let a = pool.acquire("a").await.unwrap();
        let b = pool.acquire("b").await.unwrap();

        assert!(pool.cleanup().await.is_empty());
        assert!(pool.active_leases().await.is_empty());
        assert!(!a.path.exists());
        assert!(!b.path.exists());
    }

    #[tokio::test]
    async fn test_worktree_lease_with_private_repo() {
        if !has_git() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let pool = WorkspacePool::new(
            dir.path().join("workspaces"),
            PersonaStore::new(dir.path().join("personas")),
        );

        let lease = pool.acquire("reviewer").await.unwrap();
        assert_eq!(pool.git_available(), Some(true));
        assert_eq!(lease.kind, LeaseKind::Worktree);
        assert!(lease.branch.starts_with("warden/reviewer-"));
        // linked worktrees carry a `.git` file pointing back at the base repo
        assert!(lease.path.join(".git").is_file());
        assert!(lease.path.join("CLAUDE.md").exists());

        assert!(pool.try_release(&lease.path).await.unwrap());
        assert!(!lease.path.exists());
    }
}
