use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Lowercase slug used for file and branch names. Runs of anything other
/// than `[a-z0-9_]` collapse to a single `-`.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

fn default_persona(agent: &str) -> String {
    format!(
        "# {agent}\n\n\
         You are **{agent}**, one of several agents working side by side.\n\n\
         - Your working directory is an isolated workspace created for this task.\n\
         - Stay focused on the task you were given; do not wander into unrelated work.\n\
         - Keep changes inside your workspace.\n\
         - When you are done, finish with a short summary of what you did.\n"
    )
}

/// Per-agent persona documents, one markdown file per agent name.
#[derive(Debug, Clone)]
pub struct PersonaStore {
    dir: PathBuf,
}

impl PersonaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the persona document for `agent` (may not exist yet).
    pub fn path_for(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{}.md", slug(agent)))
    }

    /// Return the persona path, writing the default document if it is missing.
    pub fn ensure(&self, agent: &str) -> std::io::Result<PathBuf> {
        let path = self.path_for(agent);
        if !path.exists() {
            std::fs::create_dir_all(&self.dir)?;
            std::fs::write(&path, default_persona(agent))?;
            debug!(agent = %agent, path = %path.display(), "created default persona");
        }
        Ok(path)
    }

    /// Read the persona, creating it first when absent.
    pub fn load(&self, agent: &str) -> std::io::Result<String> {
        let path = self.ensure(agent)?;
        std::fs::read_to_string(path)
    }

    /// Replace the persona text for `agent`.
    pub fn save(&self, agent: &str, content: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(agent), content)
    }

    /// Copy the persona into `workspace` under `file_name`.
    ///
    /// Failures are logged and reported as `None`; a workspace without a
    /// persona is still usable.
    pub async fn install(
        &self,
        agent: &str,
        workspace: &Path,
        file_name: &str,
    ) -> Option<PathBuf> {
        let store = self.clone();
        let agent_owned = agent.to_string();
        let source = match tokio::task::spawn_blocking(move || store.ensure(&agent_owned)).await {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                warn!(agent = %agent, "Failed to materialize persona: {e}");
                return None;
            }
            Err(e) => {
                warn!(agent = %agent, "Persona task failed: {e}");
                return None;
            }
        };

        let dest = workspace.join(file_name);
        match tokio::fs::copy(&source, &dest).await {
            Ok(_) => Some(dest),
            Err(e) => {
                warn!(
                    agent = %agent,
                    workspace = %workspace.display(),
                    "Failed to copy persona into workspace: {e}"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_slug() {
        assert_eq!(slug("Butler"), "butler");
        assert_eq!(slug("code reviewer"), "code-reviewer");
        assert_eq!(slug("../../etc/passwd"), "etc-passwd");
        assert_eq!(slug("a__b"), "a__b");
        assert_eq!(slug("  !!  "), "");
    }

    #[test]
    fn test_ensure_creates_default() {
        let dir = TempDir::new().unwrap();
        let store = PersonaStore::new(dir.path().join("personas"));
        let path = store.ensure("butler").unwrap();
        assert!(path.ends_with("butler.md"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# butler"));
        assert!(text.contains("You are **butler**"));
    }

    #[test]
    fn test_existing_persona_is_kept() {
        let dir = TempDir::new().unwrap();
        let store = PersonaStore::new(dir.path());
        store.save("coder", "custom persona").unwrap();
        store.ensure("coder").unwrap();
        assert_eq!(store.load("coder").unwrap(), "custom persona");
    }

    #[test]
    fn test_names_share_slugged_file() {
        let dir = TempDir::new().unwrap();
        let store = PersonaStore::new(dir.path());
        assert_eq!(store.path_for("Coder"), store.path_for("coder"));
    }

    #[tokio::test]
    async fn test_install_copies_into_workspace() {
        let dir = TempDir::new().unwrap();
        let store = PersonaStore::new(dir.path().join("personas"));
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();

        let installed = store.install("writer", &ws, "CLAUDE.md").await.unwrap();
        assert_eq!(installed, ws.join("CLAUDE.md"));
        let text = std::fs::read_to_string(installed).unwrap();
        assert!(text.contains("**writer**"));
    }

    #[tokio::test]
    async fn test_install_failure_is_soft() {
        let dir = TempDir::new().unwrap();
        let store = PersonaStore::new(dir.path().join("personas"));
        // destination directory does not exist
        let missing = dir.path().join("missing");
        assert!(store.install("writer", &missing, "CLAUDE.md").await.is_none());
    }
}
