use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Cached, time-bounded check that an external tool is installed and runs.
///
/// The probe runs at most once; later calls reuse the answer until
/// [`CapabilityProbe::reprobe`] is called.
pub struct CapabilityProbe {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    cached: Mutex<Option<bool>>,
}

impl CapabilityProbe {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            cached: Mutex::new(None),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether the tool is available, probing on first use.
    pub async fn available(&self) -> bool {
        let mut cached = self.cached.lock().await;
        if let Some(known) = *cached {
            return known;
        }
        let found = self.run().await;
        *cached = Some(found);
        found
    }

    /// Forget the cached answer and probe again.
    pub async fn reprobe(&self) -> bool {
        let mut cached = self.cached.lock().await;
        let found = self.run().await;
        *cached = Some(found);
        found
    }

    /// The cached answer, if a probe has completed. Never starts a probe and
    /// reports `None` while one is in flight.
    pub fn cached(&self) -> Option<bool> {
        self.cached.try_lock().ok().and_then(|guard| *guard)
    }

    async fn run(&self) -> bool {
        let resolved = match which::which(&self.program) {
            Ok(path) => path,
            Err(e) => {
                info!(program = %self.program, "Tool not found: {e}");
                return false;
            }
        };

        let status = Command::new(&resolved)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(self.timeout, status).await {
            Ok(Ok(status)) if status.success() => {
                debug!(program = %self.program, path = %resolved.display(), "Tool available");
                true
            }
            Ok(Ok(status)) => {
                warn!(program = %self.program, code = ?status.code(), "Tool probe failed");
                false
            }
            Ok(Err(e)) => {
                warn!(program = %self.program, "Tool probe could not run: {e}");
                false
            }
            Err(_) => {
                warn!(
                    program = %self.program,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Tool probe timed out"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(program: &str, args: &[&str], timeout_ms: u64) -> CapabilityProbe {
        CapabilityProbe::new(
            program,
            args.iter().map(|a| a.to_string()).collect(),
            Duration::from_millis(timeout_ms),
        )
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let p = probe("warden-definitely-not-installed", &["--version"], 1000);
        assert_eq!(p.cached(), None);
        assert!(!p.available().await);
        assert_eq!(p.cached(), Some(false));
    }

    #[tokio::test]
    async fn successful_command_is_available() {
        let p = probe("sh", &["-c", "exit 0"], 5000);
        assert!(p.available().await);
        assert_eq!(p.cached(), Some(true));
    }

    #[tokio::test]
    async fn failing_command_is_unavailable() {
        let p = probe("sh", &["-c", "exit 3"], 5000);
        assert!(!p.available().await);
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let p = probe("sh", &["-c", "sleep 5"], 100);
        let started = std::time::Instant::now();
        assert!(!p.available().await);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn answer_is_cached_until_reprobe() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("present");
        let script = format!("test -e '{}'", marker.display());
        let p = probe("sh", &["-c", &script], 5000);

        assert!(!p.available().await);
        std::fs::write(&marker, "").unwrap();
        assert!(!p.available().await);
        assert!(p.reprobe().await);
        assert!(p.available().await);
    }
}
