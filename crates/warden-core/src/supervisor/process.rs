use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::debug;

use super::SupervisorOptions;

/// Stand-in worker used when the real tool is unavailable or disabled.
/// Reads its task from stdin like the real worker.
const MOCK_SCRIPT: &str = r#"task=$(cat)
echo "[mock] $WARDEN_AGENT started in $(pwd)"
printf '[mock] task: %s\n' "$task"
sleep "$WARDEN_MOCK_DELAY"
echo "[mock] $WARDEN_AGENT finished (simulated run, no changes made)"
"#;

/// Handle used to ask a monitor task to stop its process.
pub(super) struct ProcessControl {
    terminate: watch::Sender<bool>,
}

impl ProcessControl {
    pub(super) fn new() -> (Self, watch::Receiver<bool>) {
        let (terminate, rx) = watch::channel(false);
        (Self { terminate }, rx)
    }

    /// Idempotent; the monitor starts the SIGTERM/SIGKILL sequence once.
    pub(super) fn terminate(&self) {
        self.terminate.send_replace(true);
    }
}

fn base_command(program: &str, agent: &str, cwd: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.current_dir(cwd)
        .env("WARDEN_AGENT", agent)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // own process group so signals reach the whole tree
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

pub(super) fn spawn_real(
    options: &SupervisorOptions,
    agent: &str,
    cwd: &Path,
) -> std::io::Result<Child> {
    let mut cmd = base_command(&options.worker_binary, agent, cwd);
    cmd.args(&options.worker_args).envs(&options.worker_env);
    cmd.spawn()
}

pub(super) fn spawn_mock(
    options: &SupervisorOptions,
    agent: &str,
    cwd: &Path,
) -> std::io::Result<Child> {
    let mut cmd = base_command("sh", agent, cwd);
    cmd.arg("-c")
        .arg(MOCK_SCRIPT)
        .env("WARDEN_MOCK", "1")
        .env(
            "WARDEN_MOCK_DELAY",
            format!("{:.3}", options.mock_delay.as_secs_f64()),
        );
    cmd.spawn()
}

/// Write the task to the worker's stdin, then close it.
pub(super) fn deliver_task(child: &mut Child, agent: &str, task: &str) {
    let Some(mut stdin) = child.stdin.take() else {
        return;
    };
    let agent = agent.to_string();
    let task = task.to_string();
    tokio::spawn(async move {
        if let Err(e) = stdin.write_all(task.as_bytes()).await {
            debug!(agent = %agent, "Could not write task to stdin: {e}");
            return;
        }
        let _ = stdin.shutdown().await;
    });
}

/// SIGTERM to the worker's process group.
pub(super) fn interrupt(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM);
            return;
        }
    }
    let _ = child.start_kill();
}

/// SIGKILL to the group and the direct child.
pub(super) fn kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
    let _ = child.start_kill();
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        debug!(pid, ?signal, "killpg failed: {e}");
    }
}

/// Human readable description of an exit without a code.
pub(super) fn describe_signal_exit(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Process terminated by signal {signal}");
        }
    }
    let _ = status;
    "Process terminated".to_string()
}
