use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use super::{process, AgentSnapshot, AgentSupervisor};
use crate::event::{AgentStatus, ErrorSubtype, EventBus, OutputKind};
use crate::stream::{classify_stderr, StdoutClassifier};

const READ_CHUNK: usize = 8 * 1024;
/// How long to wait for output readers after the process has exited.
const READER_DRAIN: Duration = Duration::from_secs(2);

impl AgentSupervisor {
    /// Owns one process from spawn to exit: forwards its output, enforces
    /// the timeout, handles termination requests and publishes the final
    /// status once the workspace has been released.
    pub(super) async fn monitor(
        &self,
        id: u64,
        mut snapshot: AgentSnapshot,
        workspace: PathBuf,
        mut child: Child,
        mut terminate_rx: watch::Receiver<bool>,
    ) {
        let bus = self.inner.bus.clone();
        let options = &self.inner.options;
        let name = snapshot.name.clone();

        let readers = [
            child
                .stdout
                .take()
                .map(|out| tokio::spawn(pump_stdout(bus.clone(), name.clone(), out))),
            child
                .stderr
                .take()
                .map(|err| tokio::spawn(pump_stderr(bus.clone(), name.clone(), err))),
        ];

        let deadline = sleep(options.timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        let mut terminating = false;
        let mut requests_open = true;
        let mut escalation: Option<Pin<Box<Sleep>>> = None;

        let waited = loop {
            tokio::select! {
                status = child.wait() => break status,
                () = &mut deadline, if !timed_out => {
                    timed_out = true;
                    let message = format!(
                        "Agent '{name}' timed out after {}",
                        format_duration(options.timeout)
                    );
                    warn!(agent = %name, pid = ?snapshot.pid, "{message}");
                    snapshot.status = AgentStatus::Timeout;
                    snapshot.error_message = Some(message.clone());
                    self.inner.registry.lock().await.retire(id, &snapshot);
                    bus.error(&name, ErrorSubtype::Timeout, message.clone(), None);
                    bus.output(&name, OutputKind::Error, message);
                    if !terminating {
                        terminating = true;
                        process::interrupt(&mut child);
                        escalation = Some(Box::pin(sleep(options.kill_grace)));
                    }
                }
                changed = terminate_rx.changed(), if requests_open && !terminating => {
                    match changed {
                        Ok(()) if *terminate_rx.borrow_and_update() => {
                            terminating = true;
                            process::interrupt(&mut child);
                            escalation = Some(Box::pin(sleep(options.kill_grace)));
                        }
                        Ok(()) => {}
                        Err(_) => requests_open = false,
                    }
                }
                () = wait_escalation(&mut escalation), if escalation.is_some() => {
                    warn!(agent = %name, pid = ?snapshot.pid, "Still running after grace period, killing");
                    escalation = None;
                    process::kill(&mut child);
                }
            }
        };

        for reader in readers.into_iter().flatten() {
            drain(reader, &name).await;
        }

        match waited {
            Ok(status) => {
                snapshot.exit_code = status.code();
                if snapshot.status == AgentStatus::Working {
                    match status.code() {
                        Some(0) => snapshot.status = AgentStatus::Done,
                        Some(code) => {
                            let message = format!("Process exited with code {code}");
                            snapshot.status = AgentStatus::Error;
                            snapshot.error_message = Some(message.clone());
                            bus.output(&name, OutputKind::Error, message.clone());
                            bus.error(&name, ErrorSubtype::Exit, message, Some(code));
                        }
                        None => {
                            let message = process::describe_signal_exit(&status);
                            snapshot.status = AgentStatus::Error;
                            snapshot.error_message = Some(message.clone());
                            bus.output(&name, OutputKind::Error, message);
                        }
                    }
                }
            }
            Err(e) => {
                let message = format!("Failed to wait for process: {e}");
                warn!(agent = %name, "{message}");
                snapshot.status = AgentStatus::Error;
                snapshot.error_message = Some(message.clone());
                bus.output(&name, OutputKind::Error, message.clone());
                bus.error(&name, ErrorSubtype::Runtime, message, None);
            }
        }

        self.inner.registry.lock().await.retire(id, &snapshot);
        self.inner.workspaces.release(&workspace).await;
        info!(
            agent = %name,
            status = snapshot.status.as_str(),
            exit_code = ?snapshot.exit_code,
            timed_out,
            "Agent finished"
        );
        bus.status(snapshot.status_event());
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn wait_escalation(escalation: &mut Option<Pin<Box<Sleep>>>) {
    match escalation.as_mut() {
        Some(timer) => timer.await,
        None => std::future::pending().await,
    }
}

async fn drain(reader: JoinHandle<()>, agent: &str) {
    let abort = reader.abort_handle();
    if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
        debug!(agent = %agent, "Output reader still open after exit, dropping it");
        abort.abort();
    }
}

async fn pump_stdout(bus: EventBus, agent: String, stdout: impl AsyncRead + Unpin) {
    let mut classifier = StdoutClassifier::new();
    pump(stdout, &agent, |chunk| {
        for (kind, text) in classifier.push(chunk) {
            bus.output(&agent, kind, text);
        }
    })
    .await;
    for (kind, text) in classifier.finish() {
        bus.output(&agent, kind, text);
    }
}

async fn pump_stderr(bus: EventBus, agent: String, stderr: impl AsyncRead + Unpin) {
    pump(stderr, &agent, |chunk| {
        if let Some(text) = classify_stderr(chunk) {
            bus.output(&agent, OutputKind::Stderr, text);
        }
    })
    .await;
}

async fn pump(mut source: impl AsyncRead + Unpin, agent: &str, mut on_chunk: impl FnMut(&[u8])) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => on_chunk(&buf[..n]),
            Err(e) => {
                debug!(agent = %agent, "Output read failed: {e}");
                break;
            }
        }
    }
}

fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(300)), "300s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    }

    #[tokio::test]
    async fn test_pump_stdout_flushes_tail() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let input: &[u8] = b"first\nsecond";
        pump_stdout(bus, "a".into(), input).await;

        let mut chunks = Vec::new();
        while let Ok(crate::event::AgentEvent::Output(e)) = rx.try_recv() {
            chunks.push(e.chunk);
        }
        assert_eq!(chunks, vec!["first", "second"]);
    }
}
