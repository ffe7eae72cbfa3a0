//! Coordinator-driven fan-out.
//!
//! The coordinator agent is told which agents exist and asked to print one
//! `SPAWN <agent>: <task>` line per sub-task. Its output is watched for those
//! lines and each new directive becomes a regular spawn.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use super::AgentSupervisor;
use crate::event::{AgentEvent, OutputKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateResult {
    pub success: bool,
    pub mock: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A delegation request found in coordinator output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Directive {
    pub agent: String,
    pub task: String,
}

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?im)\bspawn\s+(?:agent\s+)?["'`@]?([a-z0-9_-]+)["'`]?(?:\s*:|\s+with\s+task\s*:?)\s*(.+)$"#,
        )
        .expect("directive pattern is valid")
    })
}

/// Extract every delegation directive from a chunk of coordinator output.
///
/// Accepts `SPAWN coder: write the parser` and
/// `spawn agent coder with task "write the parser"`, one per line.
pub fn parse_directives(text: &str) -> Vec<Directive> {
    directive_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let agent = caps.get(1)?.as_str().to_string();
            let task = caps
                .get(2)?
                .as_str()
                .trim()
                .trim_matches(|c| c == '"' || c == '\'' || c == '`')
                .trim()
                .to_string();
            if task.is_empty() {
                None
            } else {
                Some(Directive { agent, task })
            }
        })
        .collect()
}

fn coordinator_brief(task: &str, agents: &[String]) -> String {
    let roster = if agents.is_empty() {
        "(none)".to_string()
    } else {
        agents.join(", ")
    };
    format!(
        "{task}\n\n\
         ---\n\
         You are coordinating a team. Available agents: {roster}.\n\
         Delegate sub-tasks by printing one line per sub-task in the form:\n\
         SPAWN <agent>: <sub-task>\n\
         Only delegate to the agents listed above."
    )
}

impl AgentSupervisor {
    /// Spawn the coordinator with `task` and fan out to the agents it names.
    ///
    /// `agents` restricts which agents may be spawned; `None` or an empty
    /// list uses the configured roster. The coordinator itself is never a
    /// valid target. Listening stops when the coordinator finishes or the
    /// agent timeout elapses, whichever comes first.
    pub async fn orchestrate(&self, task: &str, agents: Option<Vec<String>>) -> OrchestrateResult {
        let coordinator = self.inner.options.coordinator.clone();
        let roster: Vec<String> = agents
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| self.inner.options.orchestration_agents.clone())
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty() && !name.eq_ignore_ascii_case(&coordinator))
            .collect();

        // subscribe before spawning so no early directive is missed
        let events = self.subscribe();
        let spawned = self
            .spawn(&coordinator, &coordinator_brief(task, &roster))
            .await;
        if !spawned.success {
            return OrchestrateResult {
                success: false,
                mock: spawned.mock,
                error: spawned.error,
            };
        }

        info!(coordinator = %coordinator, agents = ?roster, "Orchestration started");
        let supervisor = self.clone();
        let pid = spawned.pid;
        tokio::spawn(async move {
            supervisor.fan_out(coordinator, pid, roster, events).await;
        });

        OrchestrateResult {
            success: true,
            mock: spawned.mock,
            error: None,
        }
    }

    /// Follows one coordinator instance, identified by `pid`. Another
    /// instance under the same name (an earlier run being evicted, or a later
    /// run replacing this one) never drives or stops this listener.
    async fn fan_out(
        &self,
        coordinator: String,
        pid: Option<u32>,
        roster: Vec<String>,
        mut events: broadcast::Receiver<AgentEvent>,
    ) {
        let mut seen: HashSet<Directive> = HashSet::new();
        let listen = async {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Orchestration listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                match event {
                    AgentEvent::Output(out)
                        if out.agent == coordinator
                            && matches!(out.kind, OutputKind::Stdout | OutputKind::Text) =>
                    {
                        if self.superseded(&coordinator, pid).await {
                            debug!(coordinator = %coordinator, ?pid, "Coordinator replaced, detaching");
                            break;
                        }
                        for directive in parse_directives(&out.chunk) {
                            self.dispatch(&roster, &mut seen, directive).await;
                        }
                    }
                    AgentEvent::Status(status)
                        if status.agent == coordinator
                            && status.pid == pid
                            && status.status.is_terminal() =>
                    {
                        break;
                    }
                    _ => {}
                }
            }
        };

        if tokio::time::timeout(self.inner.options.timeout, listen)
            .await
            .is_err()
        {
            debug!(coordinator = %coordinator, "Orchestration window elapsed");
        }
        info!(coordinator = %coordinator, spawned = seen.len(), "Orchestration listener detached");
    }

    /// Whether a different instance now runs under the coordinator's name.
    async fn superseded(&self, coordinator: &str, pid: Option<u32>) -> bool {
        matches!(self.active_pid(coordinator).await, Some(active) if active != pid)
    }

    async fn dispatch(&self, roster: &[String], seen: &mut HashSet<Directive>, directive: Directive) {
        let Some(agent) = roster
            .iter()
            .find(|name| name.eq_ignore_ascii_case(&directive.agent))
        else {
            debug!(agent = %directive.agent, "Ignoring directive for unknown agent");
            return;
        };
        let directive = Directive {
            agent: agent.clone(),
            task: directive.task,
        };
        if !seen.insert(directive.clone()) {
            return;
        }

        let result = self.spawn(&directive.agent, &directive.task).await;
        if result.success {
            info!(agent = %directive.agent, mock = result.mock, "Delegated sub-task");
        } else {
            warn!(agent = %directive.agent, error = ?result.error, "Delegation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(agent: &str, task: &str) -> Directive {
        Directive {
            agent: agent.into(),
            task: task.into(),
        }
    }

    #[test]
    fn test_parse_colon_form() {
        let text = "Plan:\nSPAWN coder: write the parser\nSPAWN reviewer: review it\n";
        assert_eq!(
            parse_directives(text),
            vec![d("coder", "write the parser"), d("reviewer", "review it")]
        );
    }

    #[test]
    fn test_parse_prose_form() {
        let text = r#"I will spawn agent researcher with task "find prior art""#;
        assert_eq!(parse_directives(text), vec![d("researcher", "find prior art")]);
        assert_eq!(
            parse_directives("spawn Writer with task: draft the README"),
            vec![d("Writer", "draft the README")]
        );
    }

    #[test]
    fn test_parse_ignores_plain_mentions() {
        assert!(parse_directives("we could spawn more processes later").is_empty());
        assert!(parse_directives("SPAWN coder:   ").is_empty());
    }

    #[test]
    fn test_brief_lists_agents() {
        let brief = coordinator_brief("ship it", &["coder".into(), "writer".into()]);
        assert!(brief.starts_with("ship it"));
        assert!(brief.contains("Available agents: coder, writer."));
        assert!(brief.contains("SPAWN <agent>: <sub-task>"));
    }
}
