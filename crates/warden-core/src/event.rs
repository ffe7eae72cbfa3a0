use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle state of an agent instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Working,
    Done,
    Error,
    Timeout,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Working => "working",
            AgentStatus::Done => "done",
            AgentStatus::Error => "error",
            AgentStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentStatus::Working)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Text,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSubtype {
    Spawn,
    Runtime,
    Timeout,
    Exit,
}

/// A piece of agent output, already classified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub agent: String,
    pub chunk: String,
    pub kind: OutputKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub agent: String,
    /// Identifies the instance when a name is reused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub is_mock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub agent: String,
    pub error: String,
    pub subtype: ErrorSubtype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum AgentEvent {
    Output(OutputEvent),
    Status(StatusEvent),
    Error(ErrorEvent),
}

impl AgentEvent {
    pub fn agent(&self) -> &str {
        match self {
            AgentEvent::Output(e) => &e.agent,
            AgentEvent::Status(e) => &e.agent,
            AgentEvent::Error(e) => &e.agent,
        }
    }
}

/// Fan-out channel for supervisor events. Subscribers that fall more than
/// `capacity` events behind observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }

    pub fn output(&self, agent: &str, kind: OutputKind, chunk: impl Into<String>) {
        self.publish(AgentEvent::Output(OutputEvent {
            agent: agent.to_string(),
            chunk: chunk.into(),
            kind,
        }));
    }

    pub fn status(&self, event: StatusEvent) {
        self.publish(AgentEvent::Status(event));
    }

    pub fn error(
        &self,
        agent: &str,
        subtype: ErrorSubtype,
        error: impl Into<String>,
        exit_code: Option<i32>,
    ) {
        self.publish(AgentEvent::Error(ErrorEvent {
            agent: agent.to_string(),
            error: error.into(),
            subtype,
            exit_code,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag_and_camel_case() {
        let event = AgentEvent::Status(StatusEvent {
            agent: "x".into(),
            pid: Some(42),
            status: AgentStatus::Error,
            exit_code: Some(2),
            error_message: None,
            is_mock: false,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["status"], "error");
        assert_eq!(json["exitCode"], 2);
        assert_eq!(json["isMock"], false);
        assert_eq!(json["pid"], 42);
        assert!(json.get("errorMessage").is_none());
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.output("a", OutputKind::Stdout, "hello");
        bus.error("a", ErrorSubtype::Exit, "exited", Some(1));

        match rx.recv().await.unwrap() {
            AgentEvent::Output(e) => {
                assert_eq!(e.chunk, "hello");
                assert_eq!(e.kind, OutputKind::Stdout);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let next = rx.recv().await.unwrap();
        assert_eq!(next.agent(), "a");
        assert!(matches!(
            next,
            AgentEvent::Error(ErrorEvent {
                subtype: ErrorSubtype::Exit,
                exit_code: Some(1),
                ..
            })
        ));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(1);
        bus.output("a", OutputKind::Text, "dropped");
    }

    #[test]
    fn terminal_states() {
        assert!(!AgentStatus::Working.is_terminal());
        assert!(AgentStatus::Done.is_terminal());
        assert!(AgentStatus::Timeout.is_terminal());
        assert_eq!(AgentStatus::Timeout.as_str(), "timeout");
    }
}
