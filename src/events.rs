//! Typed event stream shared by the logger, the UI collaborator, and the
//! conflict resolver.
//!
//! Events fan out through a broadcast channel: every subscriber gets its own
//! receiver and reads at its own pace. The orchestrator never blocks on a
//! subscriber; a lagging receiver drops the oldest events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the broadcast ring buffer per subscriber.
const BUS_CAPACITY: usize = 1024;

/// Events emitted during session execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// An iteration has started.
    IterationStart {
        iteration: u32,
        task_ids: Vec<String>,
        started_at: DateTime<Utc>,
    },
    /// A chunk of agent stdout was observed.
    AgentStdout { iteration: u32, chunk: String },
    /// A merge produced conflicts.
    ConflictDetected { files: Vec<String> },
    /// The agent was invoked to resolve one conflicted file.
    ConflictAiResolving { path: String },
    /// One conflicted file was resolved.
    ConflictResolved {
        path: String,
        strategy: String,
        confidence: f64,
    },
    /// Conflict resolution gave up on a file.
    ConflictFailed { path: String, reason: String },
    /// A task was closed in the tracker.
    TaskClosed { task_id: String, reason: String },
    /// An iteration finished.
    IterationEnd {
        iteration: u32,
        success: bool,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
    /// Session lifecycle status changed.
    SessionStatus { status: String },
}

/// Fan-out bus for [`OrchestratorEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Succeeds even when nobody is subscribed.
    pub fn emit(&self, event: OrchestratorEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the stream from this point onward.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(OrchestratorEvent::TaskClosed {
            task_id: "TEST-001".into(),
            reason: "done".into(),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                OrchestratorEvent::TaskClosed { task_id, .. } => {
                    assert_eq!(task_id, "TEST-001");
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_fail() {
        let bus = EventBus::new();
        bus.emit(OrchestratorEvent::SessionStatus {
            status: "running".into(),
        });
    }

    #[test]
    fn event_serialization_is_tagged() {
        let event = OrchestratorEvent::IterationStart {
            iteration: 1,
            task_ids: vec!["TEST-001".into()],
            started_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"iteration_start\""));
        assert!(json.contains("TEST-001"));
    }
}
