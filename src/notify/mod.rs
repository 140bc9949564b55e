//! Task event fan-out for live clients.
//!
//! Events are hints: a receiver that falls behind loses events and is
//! expected to poll the durable task state instead.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::task::{AgentMessage, Progress, TaskId, TaskMetrics};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Completed,
    Failed,
}

/// One lifecycle event of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub event: EventKind,
    pub payload: Value,
}

impl TaskEvent {
    /// A turn is about to run.
    pub fn turn_started(task_id: TaskId, progress: &Progress) -> Self {
        Self {
            task_id,
            event: EventKind::Progress,
            payload: json!({
                "stage": "turn_started",
                "role": progress.role,
                "turn": progress.turn,
                "max_turns": progress.max_turns,
            }),
        }
    }

    /// A turn finished and its message is stored.
    pub fn message(task_id: TaskId, message: &AgentMessage) -> Self {
        Self {
            task_id,
            event: EventKind::Progress,
            payload: json!({ "stage": "message", "message": message }),
        }
    }

    pub fn completed(task_id: TaskId, metrics: &TaskMetrics, from_cache: bool) -> Self {
        Self {
            task_id,
            event: EventKind::Completed,
            payload: json!({ "metrics": metrics, "from_cache": from_cache }),
        }
    }

    pub fn failed(task_id: TaskId, error: &str) -> Self {
        Self {
            task_id,
            event: EventKind::Failed,
            payload: json!({ "error": error }),
        }
    }
}

/// Broadcasts task events to every subscriber.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<TaskEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers the event reached.
    pub fn publish(&self, event: TaskEvent) -> usize {
        tracing::trace!(task_id = %event.task_id, event = ?event.event, "Publishing task event");
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notifier = Notifier::new();
        assert_eq!(notifier.publish(TaskEvent::failed(TaskId::new(), "x")), 0);

        let mut rx = notifier.subscribe();
        let id = TaskId::new();
        assert_eq!(notifier.publish(TaskEvent::failed(id, "boom")), 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, id);
        assert_eq!(event.event, EventKind::Failed);
        assert_eq!(event.payload["error"], "boom");
    }

    #[tokio::test]
    async fn test_slow_receiver_lags() {
        let notifier = Notifier::with_capacity(2);
        let mut rx = notifier.subscribe();
        let id = TaskId::new();
        for turn in 0..4 {
            notifier.publish(TaskEvent::turn_started(
                id,
                &Progress {
                    role: "Researcher".into(),
                    turn,
                    max_turns: 12,
                },
            ));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.payload["turn"], 2);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = TaskEvent::failed(TaskId::new(), "timeout");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "failed");
        assert!(json["task_id"].is_string());
    }
}
