//! Research task records and their lifecycle.
//!
//! # State machine
//! ```text
//! queued ──claim──▶ processing ──▶ completed
//!                       │
//!                       └────────▶ failed
//! ```
//! `completed` and `failed` are terminal: once there, neither the status nor
//! the message list of a task changes again.

mod export;

pub use export::render_markdown;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of one queue delivery, kept on the task for correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The only legal edges of the lifecycle.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Where a processing task currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Agent whose turn is running.
    pub role: String,
    /// 0-based turn index.
    pub turn: u32,
    /// Turn limit of the run.
    pub max_turns: u32,
}

/// One tool invocation made during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: serde_json::Value,
    pub output: String,
}

/// One agent turn, persisted in conversation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub agent: String,
    pub content: String,
    pub order: u32,
    pub token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// USD, rounded to 6 decimals.
    pub estimated_cost: f64,
    pub duration_secs: f64,
    pub total_messages: u32,
    pub model: String,
    #[serde(default)]
    pub by_role: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub job_id: Option<JobId>,
    pub error: Option<String>,
    pub from_cache: bool,
    pub progress: Option<Progress>,
}

impl Task {
    /// A fresh task waiting for a worker.
    pub fn queued(text: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            id: TaskId::new(),
            text: text.into(),
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            user_id,
            job_id: None,
            error: None,
            from_cache: false,
            progress: None,
        }
    }
}

/// A task together with its messages and metrics, as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub messages: Vec<AgentMessage>,
    pub metrics: Option<TaskMetrics>,
}

/// Validate and normalise submitted text. Returns the trimmed text.
pub fn validate_task_text(text: &str, max_chars: usize) -> Result<String, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("Task is required".to_string());
    }
    let len = trimmed.chars().count();
    if len > max_chars {
        return Err(format!(
            "Task text too long ({len} characters, max {max_chars})"
        ));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Processing.can_transition_to(Queued));
        for terminal in [Completed, Failed] {
            assert!(terminal.is_terminal());
            for next in [Queued, Processing, Completed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("pending".parse::<TaskStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&TaskStatus::Processing).unwrap(),
            "\"processing\""
        );
    }

    #[test]
    fn test_validate_task_text() {
        assert!(validate_task_text("", 5000).is_err());
        assert!(validate_task_text("   \n\t", 5000).is_err());
        assert_eq!(validate_task_text("  Explain X ", 5000).unwrap(), "Explain X");
        assert!(validate_task_text(&"a".repeat(5000), 5000).is_ok());
        assert!(validate_task_text(&"a".repeat(5001), 5000).is_err());
        // Length counts characters, not bytes.
        assert!(validate_task_text(&"é".repeat(5000), 5000).is_ok());
    }

    #[test]
    fn test_detail_flattens_task_fields() {
        let detail = TaskDetail {
            task: Task::queued("Explain X", None),
            messages: vec![],
            metrics: None,
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["text"], "Explain X");
        assert!(json["messages"].as_array().unwrap().is_empty());
    }
}
