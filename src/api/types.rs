//! Request and response bodies of the HTTP API.

use serde::{Deserialize, Serialize};

use crate::config::PublicConfig;
use crate::task::{JobId, Progress, TaskDetail, TaskId, TaskStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    /// Missing and blank are both rejected by validation.
    #[serde(default)]
    pub task: String,
    /// Look in the result cache first. Defaults to true.
    #[serde(default)]
    pub use_cache: Option<bool>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// 202 body: the task is queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAccepted {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub status: TaskStatus,
}

/// 200 body: answered from the result cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCached {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub from_cache: bool,
    pub task: TaskDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message_count: u32,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub status: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: String,
    pub cache: String,
    pub queue_pending: usize,
    pub subscribers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigResponse {
    #[serde(flatten)]
    pub config: PublicConfig,
    pub provider: String,
    pub cache_enabled: bool,
}
