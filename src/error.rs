//! Error taxonomy shared by the orchestrator, the queue and the API.
//!
//! Every error raised inside a worker run is eventually flattened into the
//! task's `error` column; the variant only decides whether the queue may try
//! again and which HTTP status a synchronous caller sees.

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;
use crate::task::TaskId;

#[derive(Debug, Error)]
pub enum ResearchError {
    /// Bad input. Rejected before any task exists; never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Model gateway unreachable, rate limited or answering with an error.
    #[error("model gateway error: {message}")]
    Upstream { message: String, transient: bool },

    /// The run exceeded its wall-clock deadline.
    #[error("research run exceeded the {}s time limit", .0.as_secs())]
    Timeout(Duration),

    #[error("task {0} not found")]
    NotFound(TaskId),

    /// The task store could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// The model kept answering with nothing usable.
    #[error("agent {role} produced no usable output after {attempts} attempts")]
    MalformedOutput { role: String, attempts: u32 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ResearchError {
    /// Whether the queue may deliver the job again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { transient, .. } => *transient,
            Self::Storage(_) => true,
            _ => false,
        }
    }
}

impl From<StoreError> for ResearchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<LlmError> for ResearchError {
    fn from(err: LlmError) -> Self {
        Self::Upstream {
            transient: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

pub type ResearchResult<T> = Result<T, ResearchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmErrorKind;

    #[test]
    fn test_retryable_classification() {
        assert!(ResearchError::Storage("db locked".into()).is_retryable());
        assert!(ResearchError::Upstream {
            message: "503".into(),
            transient: true
        }
        .is_retryable());
        assert!(!ResearchError::Upstream {
            message: "401".into(),
            transient: false
        }
        .is_retryable());
        assert!(!ResearchError::Validation("empty".into()).is_retryable());
        assert!(!ResearchError::Timeout(Duration::from_secs(600)).is_retryable());
    }

    #[test]
    fn test_llm_error_maps_to_upstream() {
        let err: ResearchError = LlmError::new(LlmErrorKind::RateLimited, "slow down").into();
        match err {
            ResearchError::Upstream { transient, message } => {
                assert!(transient);
                assert!(message.contains("slow down"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_message_mentions_limit() {
        let err = ResearchError::Timeout(Duration::from_secs(600));
        assert_eq!(err.to_string(), "research run exceeded the 600s time limit");
    }
}
