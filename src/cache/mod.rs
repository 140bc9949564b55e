//! Result cache keyed by a fingerprint of the task text.
//!
//! The cache is advisory: a miss, an expired entry and a broken backend
//! all look the same to callers. Backend errors are logged and swallowed.

mod memory;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::task::{AgentMessage, TaskId, TaskMetrics};

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

const KEY_PREFIX: &str = "research:task:";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend: {0}")]
    Backend(String),

    #[error("cache payload: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Key-value storage with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every key starting with `prefix`. Returns how many were removed.
    async fn clear_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    fn name(&self) -> &'static str;
}

/// What a completed run leaves behind for later identical submissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub source_task_id: TaskId,
    pub messages: Vec<AgentMessage>,
    pub metrics: TaskMetrics,
    pub cached_at: DateTime<Utc>,
}

/// Trim, collapse whitespace runs, lowercase.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cache key for a task text.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(normalize(text).as_bytes());
    format!("{KEY_PREFIX}{}", hex::encode(digest))
}

#[derive(Clone)]
pub struct ResultCache {
    backend: Option<Arc<dyn CacheBackend>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend: Some(backend),
            ttl,
        }
    }

    /// A cache that never hits and never stores.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            ttl: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map(|b| b.name()).unwrap_or("off")
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, text: &str) -> Option<CachedResult> {
        let backend = self.backend.as_ref()?;
        let key = fingerprint(text);
        let raw = match backend.get(&key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }

    pub async fn put(&self, text: &str, result: &CachedResult) {
        let Some(backend) = &self.backend else {
            return;
        };
        let key = fingerprint(text);
        let written = match serde_json::to_string(result) {
            Ok(value) => backend.set(&key, value, self.ttl).await,
            Err(e) => Err(e.into()),
        };
        match written {
            Ok(()) => tracing::debug!(key = %key, ttl_secs = self.ttl.as_secs(), "Cached result"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Cache write failed"),
        }
    }

    pub async fn invalidate(&self, text: &str) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.delete(&fingerprint(text)).await {
                tracing::warn!(error = %e, "Cache delete failed");
            }
        }
    }

    /// Drop every cached research result.
    pub async fn clear(&self) -> u64 {
        let Some(backend) = &self.backend else {
            return 0;
        };
        match backend.clear_prefix(KEY_PREFIX).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Cache clear failed");
                0
            }
        }
    }

    /// `None` when disabled.
    pub async fn ping(&self) -> Option<Result<(), CacheError>> {
        match &self.backend {
            Some(backend) => Some(backend.ping().await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CachedResult {
        CachedResult {
            source_task_id: TaskId::new(),
            messages: vec![AgentMessage {
                agent: "Researcher".into(),
                content: "facts".into(),
                order: 0,
                token_count: Some(1),
                tool_calls: vec![],
                created_at: Utc::now(),
            }],
            metrics: TaskMetrics {
                input_tokens: 1,
                output_tokens: 1,
                total_tokens: 2,
                estimated_cost: 0.0,
                duration_secs: 0.1,
                total_messages: 1,
                model: "llama3.2".into(),
                by_role: Default::default(),
            },
            cached_at: Utc::now(),
        }
    }

    /// Backend that fails every call.
    struct Broken;

    #[async_trait]
    impl CacheBackend for Broken {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn clear_prefix(&self, _prefix: &str) -> Result<u64, CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        async fn ping(&self) -> Result<(), CacheError> {
            Err(CacheError::Backend("down".into()))
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn test_fingerprint_normalizes() {
        let key = fingerprint("Explain X");
        assert!(key.starts_with("research:task:"));
        assert_eq!(key.len(), KEY_PREFIX.len() + 64);
        assert_eq!(key, fingerprint("  explain \t\n x  "));
        assert_ne!(key, fingerprint("Explain Y"));
        assert_eq!(normalize("  A   b\tC "), "a b c");
    }

    #[tokio::test]
    async fn test_identical_text_hits() {
        let cache = ResultCache::new(Arc::new(MemoryCache::new()), Duration::from_secs(3600));
        let result = sample();
        assert!(cache.get("Explain X").await.is_none());
        cache.put("Explain X", &result).await;
        assert_eq!(cache.get("explain   x").await, Some(result));
        assert!(cache.get("Explain Z").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = ResultCache::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));
        cache.put("Explain X", &sample()).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("Explain X").await.is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("Explain X").await.is_none());
    }

    #[tokio::test]
    async fn test_backend_errors_are_swallowed() {
        let cache = ResultCache::new(Arc::new(Broken), Duration::from_secs(60));
        cache.put("Explain X", &sample()).await;
        assert!(cache.get("Explain X").await.is_none());
        assert_eq!(cache.clear().await, 0);
        assert!(matches!(cache.ping().await, Some(Err(_))));
    }

    #[tokio::test]
    async fn test_disabled_cache() {
        let cache = ResultCache::disabled();
        cache.put("Explain X", &sample()).await;
        assert!(cache.get("Explain X").await.is_none());
        assert_eq!(cache.backend_name(), "off");
        assert!(cache.ping().await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = ResultCache::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));
        cache.put("a", &sample()).await;
        cache.put("b", &sample()).await;
        cache.invalidate("a").await;
        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.clear().await, 1);
        assert!(cache.get("b").await.is_none());
    }
}
