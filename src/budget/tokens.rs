use std::sync::Arc;

use tiktoken_rs::{cl100k_base, CoreBPE};

/// Shared tokenizer handle.
///
/// Falls back to a four-characters-per-token estimate if the BPE tables
/// cannot be loaded, so counting never fails.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Option<Arc<CoreBPE>>,
}

impl TokenCounter {
    pub fn new() -> Self {
        match cl100k_base() {
            Ok(bpe) => Self {
                bpe: Some(Arc::new(bpe)),
            },
            Err(e) => {
                tracing::warn!(error = %e, "cl100k tokenizer unavailable; estimating token counts");
                Self::estimating()
            }
        }
    }

    /// Character-based estimate only.
    pub fn estimating() -> Self {
        Self { bpe: None }
    }

    pub fn count(&self, text: &str) -> u64 {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => (text.chars().count() as u64).div_ceil(4),
        }
    }

    /// Sum of `count` over several pieces of text.
    pub fn count_all<'a, I>(&self, texts: I) -> u64
    where
        I: IntoIterator<Item = &'a str>,
    {
        texts.into_iter().map(|t| self.count(t)).sum()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("bpe", &self.bpe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_tokens() {
        let counter = TokenCounter::new();
        assert_eq!(counter.count(""), 0);
        assert!(counter.count("hello world") >= 2);
        assert!(counter.count(&"word ".repeat(200)) > counter.count("word"));
    }

    #[test]
    fn test_estimating_counter() {
        let counter = TokenCounter::estimating();
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
        assert_eq!(counter.count_all(["abcd", "abcd"]), 2);
    }
}
