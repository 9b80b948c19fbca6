//! Keyed stores with per-key time-to-live
//!
//! The token authority keeps three independent logical stores (access tokens,
//! refresh tokens, flows). Each one is a [`Repository`]; callers namespace
//! their keys by choosing a separate instance per logical store.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::core::context::Interrupted;

pub use self::memory::MemoryRepository;
pub use self::redis::RedisRepository;

/// Keyed store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("value not found for key {0}")]
    NotFound(String),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Contract of a remote keyed store with per-key expiration
#[async_trait]
pub trait Repository: Send + Sync {
    /// Retrieve the value stored under `key`.
    ///
    /// A missing, expired or empty value is reported as [`StoreError::NotFound`].
    async fn get(&self, key: &str) -> Result<String, StoreError>;

    /// Store `value` under `key`, expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// List keys matching a glob `pattern` (`*`, `?`, `\` escapes)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// Escape glob metacharacters so `literal` only matches itself in [`Repository::keys`]
pub fn escape_pattern(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_pattern_plain() {
        assert_eq!(escape_pattern("alice"), "alice");
    }

    #[test]
    fn test_escape_pattern_metacharacters() {
        assert_eq!(escape_pattern("a*b?c"), r"a\*b\?c");
        assert_eq!(escape_pattern("[x]"), r"\[x\]");
        assert_eq!(escape_pattern(r"a\b"), r"a\\b");
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(
            StoreError::NotFound("abc".to_string()).to_string(),
            "value not found for key abc"
        );
        assert_eq!(
            StoreError::from(Interrupted::DeadlineExceeded).to_string(),
            "deadline exceeded"
        );
        assert!(StoreError::NotFound("k".to_string()).is_not_found());
        assert!(!StoreError::Backend("boom".to_string()).is_not_found());
    }
}
