//! In-process keyed store
//!
//! Honours per-key TTLs lazily: expired entries are dropped on access, by
//! [`MemoryRepository::purge_expired`], or periodically by the task from
//! [`MemoryRepository::spawn_sweeper`]. Used when no Redis URL is configured
//! and as the backing store in tests.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{Repository, StoreError};

/// Sweep period used by the service binary
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// `None` when the TTL does not fit in an `Instant`
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

fn purge(entries: &DashMap<String, Entry>) -> usize {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    before.saturating_sub(entries.len())
}

/// DashMap-backed [`Repository`]
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    entries: Arc<DashMap<String, Entry>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining time-to-live of `key`, if it is present and live
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at.map_or(Duration::MAX, |at| at - now))
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored entries, expired ones included
    pub fn stored_len(&self) -> usize {
        self.entries.len()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        purge(&self.entries)
    }

    /// Purge expired entries every `period` on a background task.
    ///
    /// The task ends by itself once every clone of the repository is dropped.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let entries: Weak<DashMap<String, Entry>> = Arc::downgrade(&self.entries);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(entries) = entries.upgrade() else {
                    break;
                };
                let removed = purge(&entries);
                if removed > 0 {
                    tracing::debug!(removed, remaining = entries.len(), "Purged expired entries");
                }
            }
        })
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone());

        match live {
            Some(value) if !value.is_empty() => Ok(value),
            Some(_) => Err(StoreError::NotFound(key.to_string())),
            None => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                Err(StoreError::NotFound(key.to_string()))
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let pattern: Vec<char> = pattern.chars().collect();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .filter(|entry| {
                let key: Vec<char> = entry.key().chars().collect();
                glob_match(&pattern, &key)
            })
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Match `text` against a glob supporting `*`, `?` and `\` escapes
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some(('\\', rest)) if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && glob_match(&rest[1..], &text[1..])
        }
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::escape_pattern;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    // ========================================================================
    // Glob Tests
    // ========================================================================

    #[test]
    fn test_glob_match_star() {
        assert!(glob_match(&chars("alice-*"), &chars("alice-1700000000")));
        assert!(glob_match(&chars("alice-*"), &chars("alice-")));
        assert!(!glob_match(&chars("alice-*"), &chars("alicex-1")));
        assert!(glob_match(&chars("*"), &chars("")));
    }

    #[test]
    fn test_glob_match_question_mark() {
        assert!(glob_match(&chars("a?c"), &chars("abc")));
        assert!(!glob_match(&chars("a?c"), &chars("ac")));
    }

    #[test]
    fn test_glob_match_escaped() {
        let pattern = format!("{}-*", escape_pattern("a*b"));
        assert!(glob_match(&chars(&pattern), &chars("a*b-1")));
        assert!(!glob_match(&chars(&pattern), &chars("axxb-1")));
    }

    // ========================================================================
    // Repository Tests
    // ========================================================================

    #[tokio::test]
    async fn test_set_then_get() {
        let repo = MemoryRepository::new();
        repo.set("k", "v", Duration::from_secs(60)).await.unwrap();

        assert_eq!(repo.get("k").await.unwrap(), "v");
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let repo = MemoryRepository::new();
        let err = repo.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_empty_value_is_not_found() {
        let repo = MemoryRepository::new();
        repo.set("k", "", Duration::from_secs(60)).await.unwrap();
        assert!(repo.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let repo = MemoryRepository::new();
        repo.set("k", "v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(repo.get("k").await.unwrap_err().is_not_found());
        assert!(repo.ttl("k").is_none());
        assert!(repo.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_reports_remaining_time() {
        let repo = MemoryRepository::new();
        repo.set("k", "v", Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(40)).await;

        assert_eq!(repo.ttl("k"), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let repo = MemoryRepository::new();
        repo.set("short", "v", Duration::from_secs(1)).await.unwrap();
        repo.set("long", "v", Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(repo.purge_expired(), 1);
        assert_eq!(repo.get("long").await.unwrap(), "v");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_abandoned_entries() {
        let repo = MemoryRepository::new();
        for i in 0..1000 {
            repo.set(&format!("session-{i}"), "v", Duration::from_secs(1))
                .await
                .unwrap();
        }
        repo.set("kept", "v", Duration::from_secs(3600)).await.unwrap();
        assert_eq!(repo.stored_len(), 1001);

        let sweeper = repo.spawn_sweeper(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(repo.len(), 1);
        assert_eq!(repo.stored_len(), 1);
        assert!(!sweeper.is_finished());
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_with_repository() {
        let repo = MemoryRepository::new();
        let sweeper = repo.spawn_sweeper(Duration::from_secs(1));
        drop(repo);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let repo = MemoryRepository::new();
        repo.set("k", "v", Duration::MAX).await.unwrap();

        assert_eq!(repo.get("k").await.unwrap(), "v");
        assert_eq!(repo.ttl("k"), Some(Duration::MAX));
        assert_eq!(repo.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_del_removes_and_is_idempotent() {
        let repo = MemoryRepository::new();
        repo.set("k", "v", Duration::from_secs(60)).await.unwrap();

        repo.del("k").await.unwrap();
        repo.del("k").await.unwrap();

        assert!(repo.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_keys_filters_by_pattern() {
        let repo = MemoryRepository::new();
        let ttl = Duration::from_secs(60);
        repo.set("alice-1", "a", ttl).await.unwrap();
        repo.set("alice-2", "b", ttl).await.unwrap();
        repo.set("bob-1", "c", ttl).await.unwrap();

        let keys = repo.keys("alice-*").await.unwrap();
        assert_eq!(keys, vec!["alice-1".to_string(), "alice-2".to_string()]);

        assert!(repo.keys("carol-*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let repo = MemoryRepository::new();
        let clone = repo.clone();
        repo.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(clone.get("k").await.unwrap(), "v");
    }
}
