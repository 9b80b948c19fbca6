//! Redis-backed keyed store
//!
//! One [`RedisRepository`] per logical store; all instances may share a single
//! [`ConnectionManager`]. Keys are stored as `<prefix><key>`.

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use super::{Repository, StoreError, escape_pattern};

/// Key prefix of the refresh-token-to-access-token store
pub const ACCESS_TOKEN_PREFIX: &str = "auth:access:";
/// Key prefix of the session-key-to-refresh-token store
pub const REFRESH_TOKEN_PREFIX: &str = "auth:refresh:";
/// Key prefix of the session-key-to-flow store
pub const FLOW_PREFIX: &str = "auth:flow:";

const SCAN_BATCH: usize = 100;

/// Open a connection manager for `redis_url`
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;
    tracing::debug!("redis connection manager ready");
    Ok(manager)
}

/// [`Repository`] over a Redis connection, namespaced by a key prefix
#[derive(Clone)]
pub struct RedisRepository {
    prefix: String,
    manager: ConnectionManager,
}

impl RedisRepository {
    pub fn new(prefix: impl Into<String>, manager: ConnectionManager) -> Self {
        Self {
            prefix: prefix.into(),
            manager,
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

/// Redis rejects `EX 0`; round sub-second TTLs up to one second
fn expiry_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl Repository for RedisRepository {
    async fn get(&self, key: &str) -> Result<String, StoreError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(self.namespaced(key)).await?;

        match value {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .arg("EX")
            .arg(expiry_seconds(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(self.namespaced(key)).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        let full_pattern = format!("{}{}", escape_pattern(&self.prefix), pattern);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string)),
            );

            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
