//! Redis cache for multi-instance deployments
//!
//! Values are JSON strings written with `SET EX`; prefix invalidation walks
//! the keyspace with `SCAN` so the server is never blocked.

use super::CacheLayer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 100;

pub struct RedisCache {
    connection: MultiplexedConnection,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Open a multiplexed connection
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).context("Failed to create Redis client")?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { connection })
    }
}

/// SCAN pattern for a literal prefix
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl CacheLayer for RedisCache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.connection.clone();
        let json: Option<String> = conn
            .get(key)
            .await
            .context("Failed to get value from Redis")?;

        json.map(|json| serde_json::from_str(&json).context("Failed to deserialize cached value"))
            .transpose()
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(value).context("Failed to serialize cache value")?;
        let _: () = conn
            .set_ex(key, json, ttl.as_secs().max(1))
            .await
            .context("Failed to set value in Redis")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(key)
            .await
            .context("Failed to delete key from Redis")?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let pattern = prefix_pattern(prefix);
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .context("Failed to scan keys in Redis")?;

            if !keys.is_empty() {
                let _: () = conn
                    .del(&keys)
                    .await
                    .context("Failed to delete keys from Redis")?;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[test]
    fn test_prefix_pattern_escapes_glob() {
        assert_eq!(prefix_pattern("items:"), "items:*");
        assert_eq!(prefix_pattern("a*b?"), "a\\*b\\?*");
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_roundtrip_and_prefix_delete() {
        let cache = RedisCache::connect(&redis_url()).await.unwrap();
        let ttl = Duration::from_secs(60);

        cache.set("akimori-test:items:1", &1i64, ttl).await.unwrap();
        cache.set("akimori-test:offers:1", &2i64, ttl).await.unwrap();
        assert_eq!(cache.get::<i64>("akimori-test:items:1").await.unwrap(), Some(1));

        cache.delete_prefix("akimori-test:items:").await.unwrap();
        assert_eq!(cache.get::<i64>("akimori-test:items:1").await.unwrap(), None);
        assert_eq!(cache.get::<i64>("akimori-test:offers:1").await.unwrap(), Some(2));

        cache.delete("akimori-test:offers:1").await.unwrap();
    }
}
