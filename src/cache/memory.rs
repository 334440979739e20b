//! In-process cache on moka
//!
//! Values are stored as JSON so any serializable type fits, and every entry
//! carries its own time-to-live.

use super::CacheLayer;
use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_MAX_CAPACITY: u64 = 10_000;

#[derive(Clone)]
struct CacheEntry {
    json: Arc<str>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was stored with
struct PerEntryTtl;

impl Expiry<String, CacheEntry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &CacheEntry, _now: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &CacheEntry,
        _now: Instant,
        _current: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

pub struct MemoryCache {
    cache: Cache<String, CacheEntry>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_CAPACITY)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    /// Approximate entry count; pending maintenance may lag
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheLayer for MemoryCache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        let Some(entry) = self.cache.get(key).await else {
            return Ok(None);
        };
        let value = serde_json::from_str(&entry.json)
            .with_context(|| format!("Failed to deserialize cache entry {}", key))?;
        Ok(Some(value))
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let json = serde_json::to_string(value).context("Failed to serialize cache value")?;
        let entry = CacheEntry {
            json: json.into(),
            ttl,
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        for key in keys {
            self.cache.invalidate(&key).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache
            .set("items:slug:fox", &42i64, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get::<i64>("items:slug:fox").await.unwrap(), Some(42));

        cache.delete("items:slug:fox").await.unwrap();
        assert_eq!(cache.get::<i64>("items:slug:fox").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire_individually() {
        let cache = MemoryCache::new();
        cache
            .set("short", &"a".to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        cache
            .set("long", &"b".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.get::<String>("short").await.unwrap(), None);
        assert_eq!(cache.get::<String>("long").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_prefix_keeps_other_namespaces() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        for key in ["items:list:all", "items:slug:fox", "offers:list"] {
            cache.set(key, &1i64, ttl).await.unwrap();
        }

        cache.delete_prefix("items:").await.unwrap();
        assert_eq!(cache.get::<i64>("items:list:all").await.unwrap(), None);
        assert_eq!(cache.get::<i64>("items:slug:fox").await.unwrap(), None);
        assert_eq!(cache.get::<i64>("offers:list").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_structured_values() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Offer {
            id: i64,
            price: i64,
            tags: Vec<String>,
        }

        let cache = MemoryCache::new();
        let offer = Offer {
            id: 7,
            price: 120,
            tags: vec!["limited".into()],
        };
        cache.set("offers:7", &offer, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get::<Offer>("offers:7").await.unwrap(), Some(offer));

        // A type mismatch surfaces as an error, not a silent miss
        assert!(cache.get::<i64>("offers:7").await.is_err());
    }

    proptest! {
        #[test]
        fn stored_strings_read_back(key in "[a-z:]{1,20}", value in ".*") {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let cache = MemoryCache::new();
                cache.set(&key, &value, Duration::from_secs(60)).await.unwrap();
                let read: Option<String> = cache.get(&key).await.unwrap();
                assert_eq!(read, Some(value.clone()));
            });
        }
    }
}
