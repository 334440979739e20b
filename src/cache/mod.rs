//! Cache layer
//!
//! Read-through caching for the item catalog and shop offer listings:
//! - In-memory cache (moka), the default for a single instance
//! - Redis cache behind the `redis-cache` feature
//!
//! Keys are namespaced (`items:`, `offers:`) so that a write can drop a whole
//! namespace with [`CacheLayer::delete_prefix`].

pub mod memory;
#[cfg(feature = "redis-cache")]
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, CacheDriver};

pub use memory::MemoryCache;
#[cfg(feature = "redis-cache")]
pub use redis::RedisCache;

/// Namespace of catalog item entries
pub const ITEMS_PREFIX: &str = "items:";

/// Namespace of shop offer entries
pub const OFFERS_PREFIX: &str = "offers:";

/// Cache backend operations.
///
/// The generic methods keep this trait off `dyn`; use [`Cache`] for runtime
/// selection.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>>;

    /// Store a value for `ttl`, replacing any previous one
    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T, ttl: Duration)
        -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop every key starting with `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

/// The configured cache backend
#[derive(Debug)]
pub enum Cache {
    Memory(MemoryCache),
    #[cfg(feature = "redis-cache")]
    Redis(RedisCache),
}

impl Cache {
    /// Cached value under `key`, or `load()` stored for `ttl`.
    ///
    /// Cache failures are logged and fall through to the loader.
    pub async fn get_or_load<T, E, F, Fut>(&self, key: &str, ttl: Duration, load: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        match self.get::<T>(key).await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => tracing::warn!(key, error = %e, "Cache read failed"),
        }

        let value = load().await?;
        if let Err(e) = self.set(key, &value, ttl).await {
            tracing::warn!(key, error = %e, "Cache write failed");
        }
        Ok(value)
    }

    /// Drop a namespace, logging instead of failing the caller's write
    pub async fn invalidate(&self, prefix: &str) {
        if let Err(e) = self.delete_prefix(prefix).await {
            tracing::warn!(prefix, error = %e, "Cache invalidation failed");
        }
    }
}

#[async_trait]
impl CacheLayer for Cache {
    async fn get<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self {
            Cache::Memory(cache) => cache.get(key).await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.get(key).await,
        }
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        match self {
            Cache::Memory(cache) => cache.set(key, value, ttl).await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            Cache::Memory(cache) => cache.delete(key).await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.delete(key).await,
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        match self {
            Cache::Memory(cache) => cache.delete_prefix(prefix).await,
            #[cfg(feature = "redis-cache")]
            Cache::Redis(cache) => cache.delete_prefix(prefix).await,
        }
    }
}

/// Build the cache backend selected in the configuration
///
/// # Errors
/// - Redis is configured but the `redis-cache` feature is not enabled
/// - Redis is configured without a URL, or the connection fails
pub async fn create_cache(config: &CacheConfig) -> Result<Arc<Cache>> {
    match config.driver {
        CacheDriver::Memory => Ok(Arc::new(Cache::Memory(MemoryCache::with_capacity(10_000)))),
        CacheDriver::Redis => {
            #[cfg(feature = "redis-cache")]
            {
                let redis_url = config.redis_url.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "Redis URL is required when using the Redis cache driver. \
                         Set 'cache.redis_url' or AKIMORI_CACHE_REDIS_URL."
                    )
                })?;
                let cache = RedisCache::connect(redis_url).await?;
                Ok(Arc::new(Cache::Redis(cache)))
            }

            #[cfg(not(feature = "redis-cache"))]
            {
                anyhow::bail!(
                    "Redis cache driver is configured but the 'redis-cache' feature is not enabled. \
                     Either enable the feature with `--features redis-cache` or use the 'memory' driver."
                )
            }
        }
    }
}

/// Entry lifetime from the configuration
pub fn ttl_from_config(config: &CacheConfig) -> Duration {
    Duration::from_secs(config.ttl_seconds.max(1))
}
