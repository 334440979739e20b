//! Sliding-window rate limiting for login
//!
//! Two independent windows:
//! - failed attempts per username (5 per 15 minutes), cleared on success
//! - requests per client IP (10 per minute)

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use tokio::sync::RwLock;

/// `max` events within `window`
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max: usize,
    pub window: Duration,
}

/// Event timestamps per key
struct Window<K> {
    limit: RateLimit,
    events: RwLock<HashMap<K, Vec<DateTime<Utc>>>>,
}

impl<K: Eq + Hash> Window<K> {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            events: RwLock::new(HashMap::new()),
        }
    }

    async fn is_limited(&self, key: K, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.limit.window;
        let mut events = self.events.write().await;
        let Some(times) = events.get_mut(&key) else {
            return false;
        };
        times.retain(|time| *time > cutoff);
        times.len() >= self.limit.max
    }

    async fn record(&self, key: K, now: DateTime<Utc>) {
        self.events.write().await.entry(key).or_default().push(now);
    }

    async fn clear(&self, key: &K) {
        self.events.write().await.remove(key);
    }

    async fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - self.limit.window;
        self.events.write().await.retain(|_, times| {
            times.retain(|time| *time > cutoff);
            !times.is_empty()
        });
    }
}

/// Login rate limiter shared by all requests
pub struct LoginRateLimiter {
    usernames: Window<String>,
    ips: Window<IpAddr>,
}

impl LoginRateLimiter {
    pub fn new() -> Self {
        Self::with_limits(
            RateLimit {
                max: 5,
                window: Duration::minutes(15),
            },
            RateLimit {
                max: 10,
                window: Duration::minutes(1),
            },
        )
    }

    pub fn with_limits(per_username: RateLimit, per_ip: RateLimit) -> Self {
        Self {
            usernames: Window::new(per_username),
            ips: Window::new(per_ip),
        }
    }

    /// Too many recent failures for this login (case-insensitive)
    pub async fn is_username_limited(&self, username: &str) -> bool {
        self.usernames
            .is_limited(username.to_lowercase(), Utc::now())
            .await
    }

    pub async fn record_failed_attempt(&self, username: &str) {
        self.usernames
            .record(username.to_lowercase(), Utc::now())
            .await;
    }

    /// Forget failures after a successful login
    pub async fn clear_username_attempts(&self, username: &str) {
        self.usernames.clear(&username.to_lowercase()).await;
    }

    pub async fn is_ip_limited(&self, ip: IpAddr) -> bool {
        self.ips.is_limited(ip, Utc::now()).await
    }

    pub async fn record_ip_request(&self, ip: IpAddr) {
        self.ips.record(ip, Utc::now()).await;
    }

    /// Drop expired entries; run periodically
    pub async fn cleanup(&self) {
        let now = Utc::now();
        self.usernames.prune(now).await;
        self.ips.prune(now).await;
    }
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
