use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Once the in-process counter map holds this many keys, `increment`
/// sweeps expired counters itself every `INLINE_SWEEP_EVERY` calls.
const COUNTER_SWEEP_THRESHOLD: usize = 10_000;
const INLINE_SWEEP_EVERY: u64 = 256;

/// Entry stored in the local DashMap with an expiry timestamp.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    value: String,
    pub(crate) expires_at: Instant,
}

/// Fixed-window counter kept in-process when no Redis tier is configured.
#[derive(Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

/// Two-tier TTL cache: in-memory DashMap (tier 1) optionally backed by
/// Redis (tier 2). Postgres stays the source of truth and is handled by
/// callers.
///
/// Without Redis the cache is single-node: values and counters live only
/// in this process. Local entries are checked on read and evicted lazily;
/// `evict_expired()` sweeps them in bulk and should run from a background
/// task every minute. Counter growth is also bounded inline.
#[derive(Clone)]
pub struct TieredCache {
    pub(crate) local: Arc<DashMap<String, CacheEntry>>,
    counters: Arc<DashMap<String, Counter>>,
    increments: Arc<AtomicU64>,
    redis: Option<ConnectionManager>,
}

impl TieredCache {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            counters: Arc::new(DashMap::new()),
            increments: Arc::new(AtomicU64::new(0)),
            redis: Some(redis),
        }
    }

    /// Cache without a shared tier.
    pub fn local_only() -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            counters: Arc::new(DashMap::new()),
            increments: Arc::new(AtomicU64::new(0)),
            redis: None,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // tier 1: in-memory (with TTL check)
        if let Some(entry) = self.local.get(key) {
            if Instant::now() < entry.expires_at {
                return serde_json::from_str(&entry.value).ok();
            }
            // expired: drop the ref before removing
            drop(entry);
            self.local.remove(key);
        }

        // tier 2: redis
        let mut conn = self.redis.clone()?;
        if let Ok(Some(v)) = conn.get::<_, Option<String>>(key).await {
            // Re-use the Redis TTL for the local entry.
            let ttl_secs: i64 = conn.ttl(key).await.unwrap_or(60);
            let ttl = if ttl_secs > 0 {
                Duration::from_secs(ttl_secs as u64)
            } else {
                Duration::from_secs(60)
            };
            self.local.insert(
                key.to_string(),
                CacheEntry {
                    value: v.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
            return serde_json::from_str(&v).ok();
        }

        None
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        self.local.insert(
            key.to_string(),
            CacheEntry {
                value: json.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );

        if let Some(mut conn) = self.redis.clone() {
            conn.set_ex::<_, _, ()>(key, json, ttl_secs).await?;
        }
        Ok(())
    }

    /// Drop a key from both tiers.
    pub async fn invalidate(&self, key: &str) -> anyhow::Result<()> {
        self.local.remove(key);
        if let Some(mut conn) = self.redis.clone() {
            conn.del::<_, ()>(key).await?;
        }
        Ok(())
    }

    /// Remove all locally-expired entries and counters. Call this
    /// periodically from a background task to bound memory usage.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.local.retain(|_, entry| {
            let keep = entry.expires_at > now;
            removed += usize::from(!keep);
            keep
        });
        removed + self.evict_expired_counters(now)
    }

    fn evict_expired_counters(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.counters.retain(|_, c| {
            let keep = c.expires_at > now;
            removed += usize::from(!keep);
            keep
        });
        removed
    }

    /// Current number of entries in the local cache (for metrics / debugging).
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Current number of in-process window counters.
    pub fn counter_len(&self) -> usize {
        self.counters.len()
    }

    /// Current value of a window counter, 0 when absent or expired.
    pub async fn count(&self, key: &str) -> anyhow::Result<u64> {
        if let Some(mut conn) = self.redis.clone() {
            let v: Option<u64> = conn.get(key).await?;
            return Ok(v.unwrap_or(0));
        }

        Ok(self
            .counters
            .get(key)
            .filter(|c| Instant::now() < c.expires_at)
            .map(|c| c.count)
            .unwrap_or(0))
    }

    /// Increment a fixed-window counter and return the new value. The
    /// window starts with the first increment.
    pub async fn increment(&self, key: &str, window_secs: u64) -> anyhow::Result<u64> {
        if let Some(mut conn) = self.redis.clone() {
            // Atomic INCR + EXPIRE
            let script = redis::Script::new(
                r#"
                local current = redis.call("INCR", KEYS[1])
                if current == 1 then
                    redis.call("EXPIRE", KEYS[1], ARGV[1])
                end
                return current
            "#,
            );
            let count: u64 = script
                .key(key)
                .arg(window_secs)
                .invoke_async(&mut conn)
                .await?;
            return Ok(count);
        }

        let now = Instant::now();
        let calls = self.increments.fetch_add(1, Ordering::Relaxed);
        if calls % INLINE_SWEEP_EVERY == 0 && self.counters.len() >= COUNTER_SWEEP_THRESHOLD {
            let removed = self.evict_expired_counters(now);
            tracing::debug!(removed, "swept expired rate-limit counters");
        }

        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + Duration::from_secs(window_secs),
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + Duration::from_secs(window_secs);
        }
        entry.count += 1;
        Ok(entry.count)
    }
}
