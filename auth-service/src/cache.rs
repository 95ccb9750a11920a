//! `FastCache`: the "fast cache" the spec refers to throughout (denylist, refresh
//! registry, MFA attempt counters, lockouts) at §3/§4.4/§4.2/§6.
//!
//! The teacher repo has no cache dependency at all. Grounded instead on
//! `examples/proerror77-Nova/backend/libs/nova-cache` (`SharedRedis =
//! Arc<Mutex<ConnectionManager>>`, a `CacheOperations`-style async trait, a
//! `ttl` module of named constants) — imported per the "enrich from the rest of
//! the pack" instruction, simplified to the get/set/del/exists/incr surface this
//! service actually needs (no negative-caching or pipelining, which `nova-cache`
//! has for a different, read-heavy social-feed workload).
//!
//! SPEC_FULL.md §9 resolves the denylist-durability open question: Redis-backed
//! when `CACHE_URL` is configured, with a documented non-durable in-process
//! fallback for local dev/tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

/// TTLs for each cache keyspace named in spec §6's "Persisted schema" note.
pub mod ttl {
    pub const DENYLIST_ACCESS_DEFAULT: u64 = 900; // access token lifetime
    pub const LOGIN_LOCKOUT_SECONDS: u64 = 900;
    pub const MFA_LOCKOUT_SECONDS: u64 = 900;
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Atomically increment a counter, creating it with `ttl_secs` if absent, and
    /// return the post-increment value. Used for login/MFA failure counters.
    async fn incr(&self, key: &str, ttl_secs: u64) -> Result<i64>;
}

/// Redis-backed implementation, the production path when `CACHE_URL` is set.
pub struct RedisCache {
    conn: Mutex<ConnectionManager>,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.lock().await;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        Ok(conn.exists(key).await?)
    }

    async fn incr(&self, key: &str, ttl_secs: u64) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(key, ttl_secs as i64).await?;
        }
        Ok(count)
    }
}

/// Process-local fallback used when `CACHE_URL` is unset (local dev, unit tests).
/// Explicitly non-durable: a restart loses every denylist entry and counter, which
/// is acceptable only because access tokens are short-lived (spec §9).
#[derive(Default)]
pub struct InMemoryCache {
    entries: StdMutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep_if_expired(entries: &mut HashMap<String, (String, Instant)>, key: &str) {
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at <= Instant::now() {
                entries.remove(key);
            }
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
        Self::sweep_if_expired(&mut entries, key);
        Ok(entries.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + Duration::from_secs(ttl_secs)));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
        Self::sweep_if_expired(&mut entries, key);
        Ok(entries.contains_key(key))
    }

    async fn incr(&self, key: &str, ttl_secs: u64) -> Result<i64> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache lock poisoned"))?;
        Self::sweep_if_expired(&mut entries, key);
        let next = match entries.get(key) {
            Some((v, _)) => v.parse::<i64>().unwrap_or(0) + 1,
            None => 1,
        };
        entries.insert(key.to_string(), (next.to_string(), Instant::now() + Duration::from_secs(ttl_secs)));
        Ok(next)
    }
}

/// Thin facade over whichever backend was configured, plus the keyspace naming
/// conventions from spec §6.
#[derive(Clone)]
pub struct FastCache {
    backend: Arc<dyn CacheBackend>,
}

impl FastCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub async fn from_url_or_in_memory(cache_url: Option<&str>) -> Self {
        match cache_url {
            Some(url) => match RedisCache::connect(url).await {
                Ok(redis) => return Self::new(Arc::new(redis)),
                Err(err) => {
                    tracing::warn!(?err, "Falling back to in-process cache; CACHE_URL unreachable");
                }
            },
            None => {
                tracing::warn!("CACHE_URL not set; using non-durable in-process cache");
            }
        }
        Self::new(Arc::new(InMemoryCache::new()))
    }

    pub fn denylist_key(jti: &str) -> String {
        format!("denylist:{jti}")
    }

    pub fn refresh_key(jti: &str) -> String {
        format!("refresh:{jti}")
    }

    pub fn mfa_attempts_key(user_id: &str) -> String {
        format!("mfa_attempts:{user_id}")
    }

    pub fn lock_key(user_id: &str) -> String {
        format!("lock:{user_id}")
    }

    pub async fn deny(&self, jti: &str, ttl_secs: u64) -> Result<()> {
        if ttl_secs == 0 {
            return Ok(());
        }
        self.backend.set(&Self::denylist_key(jti), "1", ttl_secs).await
    }

    pub async fn is_denied(&self, jti: &str) -> Result<bool> {
        self.backend.exists(&Self::denylist_key(jti)).await
    }

    pub async fn incr_attempts(&self, key: &str, ttl_secs: u64) -> Result<i64> {
        self.backend.incr(key, ttl_secs).await
    }

    pub async fn clear(&self, key: &str) -> Result<()> {
        self.backend.del(key).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(key).await
    }
}
