//! Cache-aside [`SpaceReader`].
//!
//! Space and user lookups are served from a [`KvCache`] and fall back to the
//! wrapped reader on a miss. The cache is never authoritative: read errors
//! count as misses and write errors are only logged. Membership is always
//! read through because it gates writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use notely_core::defaults::CACHE_KEY_PREFIX;
use notely_core::{KvCache, Result, Space, SpaceReader, User};

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

pub fn space_key(space_id: Uuid) -> String {
    format!("{}space:{}", CACHE_KEY_PREFIX, space_id)
}

pub fn user_key(user_id: i64) -> String {
    format!("{}user:{}", CACHE_KEY_PREFIX, user_id)
}

pub fn user_tg_key(tg_id: i64) -> String {
    format!("{}user:tg:{}", CACHE_KEY_PREFIX, tg_id)
}

/// [`SpaceReader`] with a read-through cache in front.
#[derive(Clone)]
pub struct CachedSpaceReader {
    inner: Arc<dyn SpaceReader>,
    cache: Arc<dyn KvCache>,
    ttl: Duration,
    counters: Arc<Counters>,
}

impl CachedSpaceReader {
    pub fn new(inner: Arc<dyn SpaceReader>, cache: Arc<dyn KvCache>, ttl: Duration) -> Self {
        Self {
            inner,
            cache,
            ttl,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(subsystem = "cache", key, "Cache HIT");
                    Some(value)
                }
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(subsystem = "cache", key, error = %e, "Discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(subsystem = "cache", key, "Cache MISS");
                None
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(subsystem = "cache", key, error = %e, "Cache read failed, using store");
                None
            }
        }
    }

    async fn populate<T: Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(subsystem = "cache", key, error = %e, "Cache serialization error");
                return;
            }
        };
        if let Err(e) = self.cache.set(key, raw, self.ttl).await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            warn!(subsystem = "cache", key, error = %e, "Cache write failed");
        }
    }

    async fn cache_user(&self, user: &User) {
        self.populate(&user_key(user.id), user).await;
        self.populate(&user_tg_key(user.tg_id), user).await;
    }
}

#[async_trait]
impl SpaceReader for CachedSpaceReader {
    async fn get_space(&self, space_id: Uuid) -> Result<Option<Space>> {
        let key = space_key(space_id);
        if let Some(space) = self.lookup::<Space>(&key).await {
            return Ok(Some(space));
        }
        let space = self.inner.get_space(space_id).await?;
        if let Some(space) = &space {
            self.populate(&key, space).await;
        }
        Ok(space)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        if let Some(user) = self.lookup::<User>(&user_key(user_id)).await {
            return Ok(Some(user));
        }
        let user = self.inner.get_user(user_id).await?;
        if let Some(user) = &user {
            self.cache_user(user).await;
        }
        Ok(user)
    }

    async fn get_user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>> {
        if let Some(user) = self.lookup::<User>(&user_tg_key(tg_id)).await {
            return Ok(Some(user));
        }
        let user = self.inner.get_user_by_tg_id(tg_id).await?;
        if let Some(user) = &user {
            self.cache_user(user).await;
        }
        Ok(user)
    }

    async fn is_participant(&self, space_id: Uuid, user_id: i64) -> Result<bool> {
        self.inner.is_participant(space_id, user_id).await
    }
}
