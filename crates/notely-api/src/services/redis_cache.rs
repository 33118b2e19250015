//! Redis-backed [`KvCache`].
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_ENABLED`: Set to "false" to disable caching (default: true)
//! - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
//! - `REDIS_CACHE_TTL`: Cache TTL in seconds (default: 300)

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use notely_core::defaults::{CACHE_TTL_SECS, REDIS_URL};
use notely_core::{Error, KvCache, Result};

/// Cache settings resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub url: String,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: REDIS_URL.to_string(),
            ttl: Duration::from_secs(CACHE_TTL_SECS),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let enabled = std::env::var("REDIS_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| REDIS_URL.to_string());

        let ttl_seconds: u64 = std::env::var("REDIS_CACHE_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(CACHE_TTL_SECS);

        Self {
            enabled,
            url,
            ttl: Duration::from_secs(ttl_seconds),
        }
    }
}

/// Key-value cache backed by Redis.
///
/// A cache that failed to connect at startup stays disconnected and behaves
/// as an always-empty cache.
#[derive(Clone)]
pub struct RedisCache {
    connection: Option<ConnectionManager>,
}

impl RedisCache {
    /// Connect according to `config`. Never fails: connection problems
    /// disable the cache.
    pub async fn connect(config: &CacheConfig) -> Self {
        let connection = if config.enabled {
            match redis::Client::open(config.url.as_str()) {
                Ok(client) => match ConnectionManager::new(client).await {
                    Ok(conn) => {
                        info!(
                            subsystem = "cache",
                            ttl_secs = config.ttl.as_secs(),
                            "Redis cache enabled"
                        );
                        Some(conn)
                    }
                    Err(e) => {
                        warn!(subsystem = "cache", error = %e, "Failed to connect to Redis, cache disabled");
                        None
                    }
                },
                Err(e) => {
                    warn!(subsystem = "cache", error = %e, "Invalid Redis URL, cache disabled");
                    None
                }
            }
        } else {
            info!(subsystem = "cache", "Redis cache disabled via REDIS_ENABLED=false");
            None
        };

        Self { connection }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self { connection: None }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

#[async_trait]
impl KvCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(mut conn) = self.connection.clone() else {
            return Ok(None);
        };
        let value = conn
            .get::<_, Option<String>>(key)
            .await
            .map_err(|e| Error::Cache(format!("GET {}: {}", key, e)))?;
        debug!(subsystem = "cache", key, hit = value.is_some(), "Redis GET");
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let Some(mut conn) = self.connection.clone() else {
            return Ok(());
        };
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| Error::Cache(format!("SET {}: {}", key, e)))?;
        Ok(())
    }
}
