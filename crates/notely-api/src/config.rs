//! Process configuration, read once at startup and passed down immutably.

use std::time::Duration;

use serde::Serialize;

use notely_core::defaults::{BROKER_RETENTION_HOURS, DATABASE_URL, SERVER_PORT};
use notely_search::SearchConfig;
use notely_worker::WorkerConfig;

use crate::producer::ProducerConfig;
use crate::services::CacheConfig;

/// Version metadata reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha: Option<String>,
}

impl BuildInfo {
    /// Metadata baked in at compile time.
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_sha: option_env!("GIT_SHA").map(str::to_string),
        }
    }
}

/// Everything the gateway process needs, resolved from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Origins allowed by CORS. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
    /// Acknowledged broker messages older than this are purged.
    pub broker_retention: Duration,
    pub producer: ProducerConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub worker: WorkerConfig,
    pub build: BuildInfo,
}

impl AppConfig {
    /// Resolve configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_URL` | `postgres://localhost/notely` |
    /// | `HOST` | `0.0.0.0` |
    /// | `PORT` | `3000` |
    /// | `ALLOWED_ORIGINS` | (none) |
    /// | `BROKER_RETENTION_HOURS` | `72` |
    ///
    /// Component settings are read by each component's own `from_env`.
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| DATABASE_URL.to_string());
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(SERVER_PORT);
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .map(|v| parse_origins(&v))
            .unwrap_or_default();
        let retention_hours = std::env::var("BROKER_RETENTION_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|h| *h > 0)
            .unwrap_or(BROKER_RETENTION_HOURS);

        Self {
            database_url,
            host,
            port,
            allowed_origins,
            broker_retention: Duration::from_secs(retention_hours as u64 * 3600),
            producer: ProducerConfig::from_env(),
            cache: CacheConfig::from_env(),
            search: SearchConfig::from_env(),
            worker: WorkerConfig::from_env(),
            build: BuildInfo::current(),
        }
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}
