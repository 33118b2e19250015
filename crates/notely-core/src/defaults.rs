//! Centralized default constants for notely.
//!
//! **This module is the single source of truth** for shared default values.
//! Components read their environment overrides in `from_env()` and fall back
//! to these.

// =============================================================================
// DATABASE
// =============================================================================

/// Default database URL when `DATABASE_URL` is unset.
pub const DATABASE_URL: &str = "postgres://localhost/notely";

/// Name given to the personal space created with every user.
pub const PERSONAL_SPACE_NAME: &str = "Personal";

// =============================================================================
// BROKER
// =============================================================================

/// How long a delivered message stays invisible to other consumers.
pub const BROKER_LEASE_SECS: u64 = 60;

/// Acknowledged messages older than this are eligible for purging.
pub const BROKER_RETENTION_HOURS: i64 = 72;

// =============================================================================
// WORKER
// =============================================================================

/// Polling interval when a topic is empty (milliseconds).
pub const WORKER_POLL_INTERVAL_MS: u64 = 250;

/// Consumer loops per topic. One preserves strict per-topic order cheaply.
pub const WORKER_REPLICAS_PER_TOPIC: usize = 1;

/// Upper bound on applying one command (relational + index write).
pub const WORKER_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Deliveries after which a message is dropped as poison.
pub const WORKER_MAX_DELIVERIES: i32 = 10;

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// PRODUCER
// =============================================================================

/// Upper bound on each pre-condition read (milliseconds).
pub const PRODUCER_READ_TIMEOUT_MS: u64 = 2_000;

/// Upper bound on a synchronous publish (milliseconds).
pub const PRODUCER_PUBLISH_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// CACHE
// =============================================================================

/// Default Redis endpoint.
pub const REDIS_URL: &str = "redis://localhost:6379";

/// Cache entry time-to-live in seconds.
pub const CACHE_TTL_SECS: u64 = 300;

/// Prefix for every cache key.
pub const CACHE_KEY_PREFIX: &str = "notely:";

// =============================================================================
// SEARCH
// =============================================================================

/// Default search engine endpoint.
pub const SEARCH_URL: &str = "http://localhost:9200";

/// Default index holding note documents.
pub const SEARCH_INDEX: &str = "notes";

/// Timeout for search engine requests (seconds).
pub const SEARCH_TIMEOUT_SECS: u64 = 10;

/// Default number of search hits returned.
pub const SEARCH_LIMIT: usize = 20;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;
