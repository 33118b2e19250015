//! Read-side services.

pub mod redis_cache;
pub mod space_cache;

pub use redis_cache::{CacheConfig, RedisCache};
pub use space_cache::{CacheStats, CachedSpaceReader};
