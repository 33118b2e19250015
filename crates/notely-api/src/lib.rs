//! # notely-api
//!
//! The gateway half of notely: the [`producer::Producer`] that turns write
//! requests into broker commands, the cache-aside read layer, and the axum
//! routes that expose both.

pub mod config;
pub mod producer;
pub mod routes;
pub mod services;

pub use config::{AppConfig, BuildInfo};
pub use producer::{Producer, ProducerConfig};
pub use routes::{router, ApiError, AppState};
