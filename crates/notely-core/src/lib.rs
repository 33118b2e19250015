//! # notely-core
//!
//! Core types, commands, traits, and abstractions for notely.
//!
//! This crate defines the command model that travels through the broker,
//! the domain entities, the error taxonomy that drives retry decisions, and
//! the trait seams every backend implements. The [`memory`] module provides
//! in-process implementations of those seams.

pub mod commands;
pub mod defaults;
pub mod error;
pub mod ids;
pub mod memory;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use commands::*;
pub use error::{DomainError, Error, Result};
pub use ids::{from_unix, is_v7, new_v7, unix_now};
pub use models::*;
pub use traits::*;
