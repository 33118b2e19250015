//! # notely-worker
//!
//! The consumer side of the notely command pipeline.
//!
//! A [`CommandWorker`] runs one long-lived loop per topic (optionally
//! replicated). Each loop leases the head-of-line message, decodes and
//! re-validates it, and hands it to the [`Applier`], which commits the
//! relational change and the search-index change together or not at all.
//!
//! | Outcome | Broker | Event |
//! |---------|--------|-------|
//! | Applied | ack | `CommandApplied` |
//! | Already applied | ack | `CommandDuplicate` |
//! | Poison, invalid, or domain conflict | ack | `CommandDropped` |
//! | Transient failure | nack | `CommandRetried` |
//!
//! ## Example
//!
//! ```ignore
//! use notely_worker::{WorkerBuilder, WorkerConfig};
//!
//! let worker = WorkerBuilder::new(broker, store, index)
//!     .with_config(WorkerConfig::from_env())
//!     .build();
//!
//! let handle = worker.start();
//! let mut events = handle.events();
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! handle.join().await;
//! ```

pub mod applier;
pub mod worker;

pub use applier::{Applier, Outcome};
pub use worker::{CommandWorker, Disposition, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
