//! # notely-search
//!
//! Search index client for notely.
//!
//! [`ElasticIndex`] speaks the Elasticsearch/OpenSearch REST API. Every
//! write waits for a refresh so a note is searchable as soon as the worker
//! acknowledges the command that produced it.

pub mod elastic;

pub use elastic::{ElasticIndex, SearchConfig};
