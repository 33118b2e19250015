//! Core traits for notely abstractions.
//!
//! These traits are the seams between the pipeline stages: the producer
//! talks to a [`Broker`] and the read traits, the worker talks to a
//! [`Broker`], a [`WriteStore`], and a [`SearchIndex`], and the read layer
//! sits a [`KvCache`] in front of [`SpaceReader`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::commands::Topic;
use crate::error::Result;
use crate::models::*;

// =============================================================================
// BROKER
// =============================================================================

/// A message leased to a consumer, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Broker-assigned sequence number, monotonic per broker.
    pub id: i64,
    pub topic: Topic,
    /// Serialized command. Not guaranteed to decode.
    pub payload: String,
    /// How many times this message has been handed out, including this one.
    pub delivery_count: i32,
    pub published_at: DateTime<Utc>,
}

/// Durable, per-topic FIFO, at-least-once transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a payload to a topic. Returns only after durable receipt.
    async fn publish(&self, topic: Topic, payload: String) -> Result<i64>;

    /// Lease the head-of-line message of a topic for `lease`.
    ///
    /// Returns `None` when the topic is empty or its head is leased by
    /// another consumer.
    async fn receive(&self, topic: Topic, lease: Duration) -> Result<Option<Delivery>>;

    /// Remove a delivered message permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Release the lease so the same message is redelivered next.
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// Unacknowledged backlog of a topic, oldest first.
    async fn pending(&self, topic: Topic) -> Result<Vec<Delivery>>;

    /// Unacknowledged messages of a topic whose payload contains every
    /// needle as a substring, oldest first. Matching is a pre-filter; callers
    /// decode the payloads they get back.
    async fn pending_containing(&self, topic: Topic, needles: &[String]) -> Result<Vec<Delivery>>;

    /// Signalled on every publish so idle consumers can wake early.
    fn notifier(&self) -> Arc<Notify>;
}

// =============================================================================
// RELATIONAL WRITE PATH
// =============================================================================

/// A text edit: the note as it was before and after the change.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteEdit {
    pub before: Note,
    pub after: Note,
}

/// Opens write transactions. Only the worker holds one of these.
#[async_trait]
pub trait WriteStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn WriteTx>>;
}

/// One relational transaction.
///
/// Dropping a transaction without calling [`WriteTx::commit`] discards
/// every change made through it.
#[async_trait]
pub trait WriteTx: Send {
    /// Record that a command has been applied.
    ///
    /// Returns `false` if the request id was already recorded, in which case
    /// the caller must not apply the command again.
    async fn record_request(&mut self, request_id: Uuid, topic: Topic) -> Result<bool>;

    /// Read a note as this transaction sees it.
    async fn find_note(&mut self, note_id: Uuid) -> Result<Option<Note>>;

    /// Notes of a space as this transaction sees them.
    async fn find_notes_by_space(&mut self, space_id: Uuid) -> Result<Vec<Note>>;

    /// Insert a note. The author must be the space's creator or a participant.
    async fn insert_note(&mut self, note: &Note) -> Result<()>;

    /// Replace the text of a text note.
    async fn update_note_text(
        &mut self,
        note_id: Uuid,
        space_id: Uuid,
        user_id: i64,
        text: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<NoteEdit>;

    /// Delete one note. Returns the deleted row.
    async fn delete_note(&mut self, note_id: Uuid, space_id: Uuid) -> Result<Note>;

    /// Delete every note in a space. Returns the deleted rows.
    async fn delete_notes_by_space(&mut self, space_id: Uuid) -> Result<Vec<Note>>;

    /// Insert a shared space and enrol its creator as first participant.
    async fn insert_space(&mut self, space: &Space) -> Result<()>;

    /// Enrol a user in a shared space.
    async fn add_participant(
        &mut self,
        space_id: Uuid,
        user_id: i64,
        joined: DateTime<Utc>,
    ) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// READ PATH
// =============================================================================

/// Read access to notes, used by the producer's pre-condition checks.
#[async_trait]
pub trait NoteReader: Send + Sync {
    async fn get_note_by_id(&self, note_id: Uuid) -> Result<Option<Note>>;

    /// Notes of a space ordered by creation time.
    async fn get_all_notes_by_space_id(&self, space_id: Uuid) -> Result<Vec<Note>>;
}

/// Read access to spaces, users, and membership.
#[async_trait]
pub trait SpaceReader: Send + Sync {
    async fn get_space(&self, space_id: Uuid) -> Result<Option<Space>>;

    async fn get_user(&self, user_id: i64) -> Result<Option<User>>;

    async fn get_user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>>;

    /// True if the user is the creator of or a participant in the space.
    async fn is_participant(&self, space_id: Uuid, user_id: i64) -> Result<bool>;
}

// =============================================================================
// SEARCH INDEX
// =============================================================================

/// Secondary full-text index kept in lock-step with the relational store.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_document(&self, doc: &NoteDocument) -> Result<()>;

    async fn update_document(&self, doc: &NoteDocument) -> Result<()>;

    async fn delete_document(&self, note_id: Uuid) -> Result<()>;

    /// Delete every document of a space. Returns the number removed.
    async fn delete_by_space(&self, space_id: Uuid) -> Result<u64>;

    async fn search(&self, space_id: Uuid, query: &str, limit: usize)
        -> Result<Vec<NoteSearchHit>>;
}

// =============================================================================
// CACHE
// =============================================================================

/// Key-value cache with per-entry TTL. A miss is `Ok(None)`, not an error.
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
}
