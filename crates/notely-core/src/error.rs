//! Error types for notely.
//!
//! Errors fall into four families that drive every retry decision in the
//! pipeline:
//!
//! | Family | Variants | Producer | Worker |
//! |--------|----------|----------|--------|
//! | Validation | [`Error::Validation`] | 400, nothing published | ack + drop |
//! | Domain conflict | [`Error::Domain`] | 4xx, nothing published | ack + drop |
//! | Transient infrastructure | `Database`, `Broker`, `Index`, `Cache`, `Timeout` | 5xx | nack, redeliver |
//! | Poison | [`Error::Serialization`] on decode | n/a | ack + drop |

use thiserror::Error;
use uuid::Uuid;

use crate::commands::ValidationError;
use crate::models::NoteType;

/// Result type alias using notely's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Client-caused conflicts with the current state of the store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("unknown user: {0}")]
    UnknownUser(i64),

    #[error("space does not exist: {0}")]
    SpaceNotFound(Uuid),

    #[error("space {space_id} does not belong to user {user_id}")]
    SpaceNotOwned { space_id: Uuid, user_id: i64 },

    #[error("note not found: {0}")]
    NoteNotFound(Uuid),

    #[error("note {note_id} does not belong to space {space_id}")]
    NoteNotInSpace { note_id: Uuid, space_id: Uuid },

    #[error("note of type {0} can't be updated")]
    NoteNotUpdatable(NoteType),

    #[error("can't add participants to a personal space")]
    PersonalSpace(Uuid),

    #[error("you can't add yourself as a participant")]
    SelfParticipant,

    #[error("user {user_id} is already a participant of space {space_id}")]
    AlreadyParticipant { space_id: Uuid, user_id: i64 },

    #[error("user {user_id} already has a pending invitation to space {space_id}")]
    InvitationPending { space_id: Uuid, user_id: i64 },

    #[error("user with external id {0} already exists")]
    UserAlreadyExists(i64),
}

/// Core error type for notely operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A command or request is missing a field or carries the wrong tag.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The request conflicts with stored state.
    #[error("{0}")]
    Domain(#[from] DomainError),

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Message broker rejected or could not be reached.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Search index rejected or could not be reached.
    #[error("Search index error: {0}")]
    Index(String),

    /// Cache backend failed.
    #[error("Cache error: {0}")]
    Cache(String),

    /// A bounded operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors caused by the client: never retried, reported synchronously.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Domain(_))
    }

    /// Errors caused by unavailable infrastructure: the Worker redelivers.
    ///
    /// Constraint violations that reach this point unmapped are not
    /// transient, redelivery would fail the same way.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db_err)) => db_err.constraint().is_none(),
            Error::Database(sqlx::Error::RowNotFound) => false,
            Error::Database(_) => true,
            Error::Broker(_) | Error::Index(_) | Error::Cache(_) | Error::Timeout(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Index(e.to_string())
        }
    }
}
