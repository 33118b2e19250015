//! The command model: one validated, serializable variant per mutation.
//!
//! A [`Command`] is built by the producer, serialized onto a broker
//! [`Topic`], and applied by the worker. Every variant validates itself in
//! a fixed order (request id, subject fields, timestamp, operation tag) so
//! the first missing field is always the one reported.
//!
//! ## Wire format
//!
//! ```json
//! {"kind":"create_note","request_id":"0190…","operation":"create","created":1700000000,
//!  "user_id":1,"space_id":"0190…","text":"buy milk","type":"text"}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::Result;
use crate::models::NoteType;

/// Mutation kind carried by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    DeleteAll,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::DeleteAll => "delete_all",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker delivery channel, one per domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Notes,
    Spaces,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Notes, Topic::Spaces];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Notes => "notes",
            Topic::Spaces => "spaces",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "notes" => Ok(Topic::Notes),
            "spaces" => Ok(Topic::Spaces),
            other => Err(format!("unknown topic: {}", other)),
        }
    }
}

/// A field-level reason a command was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request id not filled")]
    RequestIdNotFilled,
    #[error("user id not filled")]
    UserIdNotFilled,
    #[error("text not filled")]
    TextNotFilled,
    #[error("space id not filled")]
    SpaceIdNotFilled,
    #[error("note id not filled")]
    NoteIdNotFilled,
    #[error("type not filled")]
    TypeNotFilled,
    #[error("name not filled")]
    NameNotFilled,
    #[error("creator not filled")]
    CreatorNotFilled,
    #[error("participant id not filled")]
    ParticipantIdNotFilled,
    #[error("created not filled")]
    CreatedNotFilled,
    #[error("wrong operation: expected {expected}, got {actual}")]
    WrongOperation {
        expected: Operation,
        actual: Operation,
    },
}

pub type Validation = std::result::Result<(), ValidationError>;

fn check(ok: bool, err: ValidationError) -> Validation {
    if ok {
        Ok(())
    } else {
        Err(err)
    }
}

fn check_operation(expected: Operation, actual: Operation) -> Validation {
    check(
        expected == actual,
        ValidationError::WrongOperation { expected, actual },
    )
}

/// Contract shared by every command variant.
pub trait CommandPayload {
    /// Operation tag this variant must carry.
    const OPERATION: Operation;
    /// Topic this variant travels on.
    const TOPIC: Topic;

    fn request_id(&self) -> Uuid;

    /// Pure, in-memory validation in the fixed field order.
    fn validate(&self) -> Validation;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateNoteRequest {
    pub request_id: Uuid,
    pub operation: Operation,
    pub created: i64,
    pub user_id: i64,
    pub space_id: Uuid,
    pub text: String,
    #[serde(rename = "type")]
    pub note_type: Option<NoteType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl CommandPayload for CreateNoteRequest {
    const OPERATION: Operation = Operation::Create;
    const TOPIC: Topic = Topic::Notes;

    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn validate(&self) -> Validation {
        check(!self.request_id.is_nil(), ValidationError::RequestIdNotFilled)?;
        check(self.user_id != 0, ValidationError::UserIdNotFilled)?;
        check(!self.text.trim().is_empty(), ValidationError::TextNotFilled)?;
        check(!self.space_id.is_nil(), ValidationError::SpaceIdNotFilled)?;
        check(self.note_type.is_some(), ValidationError::TypeNotFilled)?;
        check(self.created != 0, ValidationError::CreatedNotFilled)?;
        check_operation(Self::OPERATION, self.operation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateNoteRequest {
    pub request_id: Uuid,
    pub operation: Operation,
    pub created: i64,
    pub user_id: i64,
    pub space_id: Uuid,
    pub note_id: Uuid,
    pub text: String,
}

impl CommandPayload for UpdateNoteRequest {
    const OPERATION: Operation = Operation::Update;
    const TOPIC: Topic = Topic::Notes;

    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn validate(&self) -> Validation {
        check(!self.request_id.is_nil(), ValidationError::RequestIdNotFilled)?;
        check(self.user_id != 0, ValidationError::UserIdNotFilled)?;
        check(!self.text.trim().is_empty(), ValidationError::TextNotFilled)?;
        check(!self.space_id.is_nil(), ValidationError::SpaceIdNotFilled)?;
        check(!self.note_id.is_nil(), ValidationError::NoteIdNotFilled)?;
        check(self.created != 0, ValidationError::CreatedNotFilled)?;
        check_operation(Self::OPERATION, self.operation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteNoteRequest {
    pub request_id: Uuid,
    pub operation: Operation,
    pub created: i64,
    pub space_id: Uuid,
    pub note_id: Uuid,
}

impl CommandPayload for DeleteNoteRequest {
    const OPERATION: Operation = Operation::Delete;
    const TOPIC: Topic = Topic::Notes;

    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn validate(&self) -> Validation {
        check(!self.request_id.is_nil(), ValidationError::RequestIdNotFilled)?;
        check(!self.space_id.is_nil(), ValidationError::SpaceIdNotFilled)?;
        check(!self.note_id.is_nil(), ValidationError::NoteIdNotFilled)?;
        check(self.created != 0, ValidationError::CreatedNotFilled)?;
        check_operation(Self::OPERATION, self.operation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteAllNotesRequest {
    pub request_id: Uuid,
    pub operation: Operation,
    pub created: i64,
    pub space_id: Uuid,
}

impl CommandPayload for DeleteAllNotesRequest {
    const OPERATION: Operation = Operation::DeleteAll;
    const TOPIC: Topic = Topic::Notes;

    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn validate(&self) -> Validation {
        check(!self.request_id.is_nil(), ValidationError::RequestIdNotFilled)?;
        check(!self.space_id.is_nil(), ValidationError::SpaceIdNotFilled)?;
        check(self.created != 0, ValidationError::CreatedNotFilled)?;
        check_operation(Self::OPERATION, self.operation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSpaceRequest {
    pub request_id: Uuid,
    pub operation: Operation,
    pub created: i64,
    pub name: String,
    /// Internal id of the creating user.
    pub creator: i64,
}

impl CommandPayload for CreateSpaceRequest {
    const OPERATION: Operation = Operation::Create;
    const TOPIC: Topic = Topic::Spaces;

    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn validate(&self) -> Validation {
        check(!self.request_id.is_nil(), ValidationError::RequestIdNotFilled)?;
        check(!self.name.trim().is_empty(), ValidationError::NameNotFilled)?;
        check(self.creator != 0, ValidationError::CreatorNotFilled)?;
        check(self.created != 0, ValidationError::CreatedNotFilled)?;
        check_operation(Self::OPERATION, self.operation)
    }
}

/// Adds a user to a shared space.
///
/// Self-add and duplicate detection happen in the producer before this is
/// built; `requester_id` is carried for tracing only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddParticipantRequest {
    pub request_id: Uuid,
    pub operation: Operation,
    pub created: i64,
    pub space_id: Uuid,
    pub participant_id: i64,
    #[serde(default)]
    pub requester_id: i64,
}

impl CommandPayload for AddParticipantRequest {
    const OPERATION: Operation = Operation::Create;
    const TOPIC: Topic = Topic::Spaces;

    fn request_id(&self) -> Uuid {
        self.request_id
    }

    fn validate(&self) -> Validation {
        check(!self.request_id.is_nil(), ValidationError::RequestIdNotFilled)?;
        check(!self.space_id.is_nil(), ValidationError::SpaceIdNotFilled)?;
        check(
            self.participant_id != 0,
            ValidationError::ParticipantIdNotFilled,
        )?;
        check(self.created != 0, ValidationError::CreatedNotFilled)?;
        check_operation(Self::OPERATION, self.operation)
    }
}

/// Closed set of mutations transported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    CreateNote(CreateNoteRequest),
    UpdateNote(UpdateNoteRequest),
    DeleteNote(DeleteNoteRequest),
    DeleteAllNotes(DeleteAllNotesRequest),
    CreateSpace(CreateSpaceRequest),
    AddParticipant(AddParticipantRequest),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateNote(_) => "create_note",
            Command::UpdateNote(_) => "update_note",
            Command::DeleteNote(_) => "delete_note",
            Command::DeleteAllNotes(_) => "delete_all_notes",
            Command::CreateSpace(_) => "create_space",
            Command::AddParticipant(_) => "add_participant",
        }
    }

    pub fn request_id(&self) -> Uuid {
        match self {
            Command::CreateNote(c) => c.request_id(),
            Command::UpdateNote(c) => c.request_id(),
            Command::DeleteNote(c) => c.request_id(),
            Command::DeleteAllNotes(c) => c.request_id(),
            Command::CreateSpace(c) => c.request_id(),
            Command::AddParticipant(c) => c.request_id(),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Command::CreateNote(c) => c.operation,
            Command::UpdateNote(c) => c.operation,
            Command::DeleteNote(c) => c.operation,
            Command::DeleteAllNotes(c) => c.operation,
            Command::CreateSpace(c) => c.operation,
            Command::AddParticipant(c) => c.operation,
        }
    }

    /// Producer-stamped Unix timestamp (seconds).
    pub fn created(&self) -> i64 {
        match self {
            Command::CreateNote(c) => c.created,
            Command::UpdateNote(c) => c.created,
            Command::DeleteNote(c) => c.created,
            Command::DeleteAllNotes(c) => c.created,
            Command::CreateSpace(c) => c.created,
            Command::AddParticipant(c) => c.created,
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            Command::CreateNote(_) => CreateNoteRequest::TOPIC,
            Command::UpdateNote(_) => UpdateNoteRequest::TOPIC,
            Command::DeleteNote(_) => DeleteNoteRequest::TOPIC,
            Command::DeleteAllNotes(_) => DeleteAllNotesRequest::TOPIC,
            Command::CreateSpace(_) => CreateSpaceRequest::TOPIC,
            Command::AddParticipant(_) => AddParticipantRequest::TOPIC,
        }
    }

    pub fn validate(&self) -> Validation {
        match self {
            Command::CreateNote(c) => c.validate(),
            Command::UpdateNote(c) => c.validate(),
            Command::DeleteNote(c) => c.validate(),
            Command::DeleteAllNotes(c) => c.validate(),
            Command::CreateSpace(c) => c.validate(),
            Command::AddParticipant(c) => c.validate(),
        }
    }

    /// Serialize to the broker wire format.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a broker payload. Failure marks the message as poison.
    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Command {
                fn from(req: $ty) -> Self {
                    Command::$variant(req)
                }
            }
        )*
    };
}

impl_from_payload! {
    CreateNote => CreateNoteRequest,
    UpdateNote => UpdateNoteRequest,
    DeleteNote => DeleteNoteRequest,
    DeleteAllNotes => DeleteAllNotesRequest,
    CreateSpace => CreateSpaceRequest,
    AddParticipant => AddParticipantRequest,
}
