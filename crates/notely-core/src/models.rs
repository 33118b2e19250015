//! Domain entities: notes, spaces, users, and the search-index projection of a note.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of content a note carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteType {
    Text,
    Photo,
    Voice,
    Video,
    Document,
}

impl NoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteType::Text => "text",
            NoteType::Photo => "photo",
            NoteType::Voice => "voice",
            NoteType::Video => "video",
            NoteType::Document => "document",
        }
    }

    /// Only text notes can be edited in place.
    pub fn is_updatable(&self) -> bool {
        matches!(self, NoteType::Text)
    }
}

impl fmt::Display for NoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(NoteType::Text),
            "photo" => Ok(NoteType::Photo),
            "voice" => Ok(NoteType::Voice),
            "video" => Ok(NoteType::Video),
            "document" => Ok(NoteType::Document),
            other => Err(format!("unknown note type: {}", other)),
        }
    }
}

/// A note stored in exactly one space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: Uuid,
    pub space_id: Uuid,
    /// Author (internal user id).
    pub user_id: i64,
    #[serde(rename = "type")]
    pub note_type: NoteType,
    /// Body for text notes, caption for media notes.
    pub text: String,
    /// Reference to an uploaded file (media notes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_edit: Option<DateTime<Utc>>,
}

/// A personal or shared container of notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub id: Uuid,
    pub name: String,
    /// Internal id of the user who created the space.
    pub creator: i64,
    /// Personal spaces belong to one user and never accept participants.
    pub personal: bool,
    pub created: DateTime<Utc>,
}

/// A user known both internally and on the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// External messaging-platform id.
    pub tg_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub personal_space_id: Uuid,
    pub created: DateTime<Utc>,
}

/// Input for provisioning a user together with their personal space.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub tg_id: i64,
    pub username: Option<String>,
}

/// The search-index projection of a [`Note`], keyed by the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteDocument {
    pub note_id: Uuid,
    pub space_id: Uuid,
    pub user_id: i64,
    #[serde(rename = "type")]
    pub note_type: NoteType,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_edit: Option<DateTime<Utc>>,
}

impl From<&Note> for NoteDocument {
    fn from(note: &Note) -> Self {
        Self {
            note_id: note.id,
            space_id: note.space_id,
            user_id: note.user_id,
            note_type: note.note_type,
            text: note.text.clone(),
            file: note.file.clone(),
            created: note.created,
            last_edit: note.last_edit,
        }
    }
}

/// A full-text search match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteSearchHit {
    pub note_id: Uuid,
    pub score: f32,
}
