//! Note repository implementation.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use notely_core::{Error, Note, NoteReader, NoteType, Result};

/// Column list shared by every query that materializes a [`Note`].
pub(crate) const NOTE_COLUMNS: &str =
    "id, space_id, user_id, note_type, text, file, created, last_edit";

pub(crate) fn parse_note_row(row: &PgRow) -> Result<Note> {
    let note_type: String = row.get("note_type");
    Ok(Note {
        id: row.get("id"),
        space_id: row.get("space_id"),
        user_id: row.get("user_id"),
        note_type: note_type.parse::<NoteType>().map_err(Error::Serialization)?,
        text: row.get("text"),
        file: row.get("file"),
        created: row.get("created"),
        last_edit: row.get("last_edit"),
    })
}

/// PostgreSQL read access to notes.
#[derive(Clone)]
pub struct PgNoteRepository {
    pool: Pool<Postgres>,
}

impl PgNoteRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NoteReader for PgNoteRepository {
    async fn get_note_by_id(&self, note_id: Uuid) -> Result<Option<Note>> {
        let row = sqlx::query(&format!("SELECT {NOTE_COLUMNS} FROM note WHERE id = $1"))
            .bind(note_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(parse_note_row).transpose()
    }

    async fn get_all_notes_by_space_id(&self, space_id: Uuid) -> Result<Vec<Note>> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTE_COLUMNS} FROM note WHERE space_id = $1 ORDER BY created, id"
        ))
        .bind(space_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(parse_note_row).collect()
    }
}
