//! The relational write path used by the worker.
//!
//! Every command is applied inside one [`PgWriteTx`]. Row locks taken while
//! checking preconditions are held until the worker commits or drops the
//! transaction, so the index write happens under the same locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use notely_core::{
    DomainError, Error, Note, NoteEdit, Result, Space, Topic, WriteStore, WriteTx,
};

use crate::notes::{parse_note_row, NOTE_COLUMNS};

/// Translate a named constraint violation into a domain error.
///
/// Violations the mapper doesn't recognise stay database errors, which
/// are classified as terminal because they carry a constraint name.
pub(crate) fn map_constraint(
    err: sqlx::Error,
    mapper: impl FnOnce(&str) -> Option<DomainError>,
) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(domain) = db_err.constraint().and_then(mapper) {
            return Error::Domain(domain);
        }
    }
    Error::Database(err)
}

/// Opens write transactions against PostgreSQL.
#[derive(Clone)]
pub struct PgWriteStore {
    pool: Pool<Postgres>,
}

impl PgWriteStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WriteStore for PgWriteStore {
    async fn begin(&self) -> Result<Box<dyn WriteTx>> {
        let tx = self.pool.begin().await.map_err(Error::Database)?;
        Ok(Box::new(PgWriteTx { tx }))
    }
}

/// A single write transaction. Dropping it rolls back.
pub struct PgWriteTx {
    tx: Transaction<'static, Postgres>,
}

impl PgWriteTx {
    /// Lock a space row and check that `user_id` may write to it.
    async fn check_member(&mut self, space_id: Uuid, user_id: i64) -> Result<()> {
        let row = sqlx::query(
            "SELECT s.creator,
                    EXISTS (SELECT 1 FROM users WHERE id = $2) AS user_exists,
                    EXISTS (SELECT 1 FROM space_participant
                            WHERE space_id = $1 AND user_id = $2) AS member
             FROM space s
             WHERE s.id = $1
             FOR SHARE OF s",
        )
        .bind(space_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(Error::Database)?
        .ok_or(DomainError::SpaceNotFound(space_id))?;

        if !row.get::<bool, _>("user_exists") {
            return Err(DomainError::UnknownUser(user_id).into());
        }
        let creator: i64 = row.get("creator");
        if creator != user_id && !row.get::<bool, _>("member") {
            return Err(DomainError::SpaceNotOwned { space_id, user_id }.into());
        }
        Ok(())
    }
}

#[async_trait]
impl WriteTx for PgWriteTx {
    async fn record_request(&mut self, request_id: Uuid, topic: Topic) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO processed_request (request_id, topic) VALUES ($1, $2)
             ON CONFLICT (request_id) DO NOTHING",
        )
        .bind(request_id)
        .bind(topic.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_note(&mut self, note_id: Uuid) -> Result<Option<Note>> {
        let row = sqlx::query(&format!(
            "SELECT {NOTE_COLUMNS} FROM note WHERE id = $1 FOR SHARE"
        ))
        .bind(note_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(parse_note_row).transpose()
    }

    async fn find_notes_by_space(&mut self, space_id: Uuid) -> Result<Vec<Note>> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTE_COLUMNS} FROM note WHERE space_id = $1 ORDER BY created, id FOR SHARE"
        ))
        .bind(space_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(parse_note_row).collect()
    }

    async fn insert_note(&mut self, note: &Note) -> Result<()> {
        self.check_member(note.space_id, note.user_id).await?;

        sqlx::query(
            "INSERT INTO note (id, space_id, user_id, note_type, text, file, created, last_edit)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(note.id)
        .bind(note.space_id)
        .bind(note.user_id)
        .bind(note.note_type.as_str())
        .bind(&note.text)
        .bind(&note.file)
        .bind(note.created)
        .bind(note.last_edit)
        .execute(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn update_note_text(
        &mut self,
        note_id: Uuid,
        space_id: Uuid,
        user_id: i64,
        text: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<NoteEdit> {
        let current = sqlx::query(&format!(
            "SELECT {NOTE_COLUMNS} FROM note WHERE id = $1 FOR UPDATE"
        ))
        .bind(note_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(Error::Database)?
        .ok_or(DomainError::NoteNotFound(note_id))?;
        let current = parse_note_row(&current)?;

        if current.space_id != space_id {
            return Err(DomainError::NoteNotInSpace { note_id, space_id }.into());
        }
        if !current.note_type.is_updatable() {
            return Err(DomainError::NoteNotUpdatable(current.note_type).into());
        }
        self.check_member(space_id, user_id).await?;

        let row = sqlx::query(&format!(
            "UPDATE note SET text = $2, last_edit = $3 WHERE id = $1 RETURNING {NOTE_COLUMNS}"
        ))
        .bind(note_id)
        .bind(text)
        .bind(edited_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        Ok(NoteEdit {
            before: current,
            after: parse_note_row(&row)?,
        })
    }

    async fn delete_note(&mut self, note_id: Uuid, space_id: Uuid) -> Result<Note> {
        let deleted = sqlx::query(&format!(
            "DELETE FROM note WHERE id = $1 AND space_id = $2 RETURNING {NOTE_COLUMNS}"
        ))
        .bind(note_id)
        .bind(space_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        if let Some(row) = deleted {
            return parse_note_row(&row);
        }

        // Nothing deleted: tell a missing note from one in another space.
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT space_id FROM note WHERE id = $1")
            .bind(note_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::Database)?;

        match exists {
            Some(_) => Err(DomainError::NoteNotInSpace { note_id, space_id }.into()),
            None => Err(DomainError::NoteNotFound(note_id).into()),
        }
    }

    async fn delete_notes_by_space(&mut self, space_id: Uuid) -> Result<Vec<Note>> {
        let space: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM space WHERE id = $1 FOR SHARE")
            .bind(space_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(Error::Database)?;
        if space.is_none() {
            return Err(DomainError::SpaceNotFound(space_id).into());
        }

        let rows = sqlx::query(&format!(
            "DELETE FROM note WHERE space_id = $1 RETURNING {NOTE_COLUMNS}"
        ))
        .bind(space_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(Error::Database)?;

        let mut notes = rows.iter().map(parse_note_row).collect::<Result<Vec<_>>>()?;
        notes.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(notes)
    }

    async fn insert_space(&mut self, space: &Space) -> Result<()> {
        sqlx::query(
            "INSERT INTO space (id, name, creator, personal, created) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(space.id)
        .bind(&space.name)
        .bind(space.creator)
        .bind(space.personal)
        .bind(space.created)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            map_constraint(e, |constraint| match constraint {
                "space_creator_fkey" => Some(DomainError::UnknownUser(space.creator)),
                _ => None,
            })
        })?;

        sqlx::query("INSERT INTO space_participant (space_id, user_id, joined) VALUES ($1, $2, $3)")
            .bind(space.id)
            .bind(space.creator)
            .bind(space.created)
            .execute(&mut *self.tx)
            .await
            .map_err(Error::Database)?;

        Ok(())
    }

    async fn add_participant(
        &mut self,
        space_id: Uuid,
        user_id: i64,
        joined: DateTime<Utc>,
    ) -> Result<()> {
        let row = sqlx::query(
            "SELECT s.creator, s.personal,
                    EXISTS (SELECT 1 FROM users WHERE id = $2) AS user_exists,
                    EXISTS (SELECT 1 FROM space_participant
                            WHERE space_id = $1 AND user_id = $2) AS member
             FROM space s
             WHERE s.id = $1
             FOR UPDATE OF s",
        )
        .bind(space_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(Error::Database)?
        .ok_or(DomainError::SpaceNotFound(space_id))?;

        if row.get::<bool, _>("personal") {
            return Err(DomainError::PersonalSpace(space_id).into());
        }
        if !row.get::<bool, _>("user_exists") {
            return Err(DomainError::UnknownUser(user_id).into());
        }
        if row.get::<i64, _>("creator") == user_id || row.get::<bool, _>("member") {
            return Err(DomainError::AlreadyParticipant { space_id, user_id }.into());
        }

        sqlx::query("INSERT INTO space_participant (space_id, user_id, joined) VALUES ($1, $2, $3)")
            .bind(space_id)
            .bind(user_id)
            .bind(joined)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                map_constraint(e, |constraint| match constraint {
                    "space_participant_pkey" => {
                        Some(DomainError::AlreadyParticipant { space_id, user_id })
                    }
                    _ => None,
                })
            })?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(Error::Database)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(Error::Database)
    }
}
