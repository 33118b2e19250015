//! Applies one validated command to the relational store and search index.
//!
//! The relational transaction stays open across the index write. The index
//! write happens before commit, so a failed index write rolls the relational
//! change back. Any index effect that outlives a failure (a partial
//! delete-by-query, or a commit that fails after the index was written) is
//! compensated by restoring the documents the relational store still holds.
//!
//! A commit can land even though it reports failure. The compensation then
//! leaves the index behind the store, so a redelivered request that turns out
//! to be a duplicate re-syncs the documents it touched from committed rows
//! before it is acknowledged.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use notely_core::{
    from_unix, Command, Error, Note, NoteDocument, NoteType, Result, SearchIndex, Space,
    WriteStore, WriteTx,
};

/// Result of applying a command that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The mutation was committed.
    Applied,
    /// The request id was already recorded. The store was left as is and the
    /// index re-synced from it.
    Duplicate,
}

/// What the index must do once the relational write has succeeded.
#[derive(Debug)]
enum IndexEffect {
    None,
    Index(Note),
    Update { before: Note, after: Note },
    Delete(Note),
    DeleteSpace { space_id: Uuid, notes: Vec<Note> },
    /// Make one document match the committed row, or drop it if the row is gone.
    Resync { note_id: Uuid, note: Option<Note> },
    /// Make a space's documents match its committed rows.
    ResyncSpace { space_id: Uuid, notes: Vec<Note> },
}

impl IndexEffect {
    async fn apply(&self, index: &dyn SearchIndex) -> Result<()> {
        match self {
            IndexEffect::None => Ok(()),
            IndexEffect::Index(note) => index.index_document(&NoteDocument::from(note)).await,
            IndexEffect::Update { after, .. } => {
                index.update_document(&NoteDocument::from(after)).await
            }
            IndexEffect::Delete(note) => index.delete_document(note.id).await,
            IndexEffect::DeleteSpace { space_id, .. } => {
                index.delete_by_space(*space_id).await.map(|_| ())
            }
            IndexEffect::Resync { note_id, note } => match note {
                Some(note) => index.update_document(&NoteDocument::from(note)).await,
                None => index.delete_document(*note_id).await,
            },
            IndexEffect::ResyncSpace { space_id, notes } => {
                index.delete_by_space(*space_id).await?;
                reindex(index, notes).await
            }
        }
    }

    /// Return the index to the state matching the uncommitted relational store.
    async fn compensate(&self, index: &dyn SearchIndex) {
        let result = match self {
            IndexEffect::None | IndexEffect::Resync { .. } | IndexEffect::ResyncSpace { .. } => {
                Ok(())
            }
            IndexEffect::Index(note) => index.delete_document(note.id).await,
            IndexEffect::Update { before, .. } => {
                index.update_document(&NoteDocument::from(before)).await
            }
            IndexEffect::Delete(note) => index.index_document(&NoteDocument::from(note)).await,
            IndexEffect::DeleteSpace { notes, .. } => reindex(index, notes).await,
        };

        if let Err(e) = result {
            error!(
                subsystem = "worker",
                component = "applier",
                effect = self.name(),
                error = %e,
                "Index compensation failed, index may diverge from store"
            );
        }
    }

    fn name(&self) -> &'static str {
        match self {
            IndexEffect::None => "none",
            IndexEffect::Index(_) => "index",
            IndexEffect::Update { .. } => "update",
            IndexEffect::Delete(_) => "delete",
            IndexEffect::DeleteSpace { .. } => "delete_by_space",
            IndexEffect::Resync { .. } => "resync",
            IndexEffect::ResyncSpace { .. } => "resync_space",
        }
    }
}

async fn reindex(index: &dyn SearchIndex, notes: &[Note]) -> Result<()> {
    let docs: Vec<NoteDocument> = notes.iter().map(NoteDocument::from).collect();
    join_all(docs.iter().map(|doc| index.index_document(doc)))
        .await
        .into_iter()
        .collect::<Result<Vec<()>>>()
        .map(|_| ())
}

enum Staged {
    Duplicate(IndexEffect),
    Ready(Box<dyn WriteTx>, IndexEffect),
}

/// Applies commands inside one relational transaction plus one index write.
#[derive(Clone)]
pub struct Applier {
    store: Arc<dyn WriteStore>,
    index: Arc<dyn SearchIndex>,
}

impl Applier {
    pub fn new(store: Arc<dyn WriteStore>, index: Arc<dyn SearchIndex>) -> Self {
        Self { store, index }
    }

    /// Apply a validated command within `budget`.
    ///
    /// The relational phase and the index write each abort when the budget
    /// runs out. The commit itself is never cancelled.
    pub async fn apply(&self, cmd: &Command, budget: Duration) -> Result<Outcome> {
        let deadline = Instant::now() + budget;

        let staged = timeout_at(deadline, self.stage(cmd))
            .await
            .map_err(|_| Error::Timeout(format!("{} relational write", cmd.kind())))??;

        let (tx, effect) = match staged {
            Staged::Duplicate(resync) => {
                debug!(
                    subsystem = "worker",
                    request_id = %cmd.request_id(),
                    kind = cmd.kind(),
                    effect = resync.name(),
                    "Request already applied, re-syncing index"
                );
                timeout_at(deadline, resync.apply(self.index.as_ref()))
                    .await
                    .map_err(|_| Error::Timeout(format!("{} index re-sync", cmd.kind())))??;
                return Ok(Outcome::Duplicate);
            }
            Staged::Ready(tx, effect) => (tx, effect),
        };

        let indexed = match timeout_at(deadline, effect.apply(self.index.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{} index write", cmd.kind()))),
        };
        if let Err(e) = indexed {
            warn!(
                subsystem = "worker",
                request_id = %cmd.request_id(),
                kind = cmd.kind(),
                effect = effect.name(),
                error = %e,
                "Index write failed, rolling back"
            );
            if let Err(rollback_err) = tx.rollback().await {
                warn!(subsystem = "worker", error = %rollback_err, "Rollback failed, transaction dropped");
            }
            effect.compensate(self.index.as_ref()).await;
            return Err(e);
        }

        if let Err(e) = tx.commit().await {
            error!(
                subsystem = "worker",
                request_id = %cmd.request_id(),
                kind = cmd.kind(),
                error = %e,
                "Commit failed after index write, compensating"
            );
            effect.compensate(self.index.as_ref()).await;
            return Err(e);
        }

        Ok(Outcome::Applied)
    }

    /// Open a transaction, record the request, and run the relational mutation.
    async fn stage(&self, cmd: &Command) -> Result<Staged> {
        let mut tx = self.store.begin().await?;
        if !tx.record_request(cmd.request_id(), cmd.topic()).await? {
            let resync = Self::resync_effect(tx.as_mut(), cmd).await?;
            tx.rollback().await?;
            return Ok(Staged::Duplicate(resync));
        }

        let effect = match cmd {
            Command::CreateNote(c) => {
                let note = Note {
                    id: c.request_id,
                    space_id: c.space_id,
                    user_id: c.user_id,
                    note_type: c.note_type.unwrap_or(NoteType::Text),
                    text: c.text.clone(),
                    file: c.file.clone(),
                    created: from_unix(c.created),
                    last_edit: None,
                };
                tx.insert_note(&note).await?;
                IndexEffect::Index(note)
            }
            Command::UpdateNote(c) => {
                let edit = tx
                    .update_note_text(
                        c.note_id,
                        c.space_id,
                        c.user_id,
                        &c.text,
                        from_unix(c.created),
                    )
                    .await?;
                IndexEffect::Update {
                    before: edit.before,
                    after: edit.after,
                }
            }
            Command::DeleteNote(c) => {
                let note = tx.delete_note(c.note_id, c.space_id).await?;
                IndexEffect::Delete(note)
            }
            Command::DeleteAllNotes(c) => {
                let notes = tx.delete_notes_by_space(c.space_id).await?;
                IndexEffect::DeleteSpace {
                    space_id: c.space_id,
                    notes,
                }
            }
            Command::CreateSpace(c) => {
                let space = Space {
                    id: c.request_id,
                    name: c.name.clone(),
                    creator: c.creator,
                    personal: false,
                    created: from_unix(c.created),
                };
                tx.insert_space(&space).await?;
                IndexEffect::None
            }
            Command::AddParticipant(c) => {
                tx.add_participant(c.space_id, c.participant_id, from_unix(c.created))
                    .await?;
                IndexEffect::None
            }
        };

        Ok(Staged::Ready(tx, effect))
    }

    /// Committed state of whatever an already-applied command touched.
    async fn resync_effect(tx: &mut dyn WriteTx, cmd: &Command) -> Result<IndexEffect> {
        let note_id = match cmd {
            Command::CreateNote(c) => c.request_id,
            Command::UpdateNote(c) => c.note_id,
            Command::DeleteNote(c) => c.note_id,
            Command::DeleteAllNotes(c) => {
                let notes = tx.find_notes_by_space(c.space_id).await?;
                return Ok(IndexEffect::ResyncSpace {
                    space_id: c.space_id,
                    notes,
                });
            }
            Command::CreateSpace(_) | Command::AddParticipant(_) => return Ok(IndexEffect::None),
        };
        let note = tx.find_note(note_id).await?;
        Ok(IndexEffect::Resync { note_id, note })
    }
}
