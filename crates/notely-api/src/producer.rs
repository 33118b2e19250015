//! The producer: turns inbound write requests into commands on the broker.
//!
//! Every operation stamps a fresh request id and timestamp, validates the
//! command, runs its read-side pre-conditions, and publishes. A returned
//! request id means the command was durably accepted, not that it has been
//! applied.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notely_core::defaults::{PRODUCER_PUBLISH_TIMEOUT_MS, PRODUCER_READ_TIMEOUT_MS};
use notely_core::{
    new_v7, unix_now, AddParticipantRequest, Broker, Command, CreateNoteRequest,
    CreateSpaceRequest, DeleteAllNotesRequest, DeleteNoteRequest, DomainError, Error, Note,
    NoteReader, NoteType, Operation, Result, Space, SpaceReader, Topic, UpdateNoteRequest,
};

/// Deadlines for the producer's synchronous steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Bound on each pre-condition read.
    pub read_timeout: Duration,
    /// Bound on one broker publish.
    pub publish_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(PRODUCER_READ_TIMEOUT_MS),
            publish_timeout: Duration::from_millis(PRODUCER_PUBLISH_TIMEOUT_MS),
        }
    }
}

impl ProducerConfig {
    /// Read `PRODUCER_READ_TIMEOUT_MS` and `PRODUCER_PUBLISH_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let read_ms = std::env::var("PRODUCER_READ_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(PRODUCER_READ_TIMEOUT_MS);
        let publish_ms = std::env::var("PRODUCER_PUBLISH_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(PRODUCER_PUBLISH_TIMEOUT_MS);

        Self {
            read_timeout: Duration::from_millis(read_ms),
            publish_timeout: Duration::from_millis(publish_ms),
        }
    }
}

// =============================================================================
// INBOUND REQUESTS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNoteInput {
    pub user_id: i64,
    pub space_id: Uuid,
    pub text: String,
    #[serde(rename = "type")]
    pub note_type: Option<NoteType>,
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateNoteInput {
    pub user_id: i64,
    pub space_id: Uuid,
    pub note_id: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteNoteInput {
    pub user_id: i64,
    pub space_id: Uuid,
    pub note_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteAllNotesInput {
    pub user_id: i64,
    pub space_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSpaceInput {
    pub user_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddParticipantInput {
    /// The user sending the invitation.
    pub user_id: i64,
    pub space_id: Uuid,
    pub participant_id: i64,
}

// =============================================================================
// PRODUCER
// =============================================================================

/// Gateway from inbound requests to the broker.
#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    notes: Arc<dyn NoteReader>,
    spaces: Arc<dyn SpaceReader>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(
        broker: Arc<dyn Broker>,
        notes: Arc<dyn NoteReader>,
        spaces: Arc<dyn SpaceReader>,
        config: ProducerConfig,
    ) -> Self {
        Self {
            broker,
            notes,
            spaces,
            config,
        }
    }

    /// Accept a new note. The returned request id is also the note's id.
    pub async fn create_note(&self, input: CreateNoteInput) -> Result<Uuid> {
        let cmd = Command::from(CreateNoteRequest {
            request_id: new_v7(),
            operation: Operation::Create,
            created: unix_now(),
            user_id: input.user_id,
            space_id: input.space_id,
            text: input.text,
            note_type: input.note_type,
            file: input.file,
        });
        cmd.validate()?;

        self.require_member(input.space_id, input.user_id).await?;
        self.publish(cmd).await
    }

    /// Accept an edit of a text note.
    pub async fn update_note(&self, input: UpdateNoteInput) -> Result<Uuid> {
        let cmd = Command::from(UpdateNoteRequest {
            request_id: new_v7(),
            operation: Operation::Update,
            created: unix_now(),
            user_id: input.user_id,
            space_id: input.space_id,
            note_id: input.note_id,
            text: input.text,
        });
        cmd.validate()?;

        let note = self.require_note_in_space(input.note_id, input.space_id).await?;
        if !note.note_type.is_updatable() {
            return Err(DomainError::NoteNotUpdatable(note.note_type).into());
        }
        self.require_member(input.space_id, input.user_id).await?;
        self.publish(cmd).await
    }

    pub async fn delete_note(&self, input: DeleteNoteInput) -> Result<Uuid> {
        let cmd = Command::from(DeleteNoteRequest {
            request_id: new_v7(),
            operation: Operation::Delete,
            created: unix_now(),
            space_id: input.space_id,
            note_id: input.note_id,
        });
        cmd.validate()?;

        self.require_note_in_space(input.note_id, input.space_id)
            .await?;
        self.require_member(input.space_id, input.user_id).await?;
        self.publish(cmd).await
    }

    pub async fn delete_all_notes(&self, input: DeleteAllNotesInput) -> Result<Uuid> {
        let cmd = Command::from(DeleteAllNotesRequest {
            request_id: new_v7(),
            operation: Operation::DeleteAll,
            created: unix_now(),
            space_id: input.space_id,
        });
        cmd.validate()?;

        self.require_member(input.space_id, input.user_id).await?;
        self.publish(cmd).await
    }

    /// Accept a new shared space. The returned request id is also the space's id.
    pub async fn create_space(&self, input: CreateSpaceInput) -> Result<Uuid> {
        let cmd = Command::from(CreateSpaceRequest {
            request_id: new_v7(),
            operation: Operation::Create,
            created: unix_now(),
            name: input.name.trim().to_string(),
            creator: input.user_id,
        });
        cmd.validate()?;

        self.require_user(input.user_id).await?;
        self.publish(cmd).await
    }

    /// Accept an invitation of `participant_id` into a shared space.
    pub async fn add_participant(&self, input: AddParticipantInput) -> Result<Uuid> {
        let cmd = Command::from(AddParticipantRequest {
            request_id: new_v7(),
            operation: Operation::Create,
            created: unix_now(),
            space_id: input.space_id,
            participant_id: input.participant_id,
            requester_id: input.user_id,
        });
        cmd.validate()?;

        let space = self.require_space(input.space_id).await?;
        if space.personal {
            return Err(DomainError::PersonalSpace(space.id).into());
        }
        self.require_member(space.id, input.user_id).await?;
        self.require_user(input.participant_id).await?;
        if input.participant_id == input.user_id {
            return Err(DomainError::SelfParticipant.into());
        }

        let participant_id = input.participant_id;
        let already = self
            .read("is_participant", self.spaces.is_participant(space.id, participant_id))
            .await?;
        if already {
            return Err(DomainError::AlreadyParticipant {
                space_id: space.id,
                user_id: participant_id,
            }
            .into());
        }
        if self.invitation_pending(space.id, participant_id).await? {
            return Err(DomainError::InvitationPending {
                space_id: space.id,
                user_id: participant_id,
            }
            .into());
        }

        self.publish(cmd).await
    }

    // -------------------------------------------------------------------------
    // Pre-conditions
    // -------------------------------------------------------------------------

    async fn read<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.read_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    subsystem = "producer",
                    op,
                    timeout_ms = self.config.read_timeout.as_millis() as u64,
                    "Pre-condition read timed out"
                );
                Err(Error::Timeout(format!(
                    "{} exceeded {}ms",
                    op,
                    self.config.read_timeout.as_millis()
                )))
            }
        }
    }

    async fn require_space(&self, space_id: Uuid) -> Result<Space> {
        self.read("get_space", self.spaces.get_space(space_id))
            .await?
            .ok_or_else(|| DomainError::SpaceNotFound(space_id).into())
    }

    async fn require_user(&self, user_id: i64) -> Result<()> {
        match self.read("get_user", self.spaces.get_user(user_id)).await? {
            Some(_) => Ok(()),
            None => Err(DomainError::UnknownUser(user_id).into()),
        }
    }

    /// The space must exist and the user must be its creator or a participant.
    async fn require_member(&self, space_id: Uuid, user_id: i64) -> Result<()> {
        self.require_space(space_id).await?;
        let member = self
            .read("is_participant", self.spaces.is_participant(space_id, user_id))
            .await?;
        if member {
            Ok(())
        } else {
            Err(DomainError::SpaceNotOwned { space_id, user_id }.into())
        }
    }

    async fn require_note_in_space(&self, note_id: Uuid, space_id: Uuid) -> Result<Note> {
        let note = self
            .read("get_note_by_id", self.notes.get_note_by_id(note_id))
            .await?
            .ok_or(DomainError::NoteNotFound(note_id))?;
        if note.space_id != space_id {
            return Err(DomainError::NoteNotInSpace { note_id, space_id }.into());
        }
        Ok(note)
    }

    /// An unacknowledged AddParticipant for the same pair is still in flight.
    ///
    /// The broker narrows the backlog to payloads naming the space; the exact
    /// match is decided on the decoded command.
    async fn invitation_pending(&self, space_id: Uuid, participant_id: i64) -> Result<bool> {
        let needles = [
            "add_participant".to_string(),
            space_id.to_string(),
        ];
        let backlog = self
            .read(
                "pending",
                self.broker.pending_containing(Topic::Spaces, &needles),
            )
            .await?;
        Ok(backlog.iter().any(|delivery| {
            matches!(
                Command::decode(&delivery.payload),
                Ok(Command::AddParticipant(req))
                    if req.space_id == space_id && req.participant_id == participant_id
            )
        }))
    }

    // -------------------------------------------------------------------------
    // Publish
    // -------------------------------------------------------------------------

    async fn publish(&self, cmd: Command) -> Result<Uuid> {
        let start = Instant::now();
        let request_id = cmd.request_id();
        let topic = cmd.topic();
        let payload = cmd.encode()?;

        let published =
            tokio::time::timeout(self.config.publish_timeout, self.broker.publish(topic, payload))
                .await;
        match published {
            Ok(Ok(message_id)) => {
                info!(
                    subsystem = "producer",
                    op = cmd.kind(),
                    %request_id,
                    %topic,
                    message_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Command accepted"
                );
                Ok(request_id)
            }
            Ok(Err(e)) => {
                warn!(
                    subsystem = "producer",
                    op = cmd.kind(),
                    %request_id,
                    %topic,
                    error = %e,
                    "Publish rejected"
                );
                Err(match e {
                    Error::Broker(_) | Error::Timeout(_) => e,
                    other => Error::Broker(other.to_string()),
                })
            }
            Err(_) => {
                debug!(subsystem = "producer", %request_id, %topic, "Publish deadline elapsed");
                Err(Error::Timeout(format!(
                    "publish to {} exceeded {}ms",
                    topic,
                    self.config.publish_timeout.as_millis()
                )))
            }
        }
    }
}
