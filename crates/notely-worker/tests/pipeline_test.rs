//! End-to-end tests of the consumer pipeline on in-process backends.
//!
//! Each test publishes commands to a [`MemoryBroker`] and drives the worker
//! either one delivery at a time (`step`) or through the running loops.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use notely_core::memory::{MemoryBroker, MemoryIndex, MemoryStore};
use notely_core::{
    new_v7, unix_now, AddParticipantRequest, Broker, Command, CreateNoteRequest,
    CreateSpaceRequest, DeleteAllNotesRequest, DeleteNoteRequest, NewUser, NoteReader, NoteType,
    Operation, SearchIndex, SpaceReader, Topic, UpdateNoteRequest, User, WriteStore,
};
use notely_worker::{CommandWorker, Disposition, WorkerBuilder, WorkerConfig, WorkerEvent};

struct Harness {
    broker: MemoryBroker,
    store: MemoryStore,
    index: MemoryIndex,
    worker: CommandWorker,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(WorkerConfig::default().with_poll_interval(10))
    }

    fn with_config(config: WorkerConfig) -> Self {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let index = MemoryIndex::new();
        let worker = WorkerBuilder::new(
            Arc::new(broker.clone()),
            Arc::new(store.clone()),
            Arc::new(index.clone()),
        )
        .with_config(config)
        .build();
        Self {
            broker,
            store,
            index,
            worker,
        }
    }

    async fn user(&self, tg_id: i64) -> User {
        self.store
            .register_user(NewUser {
                tg_id,
                username: None,
            })
            .await
            .unwrap()
    }

    async fn publish(&self, cmd: impl Into<Command>) -> Uuid {
        let cmd = cmd.into();
        self.broker
            .publish(cmd.topic(), cmd.encode().unwrap())
            .await
            .unwrap();
        cmd.request_id()
    }

    /// Receive, process, and settle the head of a topic.
    async fn step(&self, topic: Topic) -> Disposition {
        let delivery = self
            .broker
            .receive(topic, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("a message to be pending");
        let disposition = self.worker.process(&delivery).await;
        match &disposition {
            Disposition::Ack(_) => self.broker.ack(&delivery).await.unwrap(),
            Disposition::Nack(_) => self.broker.nack(&delivery).await.unwrap(),
        }
        disposition
    }

    async fn shared_space(&self, creator: &User, name: &str) -> Uuid {
        let id = self
            .publish(CreateSpaceRequest {
                request_id: new_v7(),
                operation: Operation::Create,
                created: unix_now(),
                name: name.to_string(),
                creator: creator.id,
            })
            .await;
        assert!(matches!(self.step(Topic::Spaces).await, Disposition::Ack(WorkerEvent::CommandApplied { .. })));
        id
    }
}

fn create_note(user: &User, space_id: Uuid, text: &str) -> CreateNoteRequest {
    CreateNoteRequest {
        request_id: new_v7(),
        operation: Operation::Create,
        created: unix_now(),
        user_id: user.id,
        space_id,
        text: text.to_string(),
        note_type: Some(NoteType::Text),
        file: None,
    }
}

fn update_note(user: &User, space_id: Uuid, note_id: Uuid, text: &str) -> UpdateNoteRequest {
    UpdateNoteRequest {
        request_id: new_v7(),
        operation: Operation::Update,
        created: unix_now(),
        user_id: user.id,
        space_id,
        note_id,
        text: text.to_string(),
    }
}

fn delete_note(space_id: Uuid, note_id: Uuid) -> DeleteNoteRequest {
    DeleteNoteRequest {
        request_id: new_v7(),
        operation: Operation::Delete,
        created: unix_now(),
        space_id,
        note_id,
    }
}

fn delete_all(space_id: Uuid) -> DeleteAllNotesRequest {
    DeleteAllNotesRequest {
        request_id: new_v7(),
        operation: Operation::DeleteAll,
        created: unix_now(),
        space_id,
    }
}

fn is_applied(d: &Disposition) -> bool {
    matches!(d, Disposition::Ack(WorkerEvent::CommandApplied { .. }))
}

fn is_dropped(d: &Disposition) -> bool {
    matches!(d, Disposition::Ack(WorkerEvent::CommandDropped { .. }))
}

fn is_retried(d: &Disposition) -> bool {
    matches!(d, Disposition::Nack(WorkerEvent::CommandRetried { .. }))
}

fn is_duplicate(d: &Disposition) -> bool {
    matches!(d, Disposition::Ack(WorkerEvent::CommandDuplicate { .. }))
}

// ============================================================================
// CREATE / READ
// ============================================================================

#[tokio::test]
async fn test_create_then_read_back() {
    let h = Harness::new();
    let alice = h.user(1).await;

    let note_id = h
        .publish(create_note(&alice, alice.personal_space_id, "buy milk"))
        .await;
    assert!(is_applied(&h.step(Topic::Notes).await));

    let note = h.store.get_note_by_id(note_id).await.unwrap().unwrap();
    assert_eq!(note.text, "buy milk");
    assert_eq!(note.space_id, alice.personal_space_id);
    assert!(note.last_edit.is_none());

    let doc = h.index.get(note_id).expect("document indexed");
    assert_eq!(doc.text, "buy milk");
    assert_eq!(h.broker.depth(Topic::Notes), 0);
}

#[tokio::test]
async fn test_media_note_keeps_file_reference() {
    let h = Harness::new();
    let alice = h.user(1).await;

    let mut cmd = create_note(&alice, alice.personal_space_id, "sunset");
    cmd.note_type = Some(NoteType::Photo);
    cmd.file = Some("file-123".to_string());
    let note_id = h.publish(cmd).await;
    assert!(is_applied(&h.step(Topic::Notes).await));

    let note = h.store.get_note_by_id(note_id).await.unwrap().unwrap();
    assert_eq!(note.note_type, NoteType::Photo);
    assert_eq!(note.file.as_deref(), Some("file-123"));
}

#[tokio::test]
async fn test_create_in_foreign_space_is_dropped() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let bob = h.user(2).await;

    h.publish(create_note(&bob, alice.personal_space_id, "intrusion"))
        .await;
    assert!(is_dropped(&h.step(Topic::Notes).await));
    assert_eq!(h.store.note_count().await, 0);
    assert!(h.index.is_empty());
}

#[tokio::test]
async fn test_create_in_missing_space_is_dropped() {
    let h = Harness::new();
    let alice = h.user(1).await;

    h.publish(create_note(&alice, new_v7(), "nowhere")).await;
    match h.step(Topic::Notes).await {
        Disposition::Ack(WorkerEvent::CommandDropped { reason, .. }) => {
            assert!(reason.contains("space does not exist"), "{reason}");
        }
        other => panic!("expected drop, got {other:?}"),
    }
}

// ============================================================================
// IDEMPOTENCE AND ORDERING
// ============================================================================

#[tokio::test]
async fn test_redelivered_create_is_applied_once() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let cmd = Command::from(create_note(&alice, alice.personal_space_id, "once"));
    let payload = cmd.encode().unwrap();

    h.broker.publish(Topic::Notes, payload.clone()).await.unwrap();
    h.broker.publish(Topic::Notes, payload).await.unwrap();

    assert!(is_applied(&h.step(Topic::Notes).await));
    assert!(matches!(
        h.step(Topic::Notes).await,
        Disposition::Ack(WorkerEvent::CommandDuplicate { .. })
    ));
    assert_eq!(h.store.note_count().await, 1);
    assert_eq!(h.index.len(), 1);
}

#[tokio::test]
async fn test_commands_apply_in_publish_order() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let space = alice.personal_space_id;

    let note_id = h.publish(create_note(&alice, space, "buy milk")).await;
    h.publish(update_note(&alice, space, note_id, "buy oat milk"))
        .await;
    h.publish(update_note(&alice, space, note_id, "buy oat milk and bread"))
        .await;

    for _ in 0..3 {
        assert!(is_applied(&h.step(Topic::Notes).await));
    }

    let note = h.store.get_note_by_id(note_id).await.unwrap().unwrap();
    assert_eq!(note.text, "buy oat milk and bread");
    assert!(note.last_edit.is_some());
    assert_eq!(h.index.get(note_id).unwrap().text, "buy oat milk and bread");
}

// ============================================================================
// UPDATE / DELETE
// ============================================================================

#[tokio::test]
async fn test_update_media_note_is_rejected() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let space = alice.personal_space_id;

    let mut photo = create_note(&alice, space, "sunset");
    photo.note_type = Some(NoteType::Photo);
    let note_id = h.publish(photo).await;
    h.step(Topic::Notes).await;

    h.publish(update_note(&alice, space, note_id, "new caption"))
        .await;
    match h.step(Topic::Notes).await {
        Disposition::Ack(WorkerEvent::CommandDropped { reason, .. }) => {
            assert_eq!(reason, "note of type photo can't be updated");
        }
        other => panic!("expected drop, got {other:?}"),
    }
    assert_eq!(h.index.get(note_id).unwrap().text, "sunset");
}

#[tokio::test]
async fn test_delete_from_wrong_space_changes_nothing() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let bob = h.user(2).await;

    let note_id = h
        .publish(create_note(&alice, alice.personal_space_id, "keep me"))
        .await;
    h.step(Topic::Notes).await;

    h.publish(delete_note(bob.personal_space_id, note_id)).await;
    assert!(is_dropped(&h.step(Topic::Notes).await));

    assert!(h.store.get_note_by_id(note_id).await.unwrap().is_some());
    assert!(h.index.get(note_id).is_some());
}

#[tokio::test]
async fn test_delete_removes_from_both_stores() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let space = alice.personal_space_id;

    let note_id = h.publish(create_note(&alice, space, "temp")).await;
    h.step(Topic::Notes).await;
    h.publish(delete_note(space, note_id)).await;
    assert!(is_applied(&h.step(Topic::Notes).await));

    assert!(h.store.get_note_by_id(note_id).await.unwrap().is_none());
    assert!(h.index.get(note_id).is_none());
}

#[tokio::test]
async fn test_delete_all_clears_space_in_both_stores() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let bob = h.user(2).await;
    let space = alice.personal_space_id;

    for i in 0..5 {
        h.publish(create_note(&alice, space, &format!("note {i}")))
            .await;
        h.step(Topic::Notes).await;
    }
    let other = h
        .publish(create_note(&bob, bob.personal_space_id, "bob's"))
        .await;
    h.step(Topic::Notes).await;

    h.publish(delete_all(space)).await;
    assert!(is_applied(&h.step(Topic::Notes).await));

    assert!(h.store.get_all_notes_by_space_id(space).await.unwrap().is_empty());
    assert_eq!(h.index.count_in_space(space), 0);
    assert!(h.store.get_note_by_id(other).await.unwrap().is_some());
    assert!(h.index.get(other).is_some());
}

#[tokio::test]
async fn test_delete_all_index_failure_keeps_everything_then_retries() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let space = alice.personal_space_id;

    for i in 0..3 {
        h.publish(create_note(&alice, space, &format!("note {i}")))
            .await;
        h.step(Topic::Notes).await;
    }

    h.publish(delete_all(space)).await;
    h.index.fail_next_writes(1);
    assert!(is_retried(&h.step(Topic::Notes).await));

    assert_eq!(h.store.get_all_notes_by_space_id(space).await.unwrap().len(), 3);
    assert_eq!(h.index.count_in_space(space), 3);
    assert_eq!(h.broker.depth(Topic::Notes), 1);

    assert!(is_applied(&h.step(Topic::Notes).await));
    assert!(h.store.get_all_notes_by_space_id(space).await.unwrap().is_empty());
    assert_eq!(h.index.count_in_space(space), 0);
}

#[tokio::test]
async fn test_delete_all_partial_index_delete_restores_documents() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let space = alice.personal_space_id;

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(
            h.publish(create_note(&alice, space, &format!("note {i}")))
                .await,
        );
        h.step(Topic::Notes).await;
    }

    // The delete-by-query removes every document, then reports failure.
    h.publish(delete_all(space)).await;
    h.index.fail_next_space_deletes_after_apply(1);
    assert!(is_retried(&h.step(Topic::Notes).await));

    assert_eq!(h.store.get_all_notes_by_space_id(space).await.unwrap().len(), 4);
    assert_eq!(h.index.count_in_space(space), 4);
    for id in &ids {
        assert!(h.store.get_note_by_id(*id).await.unwrap().is_some());
        assert!(h.index.get(*id).is_some());
    }

    assert!(is_applied(&h.step(Topic::Notes).await));
    assert!(h.store.get_all_notes_by_space_id(space).await.unwrap().is_empty());
    assert_eq!(h.index.count_in_space(space), 0);
}

// ============================================================================
// SPACES
// ============================================================================

#[tokio::test]
async fn test_participant_can_write_to_shared_space() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let bob = h.user(2).await;
    let family = h.shared_space(&alice, "Family").await;

    let space = h.store.get_space(family).await.unwrap().unwrap();
    assert!(!space.personal);
    assert_eq!(space.creator, alice.id);

    h.publish(AddParticipantRequest {
        request_id: new_v7(),
        operation: Operation::Create,
        created: unix_now(),
        space_id: family,
        participant_id: bob.id,
        requester_id: alice.id,
    })
    .await;
    assert!(is_applied(&h.step(Topic::Spaces).await));
    assert!(h.store.is_participant(family, bob.id).await.unwrap());

    h.publish(create_note(&bob, family, "buy milk")).await;
    assert!(is_applied(&h.step(Topic::Notes).await));
    assert_eq!(h.index.search(family, "milk", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_add_participant_to_personal_space_is_dropped() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let bob = h.user(2).await;

    h.publish(AddParticipantRequest {
        request_id: new_v7(),
        operation: Operation::Create,
        created: unix_now(),
        space_id: alice.personal_space_id,
        participant_id: bob.id,
        requester_id: alice.id,
    })
    .await;
    assert!(is_dropped(&h.step(Topic::Spaces).await));
}

// ============================================================================
// FAILURE HANDLING
// ============================================================================

#[tokio::test]
async fn test_poison_message_is_dropped_and_does_not_block() {
    let h = Harness::new();
    let alice = h.user(1).await;

    h.broker
        .publish(Topic::Notes, "{not json".to_string())
        .await
        .unwrap();
    h.publish(create_note(&alice, alice.personal_space_id, "after poison"))
        .await;

    assert!(is_dropped(&h.step(Topic::Notes).await));
    assert!(is_applied(&h.step(Topic::Notes).await));
}

#[tokio::test]
async fn test_invalid_command_is_dropped_without_effect() {
    let h = Harness::new();
    let alice = h.user(1).await;

    let mut cmd = create_note(&alice, alice.personal_space_id, "x");
    cmd.text = "   ".to_string();
    h.broker
        .publish(Topic::Notes, Command::from(cmd.clone()).encode().unwrap())
        .await
        .unwrap();

    match h.step(Topic::Notes).await {
        Disposition::Ack(WorkerEvent::CommandDropped { reason, request_id, .. }) => {
            assert_eq!(reason, "Validation error: text not filled");
            assert_eq!(request_id, Some(cmd.request_id));
        }
        other => panic!("expected drop, got {other:?}"),
    }
    assert_eq!(h.store.note_count().await, 0);
    assert!(!h.store.is_processed(cmd.request_id).await);
}

#[tokio::test]
async fn test_command_on_wrong_topic_is_dropped() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let cmd = Command::from(create_note(&alice, alice.personal_space_id, "x"));

    h.broker
        .publish(Topic::Spaces, cmd.encode().unwrap())
        .await
        .unwrap();
    assert!(is_dropped(&h.step(Topic::Spaces).await));
    assert_eq!(h.store.note_count().await, 0);
}

#[tokio::test]
async fn test_index_failure_on_create_rolls_back_and_retries() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let note_id = h
        .publish(create_note(&alice, alice.personal_space_id, "retry me"))
        .await;

    h.index.fail_next_writes(1);
    assert!(is_retried(&h.step(Topic::Notes).await));
    assert!(h.store.get_note_by_id(note_id).await.unwrap().is_none());
    assert!(!h.store.is_processed(note_id).await);

    assert!(is_applied(&h.step(Topic::Notes).await));
    assert!(h.store.get_note_by_id(note_id).await.unwrap().is_some());
    assert!(h.index.get(note_id).is_some());
}

#[tokio::test]
async fn test_commit_failure_compensates_index() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let note_id = h
        .publish(create_note(&alice, alice.personal_space_id, "lost commit"))
        .await;

    h.store.fail_next_commits(1);
    assert!(is_retried(&h.step(Topic::Notes).await));
    assert!(h.store.get_note_by_id(note_id).await.unwrap().is_none());
    assert!(h.index.get(note_id).is_none());

    assert!(is_applied(&h.step(Topic::Notes).await));
    assert!(h.index.get(note_id).is_some());
}

#[tokio::test]
async fn test_commit_failure_on_update_restores_previous_document() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let space = alice.personal_space_id;
    let note_id = h.publish(create_note(&alice, space, "original")).await;
    h.step(Topic::Notes).await;

    h.publish(update_note(&alice, space, note_id, "edited")).await;
    h.store.fail_next_commits(1);
    assert!(is_retried(&h.step(Topic::Notes).await));

    assert_eq!(h.index.get(note_id).unwrap().text, "original");
    assert_eq!(
        h.store.get_note_by_id(note_id).await.unwrap().unwrap().text,
        "original"
    );
}

#[tokio::test]
async fn test_landed_commit_reported_as_failed_resyncs_index_on_redelivery() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let note_id = h
        .publish(create_note(&alice, alice.personal_space_id, "landed"))
        .await;

    h.store.fail_next_commits_after_apply(1);
    assert!(is_retried(&h.step(Topic::Notes).await));
    // Committed, but the index was compensated.
    assert!(h.store.get_note_by_id(note_id).await.unwrap().is_some());
    assert!(h.index.get(note_id).is_none());

    assert!(is_duplicate(&h.step(Topic::Notes).await));
    let stored = h.store.get_note_by_id(note_id).await.unwrap().unwrap();
    assert_eq!(h.index.get(note_id).unwrap().text, stored.text);
    assert_eq!(h.broker.depth(Topic::Notes), 0);
}

#[tokio::test]
async fn test_landed_update_reported_as_failed_resyncs_index() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let space = alice.personal_space_id;
    let note_id = h.publish(create_note(&alice, space, "original")).await;
    h.step(Topic::Notes).await;

    h.publish(update_note(&alice, space, note_id, "edited")).await;
    h.store.fail_next_commits_after_apply(1);
    assert!(is_retried(&h.step(Topic::Notes).await));
    assert_eq!(h.index.get(note_id).unwrap().text, "original");

    assert!(is_duplicate(&h.step(Topic::Notes).await));
    assert_eq!(
        h.store.get_note_by_id(note_id).await.unwrap().unwrap().text,
        "edited"
    );
    assert_eq!(h.index.get(note_id).unwrap().text, "edited");
}

#[tokio::test]
async fn test_landed_delete_all_reported_as_failed_resyncs_index() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let space = alice.personal_space_id;
    for i in 0..3 {
        h.publish(create_note(&alice, space, &format!("note {i}")))
            .await;
        h.step(Topic::Notes).await;
    }

    h.publish(delete_all(space)).await;
    h.store.fail_next_commits_after_apply(1);
    assert!(is_retried(&h.step(Topic::Notes).await));
    assert!(h.store.get_all_notes_by_space_id(space).await.unwrap().is_empty());
    assert_eq!(h.index.count_in_space(space), 3);

    assert!(is_duplicate(&h.step(Topic::Notes).await));
    assert_eq!(h.index.count_in_space(space), 0);
}

#[tokio::test]
async fn test_duplicate_resync_failure_is_retried() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let note_id = h
        .publish(create_note(&alice, alice.personal_space_id, "landed"))
        .await;

    h.store.fail_next_commits_after_apply(1);
    assert!(is_retried(&h.step(Topic::Notes).await));

    h.index.fail_next_writes(1);
    assert!(is_retried(&h.step(Topic::Notes).await));
    assert!(h.index.get(note_id).is_none());

    assert!(is_duplicate(&h.step(Topic::Notes).await));
    assert!(h.index.get(note_id).is_some());
}

#[tokio::test]
async fn test_message_over_max_deliveries_is_dropped() {
    let h = Harness::with_config(WorkerConfig::default().with_max_deliveries(2));
    let alice = h.user(1).await;
    h.publish(create_note(&alice, alice.personal_space_id, "doomed"))
        .await;

    h.index.set_fail_writes(true);
    assert!(is_retried(&h.step(Topic::Notes).await));
    assert!(is_retried(&h.step(Topic::Notes).await));
    match h.step(Topic::Notes).await {
        Disposition::Ack(WorkerEvent::CommandDropped { reason, .. }) => {
            assert_eq!(reason, "exceeded max deliveries");
        }
        other => panic!("expected drop, got {other:?}"),
    }
    assert_eq!(h.broker.depth(Topic::Notes), 0);
    assert_eq!(h.store.note_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_command_timeout_rolls_back_and_retries() {
    let h = Harness::with_config(
        WorkerConfig::default().with_command_timeout(Duration::from_millis(100)),
    );
    let alice = h.user(1).await;
    let note_id = h
        .publish(create_note(&alice, alice.personal_space_id, "slow"))
        .await;

    // Holding a transaction blocks the worker's begin().
    let blocker = h.store.begin().await.unwrap();
    match h.step(Topic::Notes).await {
        Disposition::Nack(WorkerEvent::CommandRetried { error, .. }) => {
            assert!(error.contains("Timed out"), "{error}");
        }
        other => panic!("expected retry, got {other:?}"),
    }
    drop(blocker);

    assert!(is_applied(&h.step(Topic::Notes).await));
    assert!(h.store.get_note_by_id(note_id).await.unwrap().is_some());
}

// ============================================================================
// RUNNING WORKER
// ============================================================================

#[tokio::test]
async fn test_running_worker_applies_and_shuts_down() {
    let h = Harness::new();
    let alice = h.user(1).await;
    let mut events = h.worker.events();
    let handle = h.worker.clone().start();

    let note_id = h
        .publish(create_note(&alice, alice.personal_space_id, "live"))
        .await;

    let applied = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::CommandApplied { request_id, .. }) => break request_id,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("command applied in time");
    assert_eq!(applied, note_id);
    assert!(h.index.get(note_id).is_some());

    handle.shutdown().await.unwrap();
    handle.join().await;

    let mut saw_stopped = false;
    while let Ok(event) = events.try_recv() {
        if event == WorkerEvent::WorkerStopped {
            saw_stopped = true;
        }
    }
    assert!(saw_stopped);
}

#[tokio::test]
async fn test_dropped_handle_stops_consumer_loops() {
    let h = Harness::new();
    let mut events = h.worker.events();
    let handle = h.worker.clone().start();
    drop(handle);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::WorkerStopped) => break,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("worker stopped after its handle was dropped");
}

#[tokio::test]
async fn test_replicated_consumers_preserve_order() {
    let h = Harness::with_config(
        WorkerConfig::default()
            .with_poll_interval(5)
            .with_replicas(3),
    );
    let alice = h.user(1).await;
    let space = alice.personal_space_id;
    let mut events = h.worker.events();

    let note_id = h.publish(create_note(&alice, space, "v0")).await;
    for i in 1..=10 {
        h.publish(update_note(&alice, space, note_id, &format!("v{i}")))
            .await;
    }

    let handle = h.worker.clone().start();
    let mut applied = 0;
    tokio::time::timeout(Duration::from_secs(10), async {
        while applied < 11 {
            if let Ok(WorkerEvent::CommandApplied { .. }) = events.recv().await {
                applied += 1;
            }
        }
    })
    .await
    .expect("all commands applied");

    handle.shutdown().await.unwrap();
    handle.join().await;

    assert_eq!(
        h.store.get_note_by_id(note_id).await.unwrap().unwrap().text,
        "v10"
    );
    assert_eq!(h.index.get(note_id).unwrap().text, "v10");
}
