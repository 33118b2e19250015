//! Integration tests for the transactional write path and read repositories.
//!
//! Require a running PostgreSQL instance; run with `cargo test -- --ignored`.

use chrono::Utc;
use uuid::Uuid;

use notely_core::{
    new_v7, DomainError, Error, NewUser, Note, NoteReader, NoteType, SpaceReader, Topic,
    WriteStore,
};
use notely_db::test_fixtures::TestDatabase;

async fn setup() -> TestDatabase {
    dotenvy::dotenv().ok();
    TestDatabase::new().await
}

fn note(space_id: Uuid, user_id: i64, note_type: NoteType, text: &str) -> Note {
    Note {
        id: new_v7(),
        space_id,
        user_id,
        note_type,
        text: text.to_string(),
        file: None,
        created: Utc::now(),
        last_edit: None,
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_register_creates_personal_space() {
    let test_db = setup().await;
    let user = test_db.user(1001).await;

    let space = test_db
        .db
        .spaces
        .get_space(user.personal_space_id)
        .await
        .unwrap()
        .unwrap();
    assert!(space.personal);
    assert_eq!(space.creator, user.id);
    assert!(test_db
        .db
        .spaces
        .is_participant(space.id, user.id)
        .await
        .unwrap());

    let by_tg = test_db.db.spaces.get_user_by_tg_id(1001).await.unwrap();
    assert_eq!(by_tg.map(|u| u.id), Some(user.id));

    let dup = test_db
        .db
        .users
        .register(NewUser {
            tg_id: 1001,
            username: None,
        })
        .await;
    assert!(matches!(
        dup,
        Err(Error::Domain(DomainError::UserAlreadyExists(1001)))
    ));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_insert_commit_and_read_back() {
    let test_db = setup().await;
    let user = test_db.user(2001).await;
    let n = note(user.personal_space_id, user.id, NoteType::Text, "buy milk");

    let mut tx = test_db.db.writer.begin().await.unwrap();
    assert!(tx.record_request(n.id, Topic::Notes).await.unwrap());
    tx.insert_note(&n).await.unwrap();
    tx.commit().await.unwrap();

    let stored = test_db.db.notes.get_note_by_id(n.id).await.unwrap().unwrap();
    assert_eq!(stored.text, "buy milk");
    assert_eq!(stored.note_type, NoteType::Text);

    let mut tx = test_db.db.writer.begin().await.unwrap();
    assert!(!tx.record_request(n.id, Topic::Notes).await.unwrap());
    assert_eq!(tx.find_note(n.id).await.unwrap(), Some(stored));
    assert_eq!(
        tx.find_notes_by_space(user.personal_space_id)
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(tx.find_note(new_v7()).await.unwrap().is_none());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_dropped_transaction_rolls_back() {
    let test_db = setup().await;
    let user = test_db.user(3001).await;
    let n = note(user.personal_space_id, user.id, NoteType::Text, "draft");

    {
        let mut tx = test_db.db.writer.begin().await.unwrap();
        tx.insert_note(&n).await.unwrap();
    }

    assert!(test_db.db.notes.get_note_by_id(n.id).await.unwrap().is_none());
    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_update_rejects_media_and_wrong_space() {
    let test_db = setup().await;
    let user = test_db.user(4001).await;
    let photo = note(user.personal_space_id, user.id, NoteType::Photo, "sunset");

    let mut tx = test_db.db.writer.begin().await.unwrap();
    tx.insert_note(&photo).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = test_db.db.writer.begin().await.unwrap();
    let err = tx
        .update_note_text(photo.id, user.personal_space_id, user.id, "x", Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Domain(DomainError::NoteNotUpdatable(NoteType::Photo))
    ));
    drop(tx);

    let mut tx = test_db.db.writer.begin().await.unwrap();
    let err = tx.delete_note(photo.id, new_v7()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Domain(DomainError::NoteNotInSpace { .. })
    ));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_delete_notes_by_space_only_touches_that_space() {
    let test_db = setup().await;
    let alice = test_db.user(5001).await;
    let bob = test_db.user(5002).await;

    let mut tx = test_db.db.writer.begin().await.unwrap();
    for i in 0..3 {
        let n = note(alice.personal_space_id, alice.id, NoteType::Text, &format!("a{i}"));
        tx.insert_note(&n).await.unwrap();
    }
    let keep = note(bob.personal_space_id, bob.id, NoteType::Text, "bob");
    tx.insert_note(&keep).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = test_db.db.writer.begin().await.unwrap();
    let removed = tx
        .delete_notes_by_space(alice.personal_space_id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(removed.len(), 3);
    assert!(test_db
        .db
        .notes
        .get_all_notes_by_space_id(alice.personal_space_id)
        .await
        .unwrap()
        .is_empty());
    assert!(test_db.db.notes.get_note_by_id(keep.id).await.unwrap().is_some());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_add_participant_rules() {
    let test_db = setup().await;
    let alice = test_db.user(6001).await;
    let bob = test_db.user(6002).await;
    let shared = test_db.shared_space(&alice, "Family").await;

    let mut tx = test_db.db.writer.begin().await.unwrap();
    tx.add_participant(shared.id, bob.id, Utc::now()).await.unwrap();
    tx.commit().await.unwrap();
    assert!(test_db.db.spaces.is_participant(shared.id, bob.id).await.unwrap());

    let mut tx = test_db.db.writer.begin().await.unwrap();
    let err = tx
        .add_participant(shared.id, bob.id, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Domain(DomainError::AlreadyParticipant { .. })
    ));
    drop(tx);

    let mut tx = test_db.db.writer.begin().await.unwrap();
    let err = tx
        .add_participant(alice.personal_space_id, bob.id, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Domain(DomainError::PersonalSpace(_))));

    test_db.cleanup().await;
}
