//! In-process backends for deterministic testing and single-process runs.
//!
//! Each backend mirrors the semantics of its production counterpart and
//! adds failure injection so the pipeline's rollback and redelivery paths
//! can be exercised without external services.
//!
//! ## Usage
//!
//! ```rust
//! use notely_core::memory::{MemoryBroker, MemoryIndex, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let broker = MemoryBroker::new();
//! let index = MemoryIndex::new();
//! index.fail_next_writes(1);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

use crate::commands::Topic;
use crate::defaults::PERSONAL_SPACE_NAME;
use crate::error::{DomainError, Error, Result};
use crate::ids::new_v7;
use crate::models::*;
use crate::traits::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrement a failure budget, returning true if a failure should fire.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// RELATIONAL STORE
// =============================================================================

#[derive(Debug, Clone, Default)]
struct StoreState {
    users: BTreeMap<i64, User>,
    spaces: HashMap<Uuid, Space>,
    participants: HashSet<(Uuid, i64)>,
    notes: BTreeMap<Uuid, Note>,
    processed: HashSet<Uuid>,
}

impl StoreState {
    fn is_member(&self, space: &Space, user_id: i64) -> bool {
        space.creator == user_id || self.participants.contains(&(space.id, user_id))
    }

    fn check_member(&self, space_id: Uuid, user_id: i64) -> Result<()> {
        let space = self
            .spaces
            .get(&space_id)
            .ok_or(DomainError::SpaceNotFound(space_id))?;
        if !self.users.contains_key(&user_id) {
            return Err(DomainError::UnknownUser(user_id).into());
        }
        if !self.is_member(space, user_id) {
            return Err(DomainError::SpaceNotOwned { space_id, user_id }.into());
        }
        Ok(())
    }

    fn notes_in_space(&self, space_id: Uuid) -> Vec<Note> {
        let mut notes: Vec<Note> = self
            .notes
            .values()
            .filter(|n| n.space_id == space_id)
            .cloned()
            .collect();
        notes.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        notes
    }
}

/// Relational store held in memory.
///
/// A write transaction holds the store lock until it commits or is dropped,
/// the same way a row lock is held across the index write in Postgres.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<AsyncMutex<StoreState>>,
    next_user_id: Arc<AtomicI64>,
    fail_commits: Arc<AtomicU32>,
    lost_commits: Arc<AtomicU32>,
    reads: Arc<AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AsyncMutex::new(StoreState::default())),
            next_user_id: Arc::new(AtomicI64::new(1)),
            fail_commits: Arc::new(AtomicU32::new(0)),
            lost_commits: Arc::new(AtomicU32::new(0)),
            reads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Provision a user together with their personal space.
    pub async fn register_user(&self, new_user: NewUser) -> Result<User> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|u| u.tg_id == new_user.tg_id) {
            return Err(DomainError::UserAlreadyExists(new_user.tg_id).into());
        }

        let now = Utc::now();
        let id = self.next_user_id.fetch_add(1, Ordering::SeqCst);
        let space = Space {
            id: new_v7(),
            name: PERSONAL_SPACE_NAME.to_string(),
            creator: id,
            personal: true,
            created: now,
        };
        let user = User {
            id,
            tg_id: new_user.tg_id,
            username: new_user.username,
            personal_space_id: space.id,
            created: now,
        };
        state.spaces.insert(space.id, space);
        state.users.insert(id, user.clone());
        Ok(user)
    }

    /// Make the next `n` commits fail as if the connection dropped.
    pub fn fail_next_commits(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits land but report failure, as if the
    /// acknowledgement was lost on the wire.
    pub fn fail_next_commits_after_apply(&self, n: u32) {
        self.lost_commits.store(n, Ordering::SeqCst);
    }

    /// Number of read-path queries served, for cache tests.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub async fn note_count(&self) -> usize {
        self.state.lock().await.notes.len()
    }

    pub async fn is_processed(&self, request_id: Uuid) -> bool {
        self.state.lock().await.processed.contains(&request_id)
    }
}

/// Transaction over a private copy of the store state.
pub struct MemoryTx {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
    fail_commits: Arc<AtomicU32>,
    lost_commits: Arc<AtomicU32>,
}

#[async_trait]
impl WriteStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn WriteTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            working,
            fail_commits: self.fail_commits.clone(),
            lost_commits: self.lost_commits.clone(),
        }))
    }
}

#[async_trait]
impl WriteTx for MemoryTx {
    async fn record_request(&mut self, request_id: Uuid, _topic: Topic) -> Result<bool> {
        Ok(self.working.processed.insert(request_id))
    }

    async fn find_note(&mut self, note_id: Uuid) -> Result<Option<Note>> {
        Ok(self.working.notes.get(&note_id).cloned())
    }

    async fn find_notes_by_space(&mut self, space_id: Uuid) -> Result<Vec<Note>> {
        Ok(self.working.notes_in_space(space_id))
    }

    async fn insert_note(&mut self, note: &Note) -> Result<()> {
        self.working.check_member(note.space_id, note.user_id)?;
        if self.working.notes.contains_key(&note.id) {
            return Err(Error::Internal(format!("duplicate note id {}", note.id)));
        }
        self.working.notes.insert(note.id, note.clone());
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
        let current = self
            .working
            .notes
            .get(&note_id)
            .ok_or(DomainError::NoteNotFound(note_id))?;
        if current.space_id != space_id {
            return Err(DomainError::NoteNotInSpace { note_id, space_id }.into());
        }
        if !current.note_type.is_updatable() {
            return Err(DomainError::NoteNotUpdatable(current.note_type).into());
        }
        self.working.check_member(space_id, user_id)?;

        let note = self
            .working
            .notes
            .get_mut(&note_id)
            .ok_or(DomainError::NoteNotFound(note_id))?;
        let before = note.clone();
        note.text = text.to_string();
        note.last_edit = Some(edited_at);
        Ok(NoteEdit {
            before,
            after: note.clone(),
        })
    }

    async fn delete_note(&mut self, note_id: Uuid, space_id: Uuid) -> Result<Note> {
        match self.working.notes.get(&note_id) {
            None => Err(DomainError::NoteNotFound(note_id).into()),
            Some(note) if note.space_id != space_id => {
                Err(DomainError::NoteNotInSpace { note_id, space_id }.into())
            }
            Some(_) => self
                .working
                .notes
                .remove(&note_id)
                .ok_or_else(|| DomainError::NoteNotFound(note_id).into()),
        }
    }

    async fn delete_notes_by_space(&mut self, space_id: Uuid) -> Result<Vec<Note>> {
        if !self.working.spaces.contains_key(&space_id) {
            return Err(DomainError::SpaceNotFound(space_id).into());
        }
        let removed = self.working.notes_in_space(space_id);
        for note in &removed {
            self.working.notes.remove(&note.id);
        }
        Ok(removed)
    }

    async fn insert_space(&mut self, space: &Space) -> Result<()> {
        if !self.working.users.contains_key(&space.creator) {
            return Err(DomainError::UnknownUser(space.creator).into());
        }
        if self.working.spaces.contains_key(&space.id) {
            return Err(Error::Internal(format!("duplicate space id {}", space.id)));
        }
        self.working.spaces.insert(space.id, space.clone());
        self.working.participants.insert((space.id, space.creator));
        Ok(())
    }

    async fn add_participant(
        &mut self,
        space_id: Uuid,
        user_id: i64,
        _joined: DateTime<Utc>,
    ) -> Result<()> {
        let space = self
            .working
            .spaces
            .get(&space_id)
            .ok_or(DomainError::SpaceNotFound(space_id))?;
        if space.personal {
            return Err(DomainError::PersonalSpace(space_id).into());
        }
        if !self.working.users.contains_key(&user_id) {
            return Err(DomainError::UnknownUser(user_id).into());
        }
        if self.working.is_member(space, user_id) {
            return Err(DomainError::AlreadyParticipant { space_id, user_id }.into());
        }
        self.working.participants.insert((space_id, user_id));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if take_failure(&self.fail_commits) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        let MemoryTx {
            mut guard,
            working,
            lost_commits,
            ..
        } = *self;
        *guard = working;
        if take_failure(&lost_commits) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl NoteReader for MemoryStore {
    async fn get_note_by_id(&self, note_id: Uuid) -> Result<Option<Note>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().await.notes.get(&note_id).cloned())
    }

    async fn get_all_notes_by_space_id(&self, space_id: Uuid) -> Result<Vec<Note>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().await.notes_in_space(space_id))
    }
}

#[async_trait]
impl SpaceReader for MemoryStore {
    async fn get_space(&self, space_id: Uuid) -> Result<Option<Space>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().await.spaces.get(&space_id).cloned())
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn get_user_by_tg_id(&self, tg_id: i64) -> Result<Option<User>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        Ok(state.users.values().find(|u| u.tg_id == tg_id).cloned())
    }

    async fn is_participant(&self, space_id: Uuid, user_id: i64) -> Result<bool> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        Ok(state
            .spaces
            .get(&space_id)
            .map(|space| state.is_member(space, user_id))
            .unwrap_or(false))
    }
}

// =============================================================================
// BROKER
// =============================================================================

#[derive(Debug)]
struct StoredMessage {
    delivery: Delivery,
    leased_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: i64,
    queues: HashMap<Topic, VecDeque<StoredMessage>>,
    acked: u64,
}

/// Broker with the same head-of-line lease semantics as the Postgres broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    fail_publish: Arc<AtomicBool>,
    publish_delay: Option<Duration>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            fail_publish: Arc::new(AtomicBool::new(false)),
            publish_delay: None,
        }
    }

    /// Delay every publish, to exercise producer timeouts.
    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = Some(delay);
        self
    }

    /// Reject publishes as if the broker were unreachable.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Unacknowledged messages on a topic.
    pub fn depth(&self, topic: Topic) -> usize {
        lock(&self.state)
            .queues
            .get(&topic)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn acked_count(&self) -> u64 {
        lock(&self.state).acked
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: Topic, payload: String) -> Result<i64> {
        if let Some(delay) = self.publish_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Broker("broker unreachable".to_string()));
        }

        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let id = state.next_id;
            state
                .queues
                .entry(topic)
                .or_default()
                .push_back(StoredMessage {
                    delivery: Delivery {
                        id,
                        topic,
                        payload,
                        delivery_count: 0,
                        published_at: Utc::now(),
                    },
                    leased_until: None,
                });
            id
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, topic: Topic, lease: Duration) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let Some(head) = state.queues.get_mut(&topic).and_then(|q| q.front_mut()) else {
            return Ok(None);
        };
        if matches!(head.leased_until, Some(until) if until > now) {
            return Ok(None);
        }
        head.leased_until = Some(now + lease);
        head.delivery.delivery_count += 1;
        Ok(Some(head.delivery.clone()))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = lock(&self.state);
        let removed = state.queues.get_mut(&delivery.topic).and_then(|q| {
            q.iter()
                .position(|m| m.delivery.id == delivery.id)
                .and_then(|pos| q.remove(pos))
        });
        if removed.is_some() {
            state.acked += 1;
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(message) = state
            .queues
            .get_mut(&delivery.topic)
            .and_then(|q| q.iter_mut().find(|m| m.delivery.id == delivery.id))
        {
            message.leased_until = None;
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pending(&self, topic: Topic) -> Result<Vec<Delivery>> {
        Ok(lock(&self.state)
            .queues
            .get(&topic)
            .map(|q| q.iter().map(|m| m.delivery.clone()).collect())
            .unwrap_or_default())
    }

    async fn pending_containing(&self, topic: Topic, needles: &[String]) -> Result<Vec<Delivery>> {
        Ok(lock(&self.state)
            .queues
            .get(&topic)
            .map(|q| {
                q.iter()
                    .filter(|m| needles.iter().all(|n| m.delivery.payload.contains(n.as_str())))
                    .map(|m| m.delivery.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

// =============================================================================
// SEARCH INDEX
// =============================================================================

/// Full-text index over a map of documents, matching on lowercase terms.
#[derive(Clone, Default)]
pub struct MemoryIndex {
    docs: Arc<Mutex<HashMap<Uuid, NoteDocument>>>,
    fail_writes: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    partial_space_deletes: Arc<AtomicU32>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `n` writes, then recover.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` delete-by-space calls remove the space's documents
    /// and then fail, like a delete-by-query that times out mid-way.
    pub fn fail_next_space_deletes_after_apply(&self, n: u32) {
        self.partial_space_deletes.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, note_id: Uuid) -> Option<NoteDocument> {
        lock(&self.docs).get(&note_id).cloned()
    }

    pub fn count_in_space(&self, space_id: Uuid) -> usize {
        lock(&self.docs)
            .values()
            .filter(|d| d.space_id == space_id)
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.docs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) || take_failure(&self.fail_next) {
            return Err(Error::Index("index unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn index_document(&self, doc: &NoteDocument) -> Result<()> {
        self.check_write()?;
        lock(&self.docs).insert(doc.note_id, doc.clone());
        Ok(())
    }

    async fn update_document(&self, doc: &NoteDocument) -> Result<()> {
        self.check_write()?;
        lock(&self.docs).insert(doc.note_id, doc.clone());
        Ok(())
    }

    async fn delete_document(&self, note_id: Uuid) -> Result<()> {
        self.check_write()?;
        lock(&self.docs).remove(&note_id);
        Ok(())
    }

    async fn delete_by_space(&self, space_id: Uuid) -> Result<u64> {
        self.check_write()?;
        let removed = {
            let mut docs = lock(&self.docs);
            let before = docs.len();
            docs.retain(|_, d| d.space_id != space_id);
            (before - docs.len()) as u64
        };
        if take_failure(&self.partial_space_deletes) {
            return Err(Error::Index("delete by query timed out".to_string()));
        }
        Ok(removed)
    }

    async fn search(
        &self,
        space_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<NoteSearchHit>> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let docs = lock(&self.docs);
        let mut hits: Vec<(f32, DateTime<Utc>, Uuid)> = docs
            .values()
            .filter(|d| d.space_id == space_id)
            .filter_map(|d| {
                let text = d.text.to_lowercase();
                let matched = terms.iter().filter(|t| text.contains(t.as_str())).count();
                (matched > 0).then(|| (matched as f32, d.created, d.note_id))
            })
            .collect();
        hits.sort_by(|a, b| b.0.total_cmp(&a.0).then(b.1.cmp(&a.1)));

        Ok(hits
            .into_iter()
            .take(limit)
            .map(|(score, _, note_id)| NoteSearchHit { note_id, score })
            .collect())
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// TTL cache over a map, with read and write failure injection.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries)
            .get(key)
            .map(|(_, expires)| *expires > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Cache("cache unreachable".to_string()));
        }
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Cache("cache unreachable".to_string()));
        }
        lock(&self.entries).insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }
}
