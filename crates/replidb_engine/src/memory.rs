//! In-memory fork.

use crate::checkpoint::CheckpointStore;
use crate::error::{SyncError, SyncResult};
use crate::fork::{DocumentMeta, ForkAdapter, ForkChange, ForkDocument, WriteOutcome};
use async_trait::async_trait;
use parking_lot::RwLock;
use replidb_protocol::{
    Checkpoint, Direction, DocumentKey, DocumentState, Payload, ReplicationIdentity, Revision,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

const WRITE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    state: DocumentState,
    /// Identity -> meta.
    meta: HashMap<String, DocumentMeta>,
    write_seq: u64,
}

impl Entry {
    fn meta_for(&self, identity: &str) -> DocumentMeta {
        self.meta
            .get(identity)
            .cloned()
            .unwrap_or_else(|| DocumentMeta::pending(None))
    }

    fn view(&self, identity: &str) -> ForkDocument {
        ForkDocument::new(self.state.clone(), self.meta_for(identity))
    }

    fn mark_pending_except(&mut self, identity: Option<&str>) {
        for (owner, meta) in self.meta.iter_mut() {
            if Some(owner.as_str()) != identity {
                meta.needs_push = true;
            }
        }
    }
}

#[derive(Debug, Default)]
struct ForkState {
    documents: HashMap<DocumentKey, Entry>,
    /// Write sequence -> key, one slot per document (its latest write).
    sequence: BTreeMap<u64, DocumentKey>,
    next_seq: u64,
    checkpoints: HashMap<String, Checkpoint>,
    /// Identities that have read the change stream.
    identities: BTreeSet<String>,
}

impl ForkState {
    fn store(&mut self, mut entry: Entry) {
        self.next_seq += 1;
        entry.write_seq = self.next_seq;
        let key = entry.state.key.clone();
        if let Some(previous) = self.documents.insert(key.clone(), entry) {
            self.sequence.remove(&previous.write_seq);
        }
        self.sequence.insert(self.next_seq, key);
    }

    /// Stores an application write, pending for every identity.
    fn store_local(&mut self, state: DocumentState) {
        let mut meta = self
            .documents
            .get(&state.key)
            .map(|entry| entry.meta.clone())
            .unwrap_or_default();
        for entry_meta in meta.values_mut() {
            entry_meta.needs_push = true;
        }
        self.store(Entry {
            state,
            meta,
            write_seq: 0,
        });
    }
}

/// A fork held entirely in memory.
///
/// Application writes go through [`MemoryFork::upsert`] and
/// [`MemoryFork::remove`]; they mark the document as needing a push for
/// every replication identity. The replication engine writes through
/// [`ForkAdapter::write_document`]. Checkpoints live in the same store, so
/// the fork doubles as a [`CheckpointStore`].
pub struct MemoryFork {
    state: RwLock<ForkState>,
    writes: broadcast::Sender<DocumentKey>,
    failing_writes: AtomicU32,
    failing_checkpoint_saves: AtomicU32,
}

impl MemoryFork {
    /// Creates an empty fork.
    pub fn new() -> Self {
        let (writes, _) = broadcast::channel(WRITE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ForkState::default()),
            writes,
            failing_writes: AtomicU32::new(0),
            failing_checkpoint_saves: AtomicU32::new(0),
        }
    }

    /// Creates or updates a document as the application would.
    ///
    /// A tombstoned document is revived with the new payload.
    pub fn upsert(&self, key: impl Into<DocumentKey>, data: Payload) -> DocumentState {
        let key = key.into();
        let state = {
            let mut fork = self.state.write();
            let state = match fork.documents.get(&key) {
                Some(entry) => entry.state.with_data(data),
                None => DocumentState::new(key.clone(), data),
            };
            fork.store_local(state.clone());
            state
        };
        trace!(key = %key, revision = %state.revision, "local write");
        let _ = self.writes.send(key);
        state
    }

    /// Deletes a document as the application would, leaving a tombstone.
    ///
    /// Returns `None` if the document does not exist or is already deleted.
    pub fn remove(&self, key: &DocumentKey) -> Option<DocumentState> {
        let state = {
            let mut fork = self.state.write();
            let entry = fork.documents.get(key)?;
            if entry.state.is_deleted() {
                return None;
            }
            let state = entry.state.to_tombstone();
            fork.store_local(state.clone());
            state
        };
        trace!(key = %key, "local delete");
        let _ = self.writes.send(key.clone());
        Some(state)
    }

    /// Returns the current state of a live document.
    pub fn get(&self, key: &DocumentKey) -> Option<DocumentState> {
        self.state
            .read()
            .documents
            .get(key)
            .map(|entry| entry.state.clone())
            .filter(|state| !state.is_deleted())
    }

    /// Returns a document with its meta for `identity`, tombstones included.
    pub fn document(
        &self,
        identity: &ReplicationIdentity,
        key: &DocumentKey,
    ) -> Option<ForkDocument> {
        self.state
            .read()
            .documents
            .get(key)
            .map(|entry| entry.view(identity.as_str()))
    }

    /// Returns all live documents ordered by key.
    pub fn all_documents(&self) -> Vec<DocumentState> {
        let mut documents: Vec<DocumentState> = self
            .state
            .read()
            .documents
            .values()
            .map(|entry| entry.state.clone())
            .filter(|state| !state.is_deleted())
            .collect();
        documents.sort_by(|a, b| a.key.cmp(&b.key));
        documents
    }

    /// Returns the number of documents `identity` still has to push.
    pub fn pending_count(&self, identity: &ReplicationIdentity) -> usize {
        self.state
            .read()
            .documents
            .values()
            .filter(|entry| entry.meta_for(identity.as_str()).needs_push)
            .count()
    }

    /// Makes the next `count` engine writes fail with a storage error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` checkpoint saves fail with a storage error.
    pub fn fail_next_checkpoint_saves(&self, count: u32) {
        self.failing_checkpoint_saves.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryFork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ForkAdapter for MemoryFork {
    async fn read_document(
        &self,
        identity: &ReplicationIdentity,
        key: &DocumentKey,
    ) -> SyncResult<Option<ForkDocument>> {
        Ok(self.document(identity, key))
    }

    async fn write_document(
        &self,
        identity: &ReplicationIdentity,
        document: ForkDocument,
        expected: Option<&Revision>,
    ) -> SyncResult<WriteOutcome> {
        if Self::take_failure(&self.failing_writes) {
            return Err(SyncError::storage(format!(
                "injected write failure for {}",
                document.state.key
            )));
        }

        let owner = identity.as_str();
        let key = document.state.key.clone();
        let announce = {
            let mut fork = self.state.write();
            let current = fork.documents.get(&key);
            if current.map(|entry| &entry.state.revision) != expected {
                return Ok(WriteOutcome::RevisionConflict {
                    current: current.map(|entry| entry.view(owner)),
                });
            }

            let mut entry = current.cloned().unwrap_or_else(|| Entry {
                state: document.state.clone(),
                meta: HashMap::new(),
                write_seq: 0,
            });
            let state_changed = expected != Some(&document.state.revision);
            if state_changed {
                entry.mark_pending_except(Some(owner));
            }
            let others_waiting =
                state_changed && fork.identities.iter().any(|other| other != owner);
            let announce = document.meta.needs_push || others_waiting;
            entry.state = document.state;
            entry.meta.insert(owner.to_string(), document.meta);
            fork.store(entry);
            announce
        };

        if announce {
            let _ = self.writes.send(key);
        }
        Ok(WriteOutcome::Written)
    }

    async fn changes_since(
        &self,
        identity: &ReplicationIdentity,
        checkpoint: Option<&Checkpoint>,
        limit: u32,
    ) -> SyncResult<Vec<ForkChange>> {
        let after = match checkpoint {
            Some(cp) => cp
                .sequence()
                .ok_or_else(|| SyncError::storage("fork checkpoint is not a write sequence"))?,
            None => 0,
        };

        let owner = identity.as_str();
        let mut fork = self.state.write();
        if !fork.identities.contains(owner) {
            fork.identities.insert(owner.to_string());
        }
        let changes = fork
            .sequence
            .range(after.saturating_add(1)..)
            .filter_map(|(seq, key)| {
                let entry = fork.documents.get(key)?;
                let document = entry.view(owner);
                document.meta.needs_push.then(|| ForkChange {
                    document,
                    checkpoint: Checkpoint::from_sequence(*seq),
                })
            })
            .take(limit as usize)
            .collect();
        Ok(changes)
    }

    fn subscribe_writes(&self) -> broadcast::Receiver<DocumentKey> {
        self.writes.subscribe()
    }
}

impl CheckpointStore for MemoryFork {
    fn load(
        &self,
        identity: &ReplicationIdentity,
        direction: Direction,
    ) -> SyncResult<Option<Checkpoint>> {
        Ok(self
            .state
            .read()
            .checkpoints
            .get(&identity.checkpoint_key(direction))
            .cloned())
    }

    fn save(
        &self,
        identity: &ReplicationIdentity,
        direction: Direction,
        checkpoint: &Checkpoint,
    ) -> SyncResult<()> {
        if Self::take_failure(&self.failing_checkpoint_saves) {
            return Err(SyncError::storage(format!(
                "injected checkpoint failure for {}",
                identity.checkpoint_key(direction)
            )));
        }
        self.state
            .write()
            .checkpoints
            .insert(identity.checkpoint_key(direction), checkpoint.clone());
        Ok(())
    }

    fn reset(&self, identity: &ReplicationIdentity) -> SyncResult<()> {
        let mut fork = self.state.write();
        fork.checkpoints.remove(&identity.checkpoint_key(Direction::Pull));
        fork.checkpoints.remove(&identity.checkpoint_key(Direction::Push));
        Ok(())
    }
}
