//! Master-side document store and change log.

use crate::error::{MasterError, MasterResult};
use parking_lot::RwLock;
use replidb_protocol::{
    ChangeRow, Checkpoint, DocumentKey, DocumentState, Payload, PushOutcome, PushRow,
};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct StoreInner {
    /// Current state of each document and the sequence of its last write.
    documents: HashMap<DocumentKey, (DocumentState, u64)>,
    /// Sequence -> key. Only the latest write per key is kept.
    log: BTreeMap<u64, DocumentKey>,
    last_seq: u64,
}

impl StoreInner {
    fn store(&mut self, state: DocumentState) -> u64 {
        self.last_seq += 1;
        let seq = self.last_seq;
        let key = state.key.clone();
        if let Some((_, previous)) = self.documents.insert(key.clone(), (state, seq)) {
            self.log.remove(&previous);
        }
        self.log.insert(seq, key);
        seq
    }
}

/// Authoritative document store.
///
/// The store maintains:
/// - The current state of every document, tombstones included
/// - A change log ordered by write sequence
/// - Compare-and-set writes against the writer's assumed state
#[derive(Debug, Default)]
pub struct MasterStore {
    inner: RwLock<StoreInner>,
}

impl MasterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the checkpoint of the latest write.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::from_sequence(self.inner.read().last_seq)
    }

    /// Returns changes strictly after `checkpoint`, ascending, up to `limit`.
    pub fn changes_since(
        &self,
        checkpoint: Option<&Checkpoint>,
        limit: u32,
    ) -> MasterResult<Vec<ChangeRow>> {
        let after = match checkpoint {
            Some(cp) => cp
                .sequence()
                .ok_or_else(|| MasterError::InvalidCheckpoint(format!("{:?}", cp.as_bytes())))?,
            None => 0,
        };

        let inner = self.inner.read();
        Ok(inner
            .log
            .range(after.saturating_add(1)..)
            .take(limit as usize)
            .filter_map(|(seq, key)| {
                inner
                    .documents
                    .get(key)
                    .map(|(state, _)| ChangeRow::new(state.clone(), Checkpoint::from_sequence(*seq)))
            })
            .collect())
    }

    /// Applies one pushed row.
    ///
    /// The row is accepted if master holds what the writer assumed, or if the
    /// document does not exist here. A document the writer believes is new
    /// but master already holds is a conflict.
    pub fn apply(&self, row: &PushRow) -> PushOutcome {
        let mut inner = self.inner.write();
        let key = &row.new_document_state.key;

        if let Some((current, _)) = inner.documents.get(key) {
            let matches = row
                .assumed_master_state
                .as_ref()
                .is_some_and(|assumed| assumed.content_eq(current));
            if !matches {
                return PushOutcome::Conflict {
                    current_master_state: current.clone(),
                };
            }
        }

        let seq = inner.store(row.new_document_state.clone());
        PushOutcome::Accepted {
            checkpoint: Checkpoint::from_sequence(seq),
        }
    }

    /// Creates or updates a document directly on master.
    pub fn upsert(&self, key: impl Into<DocumentKey>, data: Payload) -> (DocumentState, Checkpoint) {
        let key = key.into();
        let mut inner = self.inner.write();
        let state = match inner.documents.get(&key) {
            Some((current, _)) => current.with_data(data),
            None => DocumentState::new(key, data),
        };
        let seq = inner.store(state.clone());
        (state, Checkpoint::from_sequence(seq))
    }

    /// Deletes a document directly on master, leaving a tombstone.
    pub fn delete(&self, key: &DocumentKey) -> Option<(DocumentState, Checkpoint)> {
        let mut inner = self.inner.write();
        let (current, _) = inner.documents.get(key)?;
        if current.is_deleted() {
            return None;
        }
        let state = current.to_tombstone();
        let seq = inner.store(state.clone());
        Some((state, Checkpoint::from_sequence(seq)))
    }

    /// Returns the current state of a document, tombstones included.
    pub fn get(&self, key: &DocumentKey) -> Option<DocumentState> {
        self.inner
            .read()
            .documents
            .get(key)
            .map(|(state, _)| state.clone())
    }

    /// Returns all live documents ordered by key.
    pub fn live_documents(&self) -> Vec<DocumentState> {
        let mut documents: Vec<DocumentState> = self
            .inner
            .read()
            .documents
            .values()
            .map(|(state, _)| state.clone())
            .filter(|state| !state.is_deleted())
            .collect();
        documents.sort_by(|a, b| a.key.cmp(&b.key));
        documents
    }

    /// Returns the number of documents, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().documents.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().documents.is_empty()
    }
}
