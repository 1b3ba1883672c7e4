//! Fork adapter abstraction.

use crate::error::SyncResult;
use async_trait::async_trait;
use replidb_protocol::{Checkpoint, DocumentKey, DocumentState, ReplicationIdentity, Revision};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Replication metadata stored next to each fork document, one per
/// replication identity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// True from any local write until master confirms that exact content.
    pub needs_push: bool,
    /// The content master last confirmed, `None` if never synced.
    pub assumed_master_state: Option<DocumentState>,
}

impl DocumentMeta {
    /// Meta for a document master has confirmed.
    pub fn confirmed(master_state: DocumentState) -> Self {
        Self {
            needs_push: false,
            assumed_master_state: Some(master_state),
        }
    }

    /// Meta for a document with an unconfirmed write.
    pub fn pending(assumed_master_state: Option<DocumentState>) -> Self {
        Self {
            needs_push: true,
            assumed_master_state,
        }
    }
}

/// A fork document together with its replication metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkDocument {
    /// Current document state.
    pub state: DocumentState,
    /// Replication metadata.
    pub meta: DocumentMeta,
}

impl ForkDocument {
    /// Creates a fork document.
    pub fn new(state: DocumentState, meta: DocumentMeta) -> Self {
        Self { state, meta }
    }

    /// A document holding exactly what master holds.
    pub fn confirmed(master_state: DocumentState) -> Self {
        Self {
            state: master_state.clone(),
            meta: DocumentMeta::confirmed(master_state),
        }
    }

    /// Returns true if the document has an unconfirmed write.
    pub fn needs_push(&self) -> bool {
        self.meta.needs_push
    }
}

/// One entry of the fork's local change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkChange {
    /// The document and its metadata at read time.
    pub document: ForkDocument,
    /// Position of this write in the fork's write sequence.
    pub checkpoint: Checkpoint,
}

/// Result of a compare-and-set fork write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The write was stored.
    Written,
    /// The document's revision no longer matches the expected one.
    RevisionConflict {
        /// The document as currently stored.
        current: Option<ForkDocument>,
    },
}

impl WriteOutcome {
    /// Returns true if the write was stored.
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written)
    }
}

/// Access to the local replica.
///
/// Every write carries the revision the engine read; the fork must reject
/// the write if the document changed in the meantime. The document and its
/// meta are stored in one step.
///
/// Meta is scoped to a replication identity, so one document can be
/// confirmed by one master and still wait for another. A document with no
/// meta for an identity has never been synced under it and needs a push.
/// A write that changes a document's state marks it as needing a push for
/// every other identity.
#[async_trait]
pub trait ForkAdapter: Send + Sync {
    /// Reads a document with its meta for `identity`.
    async fn read_document(
        &self,
        identity: &ReplicationIdentity,
        key: &DocumentKey,
    ) -> SyncResult<Option<ForkDocument>>;

    /// Writes a document and its meta for `identity` if the stored revision
    /// equals `expected` (`None` means the document must not exist yet).
    async fn write_document(
        &self,
        identity: &ReplicationIdentity,
        document: ForkDocument,
        expected: Option<&Revision>,
    ) -> SyncResult<WriteOutcome>;

    /// Returns documents needing a push for `identity` whose latest write
    /// comes after `checkpoint`, oldest write first, up to `limit`.
    async fn changes_since(
        &self,
        identity: &ReplicationIdentity,
        checkpoint: Option<&Checkpoint>,
        limit: u32,
    ) -> SyncResult<Vec<ForkChange>>;

    /// Subscribes to keys of documents written while some identity still
    /// has to push them.
    fn subscribe_writes(&self) -> broadcast::Receiver<DocumentKey>;
}
