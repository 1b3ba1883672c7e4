//! Protocol messages exchanged with master.

use crate::checkpoint::Checkpoint;
use crate::codec::{from_cbor, to_cbor};
use crate::document::DocumentState;
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// One document in a pull batch, with the checkpoint just after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    /// The document's current master state.
    pub document: DocumentState,
    /// Checkpoint of this change.
    pub checkpoint: Checkpoint,
}

impl ChangeRow {
    /// Creates a change row.
    pub fn new(document: DocumentState, checkpoint: Checkpoint) -> Self {
        Self {
            document,
            checkpoint,
        }
    }
}

/// Request for changes strictly after a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Last processed checkpoint, or `None` to start from the beginning.
    pub checkpoint: Option<Checkpoint>,
    /// Maximum number of documents to return.
    pub limit: u32,
}

impl PullRequest {
    /// Creates a pull request.
    pub fn new(checkpoint: Option<Checkpoint>, limit: u32) -> Self {
        Self { checkpoint, limit }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// One batch of master changes, ascending by checkpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changed documents in checkpoint order.
    pub documents: Vec<ChangeRow>,
    /// Whether master holds more changes after this batch.
    #[serde(default)]
    pub has_more: bool,
}

impl PullResponse {
    /// Creates a pull response.
    pub fn new(documents: Vec<ChangeRow>) -> Self {
        Self {
            documents,
            has_more: false,
        }
    }

    /// Marks whether more changes follow this batch.
    pub fn with_has_more(mut self, has_more: bool) -> Self {
        self.has_more = has_more;
        self
    }

    /// Returns the checkpoint of the last row, if any.
    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.documents.last().map(|row| &row.checkpoint)
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Checks the response against the request that produced it.
    ///
    /// A response may not exceed the requested limit and must be ascending by
    /// checkpoint.
    pub fn validate(&self, request: &PullRequest) -> ProtocolResult<()> {
        if self.documents.len() > request.limit as usize {
            return Err(ProtocolError::malformed(format!(
                "pull returned {} documents for limit {}",
                self.documents.len(),
                request.limit
            )));
        }

        for pair in self.documents.windows(2) {
            if pair[1].checkpoint < pair[0].checkpoint {
                return Err(ProtocolError::malformed(format!(
                    "pull batch not ascending at document {}",
                    pair[1].document.key
                )));
            }
        }

        Ok(())
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// One fork write offered to master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRow {
    /// The state the fork wants master to hold.
    pub new_document_state: DocumentState,
    /// The master state this write was based on, `None` for a new document.
    pub assumed_master_state: Option<DocumentState>,
}

impl PushRow {
    /// Creates a push row.
    pub fn new(
        new_document_state: DocumentState,
        assumed_master_state: Option<DocumentState>,
    ) -> Self {
        Self {
            new_document_state,
            assumed_master_state,
        }
    }
}

/// A batch of fork writes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushRequest {
    /// Rows to write, each accepted or rejected on its own.
    pub rows: Vec<PushRow>,
}

impl PushRequest {
    /// Creates a push request.
    pub fn new(rows: Vec<PushRow>) -> Self {
        Self { rows }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Master's verdict on one push row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushOutcome {
    /// The write was applied.
    Accepted {
        /// Master checkpoint of the applied write.
        checkpoint: Checkpoint,
    },
    /// The assumed master state was stale.
    Conflict {
        /// What master actually holds.
        current_master_state: DocumentState,
    },
}

impl PushOutcome {
    /// Returns true for an accepted write.
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushOutcome::Accepted { .. })
    }
}

/// Master's answer to a push request, one outcome per row in request order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PushResponse {
    /// Per-row outcomes.
    pub outcomes: Vec<PushOutcome>,
}

impl PushResponse {
    /// Creates a push response.
    pub fn new(outcomes: Vec<PushOutcome>) -> Self {
        Self { outcomes }
    }

    /// Returns the number of conflicts.
    pub fn conflict_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.is_accepted()).count()
    }

    /// Checks the response against the request that produced it.
    pub fn validate(&self, request: &PushRequest) -> ProtocolResult<()> {
        if self.outcomes.len() != request.rows.len() {
            return Err(ProtocolError::malformed(format!(
                "push returned {} outcomes for {} rows",
                self.outcomes.len(),
                request.rows.len()
            )));
        }

        for (row, outcome) in request.rows.iter().zip(&self.outcomes) {
            if let PushOutcome::Conflict {
                current_master_state,
            } = outcome
            {
                if current_master_state.key != row.new_document_state.key {
                    return Err(ProtocolError::malformed(format!(
                        "conflict for {} answered with document {}",
                        row.new_document_state.key, current_master_state.key
                    )));
                }
            }
        }

        Ok(())
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Notification on master's change stream.
///
/// Notifications only wake a drained pull loop; documents always travel
/// through pull requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MasterEvent {
    /// Master accepted new changes up to this checkpoint.
    Changed {
        /// Latest master checkpoint.
        checkpoint: Checkpoint,
    },
    /// Master asks clients to pull again (for example after reconnecting).
    Resync,
}

/// A framed protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Pull request.
    PullRequest(PullRequest),
    /// Pull response.
    PullResponse(PullResponse),
    /// Push request.
    PushRequest(PushRequest),
    /// Push response.
    PushResponse(PushResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::PullRequest(_) => 1,
            SyncMessage::PullResponse(_) => 2,
            SyncMessage::PushRequest(_) => 3,
            SyncMessage::PushResponse(_) => 4,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}
