//! Reference master server.

use crate::config::MasterConfig;
use crate::error::{MasterError, MasterResult};
use crate::store::MasterStore;
use replidb_protocol::{
    Checkpoint, DocumentKey, DocumentState, MasterEvent, Payload, PullRequest, PullResponse,
    PushOutcome, PushRequest, PushResponse, SyncMessage,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// The reference master.
///
/// This server answers pull and push requests against an in-memory
/// [`MasterStore`] and announces every accepted change on a broadcast stream.
/// Direct writes through [`MasterServer::upsert`] and [`MasterServer::delete`]
/// stand in for other clients.
///
/// # Example
///
/// ```
/// use replidb_master::{MasterConfig, MasterServer};
/// use replidb_protocol::PullRequest;
///
/// let server = MasterServer::new(MasterConfig::default());
/// let response = server.handle_pull(&PullRequest::new(None, 10)).unwrap();
/// assert!(response.is_empty());
/// ```
pub struct MasterServer {
    config: MasterConfig,
    store: Arc<MasterStore>,
    events: broadcast::Sender<MasterEvent>,
}

impl MasterServer {
    /// Creates a master with an empty store.
    pub fn new(config: MasterConfig) -> Self {
        Self::with_store(config, Arc::new(MasterStore::new()))
    }

    /// Creates a master over an existing store.
    pub fn with_store(config: MasterConfig, store: Arc<MasterStore>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            config,
            store,
            events,
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<MasterStore> {
        &self.store
    }

    /// Handles a pull request.
    ///
    /// The limit is clamped to the configured maximum; `has_more` tells the
    /// caller whether changes remain after the returned batch.
    pub fn handle_pull(&self, request: &PullRequest) -> MasterResult<PullResponse> {
        let limit = request.limit.min(self.config.max_pull_batch);
        let mut documents = self
            .store
            .changes_since(request.checkpoint.as_ref(), limit.saturating_add(1))?;
        let has_more = documents.len() > limit as usize;
        documents.truncate(limit as usize);
        debug!(limit, returned = documents.len(), has_more, "handled pull");
        Ok(PullResponse::new(documents).with_has_more(has_more))
    }

    /// Handles a push request, row by row.
    pub fn handle_push(&self, request: &PushRequest) -> MasterResult<PushResponse> {
        if request.rows.len() > self.config.max_push_batch as usize {
            return Err(MasterError::BatchTooLarge {
                size: request.rows.len(),
                max: self.config.max_push_batch,
            });
        }

        let outcomes: Vec<PushOutcome> = request.rows.iter().map(|row| self.store.apply(row)).collect();
        let response = PushResponse::new(outcomes);

        let last_accepted = response.outcomes.iter().rev().find_map(|outcome| match outcome {
            PushOutcome::Accepted { checkpoint } => Some(checkpoint.clone()),
            PushOutcome::Conflict { .. } => None,
        });
        if let Some(checkpoint) = last_accepted {
            self.announce(checkpoint);
        }

        debug!(
            rows = request.rows.len(),
            conflicts = response.conflict_count(),
            "handled push"
        );
        Ok(response)
    }

    /// Handles a sync message (dispatches to the matching handler).
    pub fn handle_message(&self, message: &SyncMessage) -> MasterResult<SyncMessage> {
        match message {
            SyncMessage::PullRequest(req) => self.handle_pull(req).map(SyncMessage::PullResponse),
            SyncMessage::PushRequest(req) => self.handle_push(req).map(SyncMessage::PushResponse),
            other => Err(MasterError::InvalidRequest(format!(
                "unexpected message type {}",
                other.type_code()
            ))),
        }
    }

    /// Handles a CBOR-encoded sync message and returns the encoded reply.
    pub fn handle_encoded(&self, bytes: &[u8]) -> MasterResult<Vec<u8>> {
        let message = SyncMessage::decode(bytes)?;
        let reply = self.handle_message(&message)?;
        Ok(reply.encode()?)
    }

    /// Creates or updates a document directly on master.
    pub fn upsert(&self, key: impl Into<DocumentKey>, data: Payload) -> DocumentState {
        let (state, checkpoint) = self.store.upsert(key, data);
        self.announce(checkpoint);
        state
    }

    /// Deletes a document directly on master.
    pub fn delete(&self, key: &DocumentKey) -> Option<DocumentState> {
        let (state, checkpoint) = self.store.delete(key)?;
        self.announce(checkpoint);
        Some(state)
    }

    /// Returns the current state of a document.
    pub fn get(&self, key: &DocumentKey) -> Option<DocumentState> {
        self.store.get(key)
    }

    /// Subscribes to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MasterEvent> {
        self.events.subscribe()
    }

    /// Asks every subscriber to pull again.
    pub fn request_resync(&self) {
        let _ = self.events.send(MasterEvent::Resync);
    }

    /// Returns the checkpoint of the latest write.
    pub fn checkpoint(&self) -> Checkpoint {
        self.store.checkpoint()
    }

    fn announce(&self, checkpoint: Checkpoint) {
        let _ = self.events.send(MasterEvent::Changed { checkpoint });
    }
}

impl Default for MasterServer {
    fn default() -> Self {
        Self::new(MasterConfig::default())
    }
}
