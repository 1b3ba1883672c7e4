//! Shared plumbing for the pull and push engines.

use crate::checkpoint::CheckpointStore;
use crate::error::SyncResult;
use crate::events::{CycleReport, EventHub};
use async_trait::async_trait;
use replidb_protocol::{ConflictHandler, Direction, ReplicationIdentity};
use std::sync::Arc;

/// Everything an engine needs to run a cycle.
pub struct EngineContext<M, F> {
    /// Identity scoping the checkpoints.
    pub identity: ReplicationIdentity,
    /// Master adapter.
    pub master: Arc<M>,
    /// Fork adapter.
    pub fork: Arc<F>,
    /// Checkpoint persistence.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Conflict handler.
    pub resolver: Arc<dyn ConflictHandler>,
    /// Event fan-out.
    pub events: EventHub,
}

impl<M, F> Clone for EngineContext<M, F> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            master: Arc::clone(&self.master),
            fork: Arc::clone(&self.fork),
            checkpoints: Arc::clone(&self.checkpoints),
            resolver: Arc::clone(&self.resolver),
            events: self.events.clone(),
        }
    }
}

/// One replication direction, driven cycle by cycle by its loop.
#[async_trait]
pub trait DirectionEngine: Send + Sync {
    /// Returns the direction this engine serves.
    fn direction(&self) -> Direction;

    /// Runs one batch: fetch, apply, advance the checkpoint.
    ///
    /// A failed cycle never advances the checkpoint.
    async fn run_cycle(&self) -> SyncResult<CycleReport>;
}
