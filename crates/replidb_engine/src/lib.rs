//! # ReplicaDB Replication Engine
//!
//! Checkpointed pull/push replication between a local fork and an
//! authoritative master.
//!
//! This crate provides:
//! - Master and fork adapter traits
//! - Pull engine (master → fork) and push engine (fork → master)
//! - Conflict resolution through a pluggable handler
//! - Retry with backoff and fatal escalation of storage failures
//! - Replication sessions with event streams and completion signals
//! - An in-memory fork and checkpoint stores
//!
//! ## Architecture
//!
//! Every replication identity is owned by one [`ReplicationSession`], which
//! runs a pull loop and a push loop:
//! 1. Local writes mark documents as needing a push
//! 2. The push loop sends them to master with the master state they assumed
//! 3. Master accepts or rejects each document on its own
//! 4. The pull loop applies master changes in checkpoint order
//!
//! ## Key Invariants
//!
//! - Master is authoritative
//! - A checkpoint advances only after its batch is applied
//! - Reapplying a batch is idempotent
//! - Every fork write is a compare-and-set on the document revision
//! - Conflict resolution is deterministic

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod engine;
mod error;
mod events;
mod fork;
mod master;
mod memory;
mod pull;
mod push;
mod retry;
mod session;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{DirectionConfig, DocumentFilter, ReplicationConfig, RetryConfig};
pub use engine::{DirectionEngine, EngineContext};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use events::{
    CycleReport, DirectionPhase, DirectionStatus, EventHub, ReplicationErrorEvent,
    ReplicationStatus, SyncStats,
};
pub use fork::{DocumentMeta, ForkAdapter, ForkChange, ForkDocument, WriteOutcome};
pub use master::{MasterAdapter, MockMaster};
pub use memory::MemoryFork;
pub use pull::{ApplyOutcome, BatchSummary, PullEngine};
pub use push::PushEngine;
pub use retry::{LoopState, RetryController, RetryDecision};
pub use session::ReplicationSession;
