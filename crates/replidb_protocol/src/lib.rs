//! # ReplicaDB Replication Protocol
//!
//! Replication protocol types and CBOR codecs for ReplicaDB.
//!
//! This crate provides:
//! - `DocumentState` and `Revision` for replicated documents
//! - `Checkpoint` and `ReplicationIdentity` for resumable change feeds
//! - `Conflict`, `Resolution` and the `ConflictHandler` contract
//! - Protocol messages (pull, push, master events)
//! - CBOR encoding/decoding and response validation
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod codec;
mod conflict;
mod document;
mod error;
mod messages;

pub use checkpoint::{Checkpoint, Direction, ReplicationIdentity};
pub use codec::{from_cbor, to_cbor};
pub use conflict::{Conflict, ConflictHandler, ConflictPolicy, Resolution};
pub use document::{DocumentKey, DocumentState, Payload, Revision};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ChangeRow, MasterEvent, PullRequest, PullResponse, PushOutcome, PushRequest, PushResponse,
    PushRow, SyncMessage,
};
