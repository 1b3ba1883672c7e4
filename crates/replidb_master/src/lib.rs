//! # ReplicaDB Master
//!
//! Reference in-memory master for ReplicaDB replication.
//!
//! This crate provides:
//! - A document store with a change log ordered by write sequence
//! - Per-document compare-and-set against the writer's assumed state
//! - Change notifications for live replication
//! - CBOR request handling
//!
//! # Protocol
//!
//! The master answers two requests:
//! 1. Pull: changes strictly after a checkpoint, ascending, bounded by a limit
//! 2. Push: a batch of writes, each accepted or rejected with the current
//!    master state
//!
//! The change log keeps only the latest write per document, so a pull from an
//! old checkpoint returns current states, never superseded ones.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod server;
mod store;

pub use config::MasterConfig;
pub use error::{MasterError, MasterResult};
pub use server::MasterServer;
pub use store::MasterStore;
