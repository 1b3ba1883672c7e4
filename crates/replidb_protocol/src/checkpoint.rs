//! Checkpoints, replication directions and replication identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque, totally ordered marker into a change history.
///
/// The replication core never interprets checkpoint bytes; it only stores the
/// last processed checkpoint and hands it back to the adapter that produced
/// it. Adapters backed by a numeric sequence can use
/// [`Checkpoint::from_sequence`], whose big-endian encoding keeps byte order
/// equal to numeric order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(Vec<u8>);

impl Checkpoint {
    /// Wraps raw adapter-defined bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encodes a numeric sequence.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(sequence.to_be_bytes().to_vec())
    }

    /// Decodes a numeric sequence, if this checkpoint holds one.
    pub fn sequence(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One of the two replication directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Master to fork.
    Pull,
    /// Fork to master.
    Push,
}

impl Direction {
    /// Returns a stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable key identifying one fork/master pairing.
///
/// Checkpoints are scoped to an identity and survive restarts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicationIdentity(String);

impl ReplicationIdentity {
    /// Creates an identity.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the storage key for this identity's checkpoint in a direction.
    pub fn checkpoint_key(&self, direction: Direction) -> String {
        format!("{}/{}", self.0, direction.as_str())
    }
}

impl fmt::Display for ReplicationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicationIdentity {
    fn from(identity: &str) -> Self {
        Self::new(identity)
    }
}
