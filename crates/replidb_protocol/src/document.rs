//! Replicated documents and their revision tokens.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Document payload: a JSON object with deterministic (sorted) key order.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Primary key of a replicated document.
///
/// Keys are unique within a fork and immutable for the document's life.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    /// Creates a key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for DocumentKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Revision token identifying "this exact content as of this write".
///
/// Rendered as `<height>-<digest>`, where the height grows by one on every
/// write to the document and the digest is a SHA-256 prefix over the content.
/// Two revisions are equal only if both parts are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    height: u64,
    digest: String,
}

impl Revision {
    /// Computes the revision for the given content at the given height.
    pub fn for_content(height: u64, data: &Payload, deleted: bool) -> Self {
        Self {
            height,
            digest: content_digest(data, deleted),
        }
    }

    /// Returns the write height.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Returns the content digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.digest)
    }
}

impl FromStr for Revision {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (height, digest) = s
            .split_once('-')
            .ok_or_else(|| ProtocolError::InvalidRevision(s.to_string()))?;
        let height = height
            .parse::<u64>()
            .map_err(|_| ProtocolError::InvalidRevision(s.to_string()))?;
        if digest.is_empty() {
            return Err(ProtocolError::InvalidRevision(s.to_string()));
        }
        Ok(Self {
            height,
            digest: digest.to_string(),
        })
    }
}

impl TryFrom<String> for Revision {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(revision: Revision) -> Self {
        revision.to_string()
    }
}

/// The replicated state of one document.
///
/// A deleted document is a tombstone: it keeps its key and revision history
/// so that late, stale batches cannot resurrect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    /// Primary key.
    pub key: DocumentKey,
    /// Payload fields.
    pub data: Payload,
    /// Tombstone flag.
    pub deleted: bool,
    /// Revision of this exact content.
    pub revision: Revision,
}

impl DocumentState {
    /// Creates the first revision of a live document.
    pub fn new(key: impl Into<DocumentKey>, data: Payload) -> Self {
        let revision = Revision::for_content(1, &data, false);
        Self {
            key: key.into(),
            data,
            deleted: false,
            revision,
        }
    }

    /// Returns the next revision of this document with new payload fields.
    pub fn with_data(&self, data: Payload) -> Self {
        let revision = Revision::for_content(self.revision.height + 1, &data, false);
        Self {
            key: self.key.clone(),
            data,
            deleted: false,
            revision,
        }
    }

    /// Returns the next revision of this document as a tombstone.
    pub fn to_tombstone(&self) -> Self {
        let revision = Revision::for_content(self.revision.height + 1, &self.data, true);
        Self {
            key: self.key.clone(),
            data: self.data.clone(),
            deleted: true,
            revision,
        }
    }

    /// Returns the next revision of this document carrying `content`'s
    /// payload and tombstone flag.
    ///
    /// The key always stays this document's key. The height is above both
    /// inputs, so the result never reads as older than either.
    pub fn rebased_onto(&self, content: &DocumentState) -> Self {
        let height = self.revision.height.max(content.revision.height) + 1;
        let revision = Revision::for_content(height, &content.data, content.deleted);
        Self {
            key: self.key.clone(),
            data: content.data.clone(),
            deleted: content.deleted,
            revision,
        }
    }

    /// Returns true if both states carry the same key, payload and tombstone
    /// flag. Revisions are ignored.
    pub fn content_eq(&self, other: &DocumentState) -> bool {
        self.key == other.key && self.deleted == other.deleted && self.data == other.data
    }

    /// Returns a payload field.
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.data.get(field)
    }

    /// Returns true if this state is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

fn content_digest(data: &Payload, deleted: bool) -> String {
    // serde_json maps are sorted by key, so the encoding is canonical.
    let encoded = serde_json::to_vec(&(deleted, data)).unwrap_or_default();
    let hash = Sha256::digest(&encoded);
    hash.iter().take(16).map(|b| format!("{b:02x}")).collect()
}
