//! Conflict records and resolution.

use crate::document::{DocumentState, Payload};
use serde::{Deserialize, Serialize};

/// A conflict between a fork write and the state master actually holds.
///
/// Conflicts are transient: they are built by the pull or push engine, handed
/// to a [`ConflictHandler`], and dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// The state the fork wants master to hold.
    pub new_state: DocumentState,
    /// The master state the fork last saw confirmed, if any.
    pub assumed_master_state: Option<DocumentState>,
    /// The state master actually holds.
    pub real_master_state: DocumentState,
}

impl Conflict {
    /// Creates a new conflict record.
    pub fn new(
        new_state: DocumentState,
        assumed_master_state: Option<DocumentState>,
        real_master_state: DocumentState,
    ) -> Self {
        Self {
            new_state,
            assumed_master_state,
            real_master_state,
        }
    }

    /// Returns true if both sides created the document independently.
    pub fn is_create_conflict(&self) -> bool {
        self.assumed_master_state.is_none()
    }

    /// Returns true if exactly one side deleted the document.
    pub fn is_update_delete_conflict(&self) -> bool {
        self.new_state.deleted != self.real_master_state.deleted
    }
}

/// Outcome of conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    /// The new state already matches master: a stale optimistic check, not a
    /// real conflict.
    Equal,
    /// The state the fork should hold from now on.
    Resolved(DocumentState),
}

/// Decides the winner between a fork write and the real master state.
///
/// Implementations must be pure: no mutation of the inputs, guaranteed
/// termination, and identical output for identical input. Every input must
/// yield a resolution.
pub trait ConflictHandler: Send + Sync {
    /// Resolves a conflict.
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Built-in conflict policies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Master always wins; the fork write is discarded.
    #[default]
    MasterWins,
    /// The fork write wins and is sent again on top of the real master state.
    ForkWins,
    /// The side with the larger numeric timestamp in `field` wins. Ties and
    /// missing timestamps go to master.
    LastWriteWins {
        /// Payload field holding the timestamp.
        field: String,
    },
    /// Fields the fork changed relative to the assumed master state are
    /// applied over the real master state.
    MergeFields,
}

impl ConflictPolicy {
    /// Returns the policy used when none is configured.
    pub fn master_wins() -> Self {
        Self::MasterWins
    }

    /// Creates a last-write-wins policy over a timestamp field.
    pub fn last_write_wins(field: impl Into<String>) -> Self {
        Self::LastWriteWins {
            field: field.into(),
        }
    }
}

impl ConflictHandler for ConflictPolicy {
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        let new = &conflict.new_state;
        let real = &conflict.real_master_state;

        if new.content_eq(real) {
            return Resolution::Equal;
        }

        match self {
            ConflictPolicy::MasterWins => Resolution::Resolved(real.clone()),
            ConflictPolicy::ForkWins => Resolution::Resolved(real.rebased_onto(new)),
            ConflictPolicy::LastWriteWins { field } => {
                let timestamp = |doc: &DocumentState| doc.get(field).and_then(|v| v.as_f64());
                match (timestamp(new), timestamp(real)) {
                    (Some(local), Some(remote)) if local > remote => {
                        Resolution::Resolved(real.rebased_onto(new))
                    }
                    (Some(_), None) => Resolution::Resolved(real.rebased_onto(new)),
                    _ => Resolution::Resolved(real.clone()),
                }
            }
            ConflictPolicy::MergeFields => {
                let merged = merge_fields(conflict);
                if merged.content_eq(real) {
                    Resolution::Resolved(real.clone())
                } else {
                    Resolution::Resolved(merged)
                }
            }
        }
    }
}

fn merge_fields(conflict: &Conflict) -> DocumentState {
    let new = &conflict.new_state;
    let real = &conflict.real_master_state;
    let assumed = conflict.assumed_master_state.as_ref();

    let mut data: Payload = real.data.clone();
    for (field, value) in &new.data {
        let changed_locally = assumed.map_or(true, |a| a.data.get(field) != Some(value));
        if changed_locally {
            data.insert(field.clone(), value.clone());
        }
    }
    if let Some(assumed) = assumed {
        for field in assumed.data.keys() {
            if !new.data.contains_key(field) {
                data.remove(field);
            }
        }
    }

    let deleted_locally = assumed.map_or(new.deleted, |a| a.deleted != new.deleted);
    let deleted = if deleted_locally {
        new.deleted
    } else {
        real.deleted
    };

    let mut content = real.clone();
    content.data = data;
    content.deleted = deleted;
    real.rebased_onto(&content)
}
