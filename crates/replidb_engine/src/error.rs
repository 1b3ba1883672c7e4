//! Error types for the replication engine.

use replidb_protocol::ProtocolError;
use thiserror::Error;

/// Result type for replication operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during replication.
///
/// Rejected pushes and fork revision conflicts are not errors; they travel as
/// `PushOutcome::Conflict` and `WriteOutcome::RevisionConflict`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A master call timed out.
    #[error("operation timed out")]
    Timeout,

    /// The master adapter is not connected.
    #[error("not connected to master")]
    NotConnected,

    /// The master adapter returned a malformed response.
    #[error("validation error: {0}")]
    Validation(String),

    /// Reading or writing fork storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,

    /// A direction stopped after too many consecutive storage failures.
    #[error("fatal after {consecutive} consecutive failures: {source}")]
    Fatal {
        /// Number of consecutive failures.
        consecutive: u32,
        /// The last failure.
        source: Box<SyncError>,
    },

    /// Invalid lifecycle transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Failure classes used by the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, timeout or connectivity failure.
    Transport,
    /// Malformed adapter response.
    Validation,
    /// Fork storage failure.
    Storage,
    /// Explicit stop.
    Cancelled,
    /// Escalated failure.
    Fatal,
    /// Misuse of the session lifecycle.
    Lifecycle,
}

impl SyncError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns the failure class.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Transport(_) | SyncError::Timeout | SyncError::NotConnected => {
                ErrorClass::Transport
            }
            SyncError::Validation(_) => ErrorClass::Validation,
            SyncError::Storage(_) => ErrorClass::Storage,
            SyncError::Cancelled => ErrorClass::Cancelled,
            SyncError::Fatal { .. } => ErrorClass::Fatal,
            SyncError::InvalidStateTransition { .. } => ErrorClass::Lifecycle,
        }
    }

    /// Returns true if the failed cycle should be scheduled again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transport | ErrorClass::Validation | ErrorClass::Storage
        )
    }

    /// Returns true if this error should be reported on the error stream.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, SyncError::Cancelled)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Validation(err.to_string())
    }
}
