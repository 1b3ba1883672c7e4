//! Error types for the reference master.

use replidb_protocol::ProtocolError;
use thiserror::Error;

/// Result type for master operations.
pub type MasterResult<T> = Result<T, MasterError>;

/// Errors that can occur in the reference master.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MasterError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The checkpoint was not issued by this master.
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    /// Push request exceeds the configured batch size.
    #[error("push batch of {size} rows exceeds limit {max}")]
    BatchTooLarge {
        /// Rows in the request.
        size: usize,
        /// Configured maximum.
        max: u32,
    },

    /// Encoding or decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl MasterError {
    /// Returns true if the request was at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MasterError::InvalidRequest(_)
                | MasterError::InvalidCheckpoint(_)
                | MasterError::BatchTooLarge { .. }
                | MasterError::Protocol(ProtocolError::Decode(_))
        )
    }
}
