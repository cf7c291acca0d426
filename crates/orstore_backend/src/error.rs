//! Error types for backend adapters.

use orstore_codec::CodecError;
use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors reported by a backend adapter.
///
/// Adapters resolve conflicts with other writers internally; an error means
/// the operation genuinely failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend refused access to the document.
    #[error("permission denied for {key}")]
    PermissionDenied {
        /// Storage key of the document.
        key: String,
    },

    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Concurrent writers kept winning until the retry budget ran out.
    #[error("transaction on {key} lost {attempts} compare-and-swap rounds")]
    Conflict {
        /// Storage key of the document.
        key: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Stored bytes could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The backend has been shut down.
    #[error("backend closed")]
    Closed,
}

impl BackendError {
    /// Returns true if the caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Conflict { .. })
    }
}
