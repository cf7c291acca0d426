//! Error types for the synchronization engine.

use orstore_backend::BackendError;
use orstore_codec::CodecError;
use orstore_crdt::CrdtError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by providers and the storage registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The backend rejected or failed a transaction.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// A model invariant was violated.
    #[error("model error: {0}")]
    Crdt(#[from] CrdtError),

    /// A value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A collection value has no text `id` field.
    #[error("value has no text id field")]
    MissingId,

    /// The backend delivered a state that breaks the replication protocol.
    #[error("protocol violation on {storage_key}: {message}")]
    ProtocolViolation {
        /// Storage key of the provider.
        storage_key: String,
        /// What was violated.
        message: String,
    },

    /// The provider stopped after a protocol violation on its listener.
    #[error("provider {storage_key} is faulted: {reason}")]
    Faulted {
        /// Storage key of the provider.
        storage_key: String,
        /// The original failure.
        reason: String,
    },

    /// A persistence transaction finished without writing.
    #[error("transaction on {storage_key} did not commit")]
    Uncommitted {
        /// Storage key of the provider.
        storage_key: String,
    },

    /// Local writes kept arriving faster than the persistence loop could
    /// commit them.
    #[error("persistence of {storage_key} did not settle after {rounds} rounds")]
    PersistenceStalled {
        /// Storage key of the provider.
        storage_key: String,
        /// Rounds attempted.
        rounds: u32,
    },

    /// `connect` found no document.
    #[error("no document at {storage_key}")]
    NotFound {
        /// Storage key requested.
        storage_key: String,
    },

    /// `construct` found an existing document.
    #[error("document already exists at {storage_key}")]
    AlreadyExists {
        /// Storage key requested.
        storage_key: String,
    },

    /// A pointer referenced a value its backing store does not hold.
    #[error("dangling reference to {id} in {backing_key}")]
    DanglingReference {
        /// Referenced value id.
        id: String,
        /// Backing store key.
        backing_key: String,
    },

    /// The provider was disposed.
    #[error("provider {storage_key} has been disposed")]
    Disposed {
        /// Storage key of the provider.
        storage_key: String,
    },

    /// The request is not valid for this provider.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Returns true if the caller may retry the same operation later.
    ///
    /// Pending local changes are kept when these errors are returned.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_retryable(),
            Self::Uncommitted { .. } | Self::PersistenceStalled { .. } => true,
            _ => false,
        }
    }

    /// Returns true for errors that indicate a broken protocol or invariant.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Crdt(_) | Self::ProtocolViolation { .. } | Self::Faulted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(EngineError::from(BackendError::Unavailable("down".into())).is_retryable());
        assert!(!EngineError::from(BackendError::PermissionDenied { key: "k".into() })
            .is_retryable());
        assert!(EngineError::Uncommitted {
            storage_key: "k".into()
        }
        .is_retryable());
        assert!(EngineError::from(CrdtError::EmptyKeys { id: "x".into() }).is_fatal());
        assert!(!EngineError::MissingId.is_fatal());
    }

    #[test]
    fn display_names_the_key() {
        let err = EngineError::PersistenceStalled {
            storage_key: "root/list".into(),
            rounds: 4,
        };
        assert_eq!(
            err.to_string(),
            "persistence of root/list did not settle after 4 rounds"
        );
    }
}
