//! Error types for the OR-Set model.

use thiserror::Error;

/// Result type for model operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

/// Invariant violations detected by the model.
///
/// These indicate a programming error in the caller or a backend that does
/// not honour the replication protocol. They are never swallowed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrdtError {
    /// `add` was called without any membership keys.
    #[error("add requires at least one key (id {id})")]
    EmptyKeys {
        /// Entry id.
        id: String,
    },

    /// `add` tried to change a stored value without contributing a new key.
    #[error("cannot change the value of {id} without new keys")]
    ValueChangeWithoutNewKeys {
        /// Entry id.
        id: String,
    },

    /// A literal could not be loaded into a model.
    #[error("invalid literal: {message}")]
    InvalidLiteral {
        /// Description of the problem.
        message: String,
    },
}

impl CrdtError {
    /// Create an invalid literal error.
    pub fn invalid_literal(message: impl Into<String>) -> Self {
        Self::InvalidLiteral {
            message: message.into(),
        }
    }
}
