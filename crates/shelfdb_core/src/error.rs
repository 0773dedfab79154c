//! Error types for ShelfDB core.

use shelfdb_storage::{ErrorClass, StorageError};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in ShelfDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage driver error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A datafile has too many unreadable lines to be trusted.
    #[error("corrupt data: {message}")]
    CorruptData {
        /// Description of the corruption.
        message: String,
    },

    /// An operation or completion sink panicked.
    #[error("task panicked: {message}")]
    TaskPanicked {
        /// Panic payload, when it was a string.
        message: String,
    },

    /// The executor shut down before the operation completed.
    #[error("executor closed")]
    ExecutorClosed,

    /// Operation is not valid in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// A document was rejected.
    #[error("invalid document: {message}")]
    InvalidDocument {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a corrupt-data error.
    pub fn corrupt_data(message: impl Into<String>) -> Self {
        Self::CorruptData {
            message: message.into(),
        }
    }

    /// Creates a task-panicked error.
    pub fn task_panicked(message: impl Into<String>) -> Self {
        Self::TaskPanicked {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid document error.
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    /// Storage class of this error, if it came from a driver.
    #[must_use]
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Self::Storage(err) => Some(err.class()),
            _ => None,
        }
    }

    /// Returns true if a driver reported the object as absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.class() == Some(ErrorClass::NotFound)
    }
}
