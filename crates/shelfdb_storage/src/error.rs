//! Error types for storage drivers.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Coarse classification of a storage failure.
///
/// The core never retries; the class tells callers what a failure means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The object or directory does not exist.
    NotFound,
    /// Network, auth or I/O failure. A driver may already have retried.
    Transient,
    /// A `do_not_overwrite` write hit an existing object.
    Conflict,
    /// The backend answered with data that could not be understood.
    CorruptResponse,
    /// The caller broke a driver precondition.
    ProgrammerError,
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The object does not exist.
    #[error("not found: {path}")]
    NotFound {
        /// Path that was requested.
        path: String,
    },

    /// The object exists and overwriting was not allowed.
    #[error("object exists and do_not_overwrite was set: {path}")]
    AlreadyExists {
        /// Path that was written.
        path: String,
    },

    /// A transport or backend failure.
    #[error("backend error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// The backend session or capability token is no longer valid.
    #[error("session expired: {message}")]
    SessionExpired {
        /// Description reported by the backend.
        message: String,
    },

    /// The backend returned data that could not be parsed.
    #[error("corrupt backend response: {message}")]
    CorruptResponse {
        /// Description of the problem.
        message: String,
    },

    /// The request itself was invalid.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the problem.
        message: String,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Creates a not-found error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates an already-exists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    /// Creates a transient backend error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a session-expired error.
    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::SessionExpired {
            message: message.into(),
        }
    }

    /// Creates a corrupt-response error.
    pub fn corrupt_response(message: impl Into<String>) -> Self {
        Self::CorruptResponse {
            message: message.into(),
        }
    }

    /// Creates an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Maps an I/O error for `path`, keeping not-found and exists distinct.
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_found(path),
            io::ErrorKind::AlreadyExists => Self::already_exists(path),
            _ => Self::Io(err),
        }
    }

    /// Classifies this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::AlreadyExists { .. } => ErrorClass::Conflict,
            Self::Transient { .. } | Self::SessionExpired { .. } => ErrorClass::Transient,
            Self::CorruptResponse { .. } => ErrorClass::CorruptResponse,
            Self::InvalidInput { .. } => ErrorClass::ProgrammerError,
            Self::Io(err) if err.kind() == io::ErrorKind::NotFound => ErrorClass::NotFound,
            Self::Io(_) => ErrorClass::Transient,
        }
    }

    /// Returns true if this error means the object is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_class() {
        let missing = StorageError::from_io(io::Error::from(io::ErrorKind::NotFound), "a/b");
        assert!(matches!(missing, StorageError::NotFound { ref path } if path == "a/b"));

        let exists = StorageError::from_io(io::Error::from(io::ErrorKind::AlreadyExists), "a/b");
        assert_eq!(exists.class(), ErrorClass::Conflict);

        let denied = StorageError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "a");
        assert_eq!(denied.class(), ErrorClass::Transient);
    }

    #[test]
    fn classification() {
        assert!(StorageError::not_found("x").is_not_found());
        assert_eq!(
            StorageError::session_expired("cookie").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            StorageError::corrupt_response("bad json").class(),
            ErrorClass::CorruptResponse
        );
        assert_eq!(
            StorageError::invalid_input("batch").class(),
            ErrorClass::ProgrammerError
        );
    }

    #[test]
    fn display_mentions_path() {
        let msg = StorageError::already_exists("db/~t.db/rec-1-2.adb").to_string();
        assert!(msg.contains("rec-1-2.adb"));
    }
}
