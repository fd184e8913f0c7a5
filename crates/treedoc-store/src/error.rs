//! Error types for treedoc-store

use thiserror::Error;

/// Coarse classification of a [`StoreError`], used by callers to decide
/// whether to retry, report "missing", or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unsupported input, raised before any backend call
    Parse,
    /// The addressed record (or cursor) does not exist
    NotFound,
    /// Concurrent modification, duplicate id or lock race; retryable
    Conflict,
    /// Any other backend or transport failure; not retryable by default
    Backend,
}

/// Errors surfaced by the repository adapter
#[derive(Error, Debug)]
pub enum StoreError {
    /// Expression tree could not be compiled
    #[error("Query parse error: {0}")]
    Parse(String),

    /// State diff cannot be turned into a patch
    #[error("Invalid diff for {field}: {reason}")]
    InvalidDiff { field: String, reason: String },

    /// State handed to the adapter is unusable (e.g. missing id)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Record not found
    #[error("Record not found: {id}")]
    NotFound { id: String },

    /// Scroll cursor unknown, exhausted or reclaimed
    #[error("Unknown or timed out scroll: {scroll_id}")]
    ScrollNotFound { scroll_id: String },

    /// A record with this id already exists
    #[error("Record already exists: {id}")]
    AlreadyExists { id: String },

    /// Record was modified concurrently
    #[error("Concurrent update on {id}: {reason}")]
    ConcurrentUpdate { id: String, reason: String },

    /// Lock is held by somebody else
    #[error("Lock on {id} is held by {owner}")]
    LockMismatch { id: String, owner: String },

    /// Backend reported a failure
    #[error("Backend request failed: {0}")]
    Backend(String),

    /// Backend could not be reached or authenticated
    #[error("Backend connection failed: {0}")]
    Connection(String),

    /// Tree document could not be read back into a state
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Request could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn parse(msg: impl Into<String>) -> Self {
        StoreError::Parse(msg.into())
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Parse(_) | StoreError::InvalidDiff { .. } | StoreError::InvalidState(_) => {
                ErrorKind::Parse
            }
            StoreError::NotFound { .. } | StoreError::ScrollNotFound { .. } => ErrorKind::NotFound,
            StoreError::AlreadyExists { .. }
            | StoreError::ConcurrentUpdate { .. }
            | StoreError::LockMismatch { .. } => ErrorKind::Conflict,
            StoreError::Backend(_)
            | StoreError::Connection(_)
            | StoreError::Deserialization(_)
            | StoreError::Serialization(_) => ErrorKind::Backend,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Failure categories a backend can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    NotFound,
    Duplicate,
    Conflict,
    Unavailable,
    Other,
}

/// Error reported by a [`crate::backend::BackendSession`].
///
/// Backends never build [`StoreError`] directly; the repository translates
/// these at its boundary.
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Duplicate, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Conflict, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Unavailable, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Other, message)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            BackendError::unavailable(err.to_string())
        } else {
            BackendError::other(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(StoreError::parse("x").kind(), ErrorKind::Parse);
        assert!(StoreError::NotFound { id: "a".into() }.is_not_found());
        assert!(StoreError::AlreadyExists { id: "a".into() }.is_conflict());
        assert!(StoreError::LockMismatch {
            id: "a".into(),
            owner: "bob".into()
        }
        .is_conflict());
        assert_eq!(StoreError::Backend("boom".into()).kind(), ErrorKind::Backend);
    }
}
