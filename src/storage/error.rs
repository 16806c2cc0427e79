//! Storage layer error types
//!
//! All errors that can occur during storage and session operations are
//! defined here. Retry classification lives next to the variants so the
//! transaction layer never has to match on git internals.

use std::path::PathBuf;

use thiserror::Error;

use crate::sql::ParseError;
use crate::storage::types::{EntityName, InvalidNameError, RowKey};

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// error from the underlying Git library
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// the requested row was not found
    #[error("row not found: entity={entity}, key={key}")]
    RowNotFound { entity: EntityName, key: RowKey },

    /// the row already exists (duplicate identity)
    #[error("row already exists: entity={entity}, key={key}")]
    RowAlreadyExists { entity: EntityName, key: RowKey },

    /// invalid entity, row or branch name
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// a statement could not be parsed or bound
    #[error("statement error: {0}")]
    Statement(#[from] ParseError),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// the specified branch/ref was not found
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// main moved and the transaction touched the same rows
    #[error("merge conflict: {conflicting_paths:?}")]
    MergeConflict { conflicting_paths: Vec<PathBuf> },

    /// data integrity check failed
    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    /// I/O error (filesystem level)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// repo is not initialized
    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    /// repo is empty (no commits)
    #[error("repository is empty: no commits found")]
    EmptyRepository,

    /// the commit was not found
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// branch already exists
    #[error("branch already exists: {0}")]
    BranchAlreadyExists(String),

    /// branch update failed due to concurrent modification
    #[error("concurrent modification: branch {branch} was updated by another transaction")]
    ConcurrentModification { branch: String },

    /// a write was attempted in a read-only transaction
    #[error("cannot execute {0} in a read-only transaction")]
    ReadOnly(&'static str),

    /// the session has no open transaction
    #[error("no active transaction")]
    NoActiveTransaction,

    /// begin was called twice on the same session
    #[error("transaction already active: {0}")]
    TransactionAlreadyActive(String),

    /// the session was used after close
    #[error("session is closed")]
    SessionClosed,

    /// the session factory was shut down
    #[error("store is closed")]
    StoreClosed,

    /// the row data doesn't match the expected shape
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// internal error that shouldn't happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Serialization-style failure: another transaction won the race.
    /// Re-running the whole transaction is expected to succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrentModification { .. } | StorageError::MergeConflict { .. }
        ) || self.is_transient()
    }

    /// Transient store hiccup (lock file contention, interrupted I/O).
    /// Safe to retry for plain queries as well as transactions.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Git(e) => matches!(e.code(), git2::ErrorCode::Locked),
            StorageError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StorageError::RowNotFound {
            entity: EntityName::new("Domain").unwrap(),
            key: RowKey::new("ab").unwrap(),
        };
        assert!(!not_found.is_retriable());
        assert!(!not_found.is_transient());

        let conflict = StorageError::RowAlreadyExists {
            entity: EntityName::new("Domain").unwrap(),
            key: RowKey::new("ab").unwrap(),
        };
        assert!(!conflict.is_retriable());
        assert!(!conflict.is_transient());
    }

    #[test]
    fn test_retry_classification() {
        let race = StorageError::ConcurrentModification {
            branch: "main".into(),
        };
        assert!(race.is_retriable());
        assert!(!race.is_transient());

        let locked = StorageError::Git(git2::Error::new(
            git2::ErrorCode::Locked,
            git2::ErrorClass::Reference,
            "failed to lock file",
        ));
        assert!(locked.is_transient());
        assert!(locked.is_retriable());

        let timed_out = StorageError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(timed_out.is_transient());

        assert!(!StorageError::ReadOnly("INSERT").is_retriable());
    }
}
