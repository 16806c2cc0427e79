//! Transaction error types.

use std::error::Error as StdError;

use thiserror::Error;

use crate::metamodel::MetamodelError;
use crate::storage::StorageError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors surfaced by the transaction manager.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A data operation ran outside of any transaction. Caller misuse.
    #[error("not in a transaction")]
    NotInTransaction,

    /// A required entity does not exist.
    #[error("no entity found for {0}")]
    NotFound(String),

    /// A logical precondition of the operation does not hold.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Store failure. Conflicts among these are retried.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Entity metadata is wrong. Never retried.
    #[error("configuration error: {0}")]
    Configuration(#[from] MetamodelError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The unit of work failed for its own reasons.
    #[error("transaction aborted: {0}")]
    Aborted(#[source] Box<dyn StdError + Send + Sync>),

    #[error("internal transaction error: {0}")]
    Internal(String),
}

impl TransactionError {
    /// Abort the current unit of work with a caller error.
    pub fn abort(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Aborted(error.into())
    }

    /// Whether the store reported a conflict or transient failure that a
    /// fresh attempt is expected to get past.
    pub fn is_retriable_conflict(&self) -> bool {
        matches!(self, TransactionError::Storage(e) if e.is_retriable())
    }

    /// Store failure that is safe to retry even outside of a conflict.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransactionError::Storage(e) if e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        let conflict = TransactionError::from(StorageError::ConcurrentModification {
            branch: "main".into(),
        });
        assert!(conflict.is_retriable_conflict());
        assert!(!conflict.is_transient());

        let locked = TransactionError::from(StorageError::Git(git2::Error::new(
            git2::ErrorCode::Locked,
            git2::ErrorClass::Reference,
            "locked",
        )));
        assert!(locked.is_retriable_conflict());
        assert!(locked.is_transient());

        assert!(!TransactionError::NotInTransaction.is_retriable_conflict());
        assert!(!TransactionError::PreconditionFailed("x".into()).is_retriable_conflict());
        assert!(!TransactionError::abort("boom").is_retriable_conflict());
    }

    #[test]
    fn test_abort_keeps_source() {
        let err = TransactionError::abort(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(err.to_string(), "transaction aborted: disk");
        assert!(err.source().is_some());
    }
}
