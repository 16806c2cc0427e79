//! The store contract.
//!
//! The transaction manager never talks to storage directly. It opens a
//! [`Session`] from a [`SessionFactory`], drives its transaction, and issues
//! key lookups, writes, and parameterized statements through it.
//! [`GitStore`] is the Git-backed implementation.

mod git;

pub use git::{GitSession, GitStore, StoreConfig};

use serde_json::Value;

use crate::metamodel::EntityKey;
use crate::sql::Bindings;
use crate::storage::StorageResult;

/// Hands out sessions. Shared by every caller of one manager.
pub trait SessionFactory: Send + Sync {
    type Session: Session;

    fn open_session(&self) -> StorageResult<Self::Session>;

    /// Release the factory. Sessions opened afterwards fail.
    fn close(&self) -> StorageResult<()>;
}

/// One connection to the store, owned by a single caller.
///
/// At most one transaction is open per session. Reads see the session's own
/// uncommitted writes.
pub trait Session: Send {
    fn begin(&mut self) -> StorageResult<()>;

    fn commit(&mut self) -> StorageResult<()>;

    fn rollback(&mut self) -> StorageResult<()>;

    /// whether a transaction is open
    fn is_active(&self) -> bool;

    fn is_open(&self) -> bool;

    /// Whether `SET TRANSACTION READ ONLY` is understood.
    fn supports_read_only(&self) -> bool;

    /// Look an entity up by identity.
    fn find(&mut self, key: &EntityKey) -> StorageResult<Option<Value>>;

    /// Insert a new entity. Fails if the identity is already taken.
    fn persist(&mut self, key: &EntityKey, entity: Value) -> StorageResult<()>;

    /// Insert or replace an entity.
    fn merge(&mut self, key: &EntityKey, entity: Value) -> StorageResult<()>;

    /// Run a `SELECT`, returning at most `max_results` values.
    fn query(&mut self, sql: &str, bindings: &Bindings, max_results: Option<usize>) -> StorageResult<Vec<Value>>;

    /// Run a `DELETE` or a transaction directive, returning the affected row count.
    fn execute_update(&mut self, sql: &str, bindings: &Bindings) -> StorageResult<usize>;

    /// Roll back anything still open and release the session.
    fn close(&mut self) -> StorageResult<()>;
}
