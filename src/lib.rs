//! gittx - a retrying, replicating transaction manager
//!
//! Units of work run inside store transactions that either commit fully or
//! roll back. Conflicting transactions are retried, nested calls join the
//! transaction already open, and committed mutations can be mirrored into a
//! replication log stored next to the data.
//!
//! The bundled store keeps entities as JSON blobs in a Git repository: each
//! transaction is a branch and committing fast-forwards `main`.
//!
//! Layers, bottom up:
//!
//! - [`storage`]: Git objects, rows and refs
//! - [`sql`]: the parameterized statements sessions understand
//! - [`session`]: the store contract and its Git implementation
//! - [`metamodel`]: entity descriptors and identity resolution
//! - [`transaction`]: context, retry policy, replication and the manager

pub mod metamodel;
pub mod session;
pub mod sql;
pub mod storage;
pub mod transaction;

pub use metamodel::{Entity, EntityDescriptor, VKey};
pub use session::{GitStore, StoreConfig};
pub use transaction::{ManagerConfig, TransactionContext, TransactionError, TransactionManager, TransactionResult};
