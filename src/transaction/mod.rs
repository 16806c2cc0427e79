//! Transaction management.
//!
//! [`TransactionManager`] runs units of work in store transactions. Each
//! caller owns a [`TransactionContext`] and passes it to every call; work
//! started while the context is active runs inside the open transaction.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │      (begin / work / replicate / commit, rollback)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │   Retrier   │       │ Transaction │       │ Replication │
//!  │  (attempts) │       │   Context   │       │ Log Builder │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use gittx::session::GitStore;
//! use gittx::transaction::{ManagerConfig, TransactionManager};
//! # use gittx::metamodel::{Entity, EntityDescriptor, VKey};
//! # #[derive(serde::Serialize, serde::Deserialize)]
//! # struct Domain { name: String, registrar: String }
//! # impl Entity for Domain {
//! #     type Key = String;
//! #     fn descriptor() -> EntityDescriptor { EntityDescriptor::single("Domain", "name") }
//! # }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (_dir, store) = GitStore::open_temporary()?;
//! let tm = TransactionManager::new(store, ManagerConfig::default());
//! let mut ctx = tm.new_context();
//!
//! tm.run_in_transaction(&mut ctx, |ctx| {
//!     tm.save(ctx, &Domain { name: "example.tld".into(), registrar: "r1".into() })
//! })?;
//! let domain = tm.run_read_only(&mut ctx, |ctx| {
//!     tm.load(ctx, &VKey::<Domain>::new("example.tld".into()))
//! })?;
//! # Ok(())
//! # }
//! ```

mod clock;
mod config;
mod context;
mod error;
mod manager;
mod replication;
mod retry;

pub use clock::{Clock, FakeClock, SystemClock};
pub use config::ManagerConfig;
pub use context::TransactionContext;
pub use error::{TransactionError, TransactionResult};
pub use manager::{Context, TransactionManager};
pub use replication::{Mutation, ReplicationLogBuilder, ReplicationRecord, TransactionEntity};
pub use retry::{
    is_failed_query_retriable, is_failed_read_retriable, is_failed_txn_retriable, FakeSleeper, Retrier,
    RetryConfig, RetryDecision, Sleeper, SystemSleeper,
};
