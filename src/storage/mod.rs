//! Git-backed row storage.
//!
//! Entities are JSON blobs laid out as `<entity>/<row-key>.json` in a Git
//! tree. The session layer builds on `GitRepository` and never touches git2
//! directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     GitRepository                           │
//! │     (rows at a commit, transaction branches, main CAS)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │    tree     │       │    blob     │       │    refs     │
//!  │ (entities)  │       │   (rows)    │       │ (branches)  │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         └─────────────────────┼─────────────────────┘
//!                               ▼
//!                        ┌─────────────┐
//!                        │   commit    │
//!                        │ (conflicts) │
//!                        └─────────────┘
//! ```

mod blob;
mod commit;
mod error;
mod refs;
mod repository;
mod tree;
mod types;

pub use blob::Row;
pub use error::{StorageError, StorageResult};
pub use repository::GitRepository;
pub use types::{BranchName, CommitId, EntityName, GitSignature, InvalidNameError, RowKey, RowPath};
