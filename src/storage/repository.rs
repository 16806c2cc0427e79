//! Core Git repository wrapper.
//!
//! Wraps `git2::Repository` behind a mutex and exposes the row-level
//! operations the session layer needs. Every write takes a parent commit and
//! returns the new commit; moving branches is a separate step so callers
//! decide which ref a write lands on.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Repository;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::storage::blob::{self, Row};
use crate::storage::commit::{self, CommitBuilder, CommitMessage};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::refs::RefManager;
use crate::storage::tree::{TreeHandle, TreeMutator};
use crate::storage::types::{BranchName, CommitId, EntityName, GitSignature, RowKey};

/// Thread-safe handle to the store's Git repository.
///
/// Cloning is cheap; all clones share one `git2::Repository`.
#[derive(Clone)]
pub struct GitRepository {
    inner: Arc<GitRepositoryInner>,
}

struct GitRepositoryInner {
    // git2::Repository is Send but not Sync
    repo: Mutex<Repository>,
    path: PathBuf,
    signature: GitSignature,
}

impl GitRepository {
    /// Open an existing repository.
    pub fn open(path: impl AsRef<Path>, signature: GitSignature) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;
        Ok(Self::wrap(repo, path, signature))
    }

    /// Initialize a new repository with an empty root commit on `main`.
    pub fn init(path: impl AsRef<Path>, signature: GitSignature) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo = Repository::init(path)?;

        let initial = commit::create_initial_commit(&repo, &signature)?;
        RefManager::init_main_branch(&repo, initial)?;

        Ok(Self::wrap(repo, path, signature))
    }

    pub fn open_or_init(path: impl AsRef<Path>, signature: GitSignature) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.join(".git").exists() {
            Self::open(path, signature)
        } else {
            Self::init(path, signature)
        }
    }

    fn wrap(repo: Repository, path: &Path, signature: GitSignature) -> Self {
        debug!(path = %path.display(), "repository opened");
        Self {
            inner: Arc::new(GitRepositoryInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                signature,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Run `f` with exclusive access to the underlying repository.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    /// Build a new tree from the one at `parent` and commit it.
    fn write_commit<F>(&self, parent: CommitId, message: String, mutate: F) -> StorageResult<CommitId>
    where
        F: FnOnce(&Repository, &TreeHandle<'_>, &mut TreeMutator<'_>) -> StorageResult<()>,
    {
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, parent)?;
            let mut mutator = TreeMutator::from_tree(repo, &tree)?;
            mutate(repo, &tree, &mut mutator)?;
            let new_tree = mutator.write()?;

            CommitBuilder::new(repo)
                .tree(new_tree)
                .parent(parent)
                .message(message)
                .signature(self.inner.signature.clone())
                .commit()
        })
    }

    // ==================== Refs ====================

    /// Current tip of `main`.
    pub fn head(&self) -> StorageResult<CommitId> {
        self.with_repo(RefManager::head_commit)
    }

    pub fn resolve_branch(&self, branch: &BranchName) -> StorageResult<CommitId> {
        self.with_repo(|repo| RefManager::resolve_branch(repo, branch))
    }

    pub fn create_transaction_branch(&self, tx_id: &str, base: CommitId) -> StorageResult<BranchName> {
        self.with_repo(|repo| RefManager::create_transaction_branch(repo, tx_id, base))
    }

    pub fn update_branch(&self, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        self.with_repo(|repo| RefManager::update_branch(repo, branch, target))
    }

    pub fn delete_branch(&self, branch: &BranchName) -> StorageResult<()> {
        self.with_repo(|repo| RefManager::delete_branch(repo, branch))
    }

    pub fn list_transaction_branches(&self) -> StorageResult<Vec<BranchName>> {
        self.with_repo(RefManager::list_transaction_branches)
    }

    pub fn cleanup_abandoned_transactions(&self) -> StorageResult<usize> {
        self.with_repo(RefManager::cleanup_abandoned_transactions)
    }

    /// Move `main` from `expected_main` to `new_tip`.
    ///
    /// Fails with `ConcurrentModification` if `main` moved in the meantime.
    pub fn fast_forward_main(&self, expected_main: CommitId, new_tip: CommitId) -> StorageResult<()> {
        self.with_repo(|repo| {
            RefManager::update_branch_if_unchanged(repo, &BranchName::main(), expected_main, new_tip)
        })
    }

    /// Paths written both on `ours` and on `theirs` since their merge base.
    pub fn detect_conflicts(&self, ours: CommitId, theirs: CommitId) -> StorageResult<Vec<PathBuf>> {
        self.with_repo(|repo| commit::detect_conflicts(repo, ours, theirs))
    }

    // ==================== Rows ====================

    pub fn read_row(&self, entity: &EntityName, key: &RowKey, at: CommitId) -> StorageResult<Option<Row>> {
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, at)?;
            read_row_in(repo, &tree, entity, key)
        })
    }

    /// Every row of an entity at a commit, in key order.
    pub fn scan_rows(&self, entity: &EntityName, at: CommitId) -> StorageResult<Vec<Row>> {
        self.with_repo(|repo| {
            let tree = commit::get_tree_at_commit(repo, at)?;
            let keys = tree.list_rows(repo, entity)?;

            let mut rows = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(row) = read_row_in(repo, &tree, entity, &key)? {
                    rows.push(row);
                }
            }
            Ok(rows)
        })
    }

    /// Insert a new row. Fails with `RowAlreadyExists` if the key is taken.
    pub fn insert_row(&self, entity: &EntityName, row: Row, at: CommitId, tx_id: &str) -> StorageResult<CommitId> {
        let message = CommitMessage::insert(entity.as_str(), row.key.as_str(), tx_id);
        self.write_commit(at, message, |repo, tree, mutator| {
            if tree.row_exists(repo, entity, &row.key)? {
                return Err(StorageError::RowAlreadyExists {
                    entity: entity.clone(),
                    key: row.key.clone(),
                });
            }
            let blob_id = blob::write_blob(repo, &row)?;
            mutator.upsert_row(entity, &row.key, blob_id)
        })
    }

    /// Insert or replace a row. Replacing keeps the creation time and bumps
    /// the version.
    pub fn upsert_row(
        &self,
        entity: &EntityName,
        key: &RowKey,
        identity: BTreeMap<String, Value>,
        value: Value,
        at: CommitId,
        tx_id: &str,
    ) -> StorageResult<CommitId> {
        let fresh = Row::from_value(key.clone(), identity, value)?;
        let existing = self.read_row(entity, key, at)?;

        let (row, message) = match existing {
            Some(old) => {
                let mut row = old.with_update(fresh.data);
                row.identity = fresh.identity;
                (row, CommitMessage::update(entity.as_str(), key.as_str(), tx_id))
            }
            None => (fresh, CommitMessage::insert(entity.as_str(), key.as_str(), tx_id)),
        };

        self.write_commit(at, message, |repo, _tree, mutator| {
            let blob_id = blob::write_blob(repo, &row)?;
            mutator.upsert_row(entity, &row.key, blob_id)
        })
    }

    /// Delete rows in one commit. Every key must exist.
    pub fn delete_rows(&self, entity: &EntityName, keys: &[RowKey], at: CommitId, tx_id: &str) -> StorageResult<CommitId> {
        let message = match keys {
            [key] => CommitMessage::delete(entity.as_str(), key.as_str(), tx_id),
            _ => CommitMessage::delete_many(entity.as_str(), keys.len(), tx_id),
        };
        self.write_commit(at, message, |_repo, _tree, mutator| {
            keys.iter().try_for_each(|key| mutator.delete_row(entity, key))
        })
    }
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepository").field("path", &self.inner.path).finish()
    }
}

fn read_row_in(
    repo: &Repository,
    tree: &TreeHandle<'_>,
    entity: &EntityName,
    key: &RowKey,
) -> StorageResult<Option<Row>> {
    match tree.get_row_blob_id(repo, entity, key)? {
        Some(blob_id) => {
            let bytes = blob::read_blob(repo, blob_id)?;
            Ok(Some(blob::deserialize_row(&bytes, key)?))
        }
        None => Ok(None),
    }
}
