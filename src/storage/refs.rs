//! Branch and reference management.
//!
//! `main` holds committed state. Every open transaction owns one branch named
//! `tx/{transaction_id}` forked from the `main` tip it started on; the branch
//! is deleted on commit, rollback, or when the store is reopened after a crash.

use git2::{BranchType, ErrorCode, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BranchName, CommitId};

/// Manages Git references (branches).
pub struct RefManager;

impl RefManager {
    /// Resolve a branch name to its current commit ID.
    pub fn resolve_branch(repo: &Repository, branch: &BranchName) -> StorageResult<CommitId> {
        let commit = repo
            .find_reference(&branch.as_ref_path())
            .and_then(|r| r.peel_to_commit())
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        Ok(CommitId::new(commit.id()))
    }

    /// Tip of `main`.
    pub fn head_commit(repo: &Repository) -> StorageResult<CommitId> {
        let head = repo.head().map_err(|e| match e.code() {
            ErrorCode::UnbornBranch => StorageError::EmptyRepository,
            _ => StorageError::Git(e),
        })?;

        Ok(CommitId::new(head.peel_to_commit()?.id()))
    }

    pub fn branch_exists(repo: &Repository, branch: &BranchName) -> bool {
        repo.find_reference(&branch.as_ref_path()).is_ok()
    }

    pub fn create_branch(repo: &Repository, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        if Self::branch_exists(repo, branch) {
            return Err(StorageError::BranchAlreadyExists(branch.to_string()));
        }

        let commit = repo.find_commit(target.raw())?;
        repo.branch(branch.as_str(), &commit, false)?;
        Ok(())
    }

    /// Move a branch unconditionally.
    pub fn update_branch(repo: &Repository, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        let mut reference = repo
            .find_reference(&branch.as_ref_path())
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        reference.set_target(target.raw(), &format!("move to {}", target.short()))?;
        Ok(())
    }

    /// Compare-and-swap a branch: move it to `new_target` only if it still
    /// points at `expected`.
    ///
    /// The check and the write happen inside libgit2 under the ref lock.
    pub fn update_branch_if_unchanged(
        repo: &Repository,
        branch: &BranchName,
        expected: CommitId,
        new_target: CommitId,
    ) -> StorageResult<()> {
        let current = Self::resolve_branch(repo, branch)?;
        if current != expected {
            return Err(StorageError::ConcurrentModification {
                branch: branch.to_string(),
            });
        }

        repo.reference_matching(
            &branch.as_ref_path(),
            new_target.raw(),
            true,
            expected.raw(),
            &format!("fast-forward to {}", new_target.short()),
        )
        .map_err(|e| match e.code() {
            ErrorCode::Modified => StorageError::ConcurrentModification {
                branch: branch.to_string(),
            },
            _ => StorageError::Git(e),
        })?;

        Ok(())
    }

    pub fn delete_branch(repo: &Repository, branch: &BranchName) -> StorageResult<()> {
        repo.find_branch(branch.as_str(), BranchType::Local)
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?
            .delete()?;
        Ok(())
    }

    /// Local branches whose name starts with `prefix`.
    pub fn list_branches(repo: &Repository, prefix: &str) -> StorageResult<Vec<BranchName>> {
        let mut result = Vec::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                if name.starts_with(prefix) {
                    if let Ok(branch_name) = BranchName::new(name) {
                        result.push(branch_name);
                    }
                }
            }
        }
        Ok(result)
    }

    pub fn list_transaction_branches(repo: &Repository) -> StorageResult<Vec<BranchName>> {
        Self::list_branches(repo, BranchName::TX_PREFIX)
    }

    /// Fork a `tx/` branch from `base`.
    pub fn create_transaction_branch(repo: &Repository, tx_id: &str, base: CommitId) -> StorageResult<BranchName> {
        let branch = BranchName::for_transaction(tx_id);
        Self::create_branch(repo, &branch, base)?;
        Ok(branch)
    }

    /// Delete every `tx/` branch. Only safe while no session is open, which
    /// is why the store calls it from `open` alone.
    pub fn cleanup_abandoned_transactions(repo: &Repository) -> StorageResult<usize> {
        let mut deleted = 0;
        for branch in Self::list_transaction_branches(repo)? {
            if Self::delete_branch(repo, &branch).is_ok() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Create `main` at the initial commit and point HEAD at it.
    pub fn init_main_branch(repo: &Repository, initial_commit: CommitId) -> StorageResult<()> {
        let main = BranchName::main();
        if !Self::branch_exists(repo, &main) {
            Self::create_branch(repo, &main, initial_commit)?;
        }
        repo.set_head(&main.as_ref_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::commit::{create_initial_commit, CommitBuilder};
    use crate::storage::tree::create_initial_tree;
    use crate::storage::types::GitSignature;
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, Repository, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let commit_id = create_initial_commit(&repo, &GitSignature::default()).unwrap();
        RefManager::init_main_branch(&repo, commit_id).unwrap();
        (dir, repo, commit_id)
    }

    fn child_of(repo: &Repository, parent: CommitId) -> CommitId {
        let tree_id = create_initial_tree(repo).unwrap();
        CommitBuilder::new(repo).tree(tree_id).parent(parent).message("child").commit().unwrap()
    }

    #[test]
    fn test_head_is_main() {
        let (_dir, repo, expected) = setup_repo();
        assert_eq!(RefManager::head_commit(&repo).unwrap(), expected);
        assert_eq!(RefManager::resolve_branch(&repo, &BranchName::main()).unwrap(), expected);
    }

    #[test]
    fn test_transaction_branch_lifecycle() {
        let (_dir, repo, base) = setup_repo();

        let branch = RefManager::create_transaction_branch(&repo, "01TX", base).unwrap();
        assert_eq!(branch.transaction_id(), Some("01TX"));
        assert_eq!(RefManager::resolve_branch(&repo, &branch).unwrap(), base);

        let dup = RefManager::create_transaction_branch(&repo, "01TX", base);
        assert!(matches!(dup, Err(StorageError::BranchAlreadyExists(_))));

        RefManager::delete_branch(&repo, &branch).unwrap();
        assert!(!RefManager::branch_exists(&repo, &branch));
    }

    #[test]
    fn test_cleanup_leaves_main() {
        let (_dir, repo, base) = setup_repo();
        RefManager::create_transaction_branch(&repo, "a", base).unwrap();
        RefManager::create_transaction_branch(&repo, "b", base).unwrap();

        assert_eq!(RefManager::cleanup_abandoned_transactions(&repo).unwrap(), 2);
        assert!(RefManager::list_transaction_branches(&repo).unwrap().is_empty());
        assert!(RefManager::branch_exists(&repo, &BranchName::main()));
    }

    #[test]
    fn test_update_branch_if_unchanged() {
        let (_dir, repo, c1) = setup_repo();
        let main = BranchName::main();
        let c2 = child_of(&repo, c1);

        RefManager::update_branch_if_unchanged(&repo, &main, c1, c2).unwrap();
        assert_eq!(RefManager::head_commit(&repo).unwrap(), c2);

        let stale = RefManager::update_branch_if_unchanged(&repo, &main, c1, c2);
        assert!(matches!(stale, Err(StorageError::ConcurrentModification { .. })));
    }
}
