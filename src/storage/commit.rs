//! Commit creation and conflict detection
//!
//! - every row write inside a transaction is one commit on its `tx/` branch
//! - committing a transaction moves `main` to the branch tip
//! - conflict detection compares both sides against their merge base

use std::collections::HashSet;
use std::path::PathBuf;

use git2::{DiffOptions, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree::TreeHandle;
use crate::storage::types::{CommitId, GitSignature, TreeId};

/// builder for creating commits with a fluent interface
pub struct CommitBuilder<'a> {
    repo: &'a Repository,
    tree_id: Option<TreeId>,
    parents: Vec<CommitId>,
    message: String,
    signature: GitSignature,
    update_ref: Option<String>,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            tree_id: None,
            parents: Vec::new(),
            message: String::new(),
            signature: GitSignature::default(),
            update_ref: None,
        }
    }

    pub fn tree(mut self, tree_id: TreeId) -> Self {
        self.tree_id = Some(tree_id);
        self
    }

    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    /// move a ref to the new commit as part of creating it
    pub fn update_ref(mut self, refname: impl Into<String>) -> Self {
        self.update_ref = Some(refname.into());
        self
    }

    pub fn commit(self) -> StorageResult<CommitId> {
        let tree_id = self
            .tree_id
            .ok_or_else(|| StorageError::Internal("commit requires a tree".to_string()))?;

        let tree = self.repo.find_tree(tree_id.raw())?;
        let sig = self.signature.to_git2_signature()?;

        let parent_commits: Vec<git2::Commit<'_>> = self
            .parents
            .iter()
            .map(|id| self.repo.find_commit(id.raw()))
            .collect::<Result<_, _>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();

        let oid = self.repo.commit(
            self.update_ref.as_deref(),
            &sig,
            &sig,
            &self.message,
            &tree,
            &parent_refs,
        )?;

        Ok(CommitId::new(oid))
    }
}

/// get the tree snapshot at a specific commit
pub fn get_tree_at_commit(repo: &Repository, commit_id: CommitId) -> StorageResult<TreeHandle<'_>> {
    let commit = repo
        .find_commit(commit_id.raw())
        .map_err(|_| StorageError::CommitNotFound(commit_id.to_string()))?;

    Ok(TreeHandle::new(commit.tree()?))
}

/// create the root commit of a fresh store
pub fn create_initial_commit(repo: &Repository, signature: &GitSignature) -> StorageResult<CommitId> {
    let tree_id = crate::storage::tree::create_initial_tree(repo)?;

    CommitBuilder::new(repo)
        .tree(tree_id)
        .message("[gittx] Initialize store")
        .signature(signature.clone())
        .update_ref("HEAD")
        .commit()
}

/// paths changed between two commits
fn changed_paths(repo: &Repository, old: CommitId, new: CommitId) -> StorageResult<Vec<PathBuf>> {
    let old_tree = repo.find_commit(old.raw())?.tree()?;
    let new_tree = repo.find_commit(new.raw())?.tree()?;

    let mut opts = DiffOptions::new();
    let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))?;

    let paths = diff
        .deltas()
        .filter_map(|delta| delta.new_file().path().or_else(|| delta.old_file().path()).map(PathBuf::from))
        .collect();

    Ok(paths)
}

/// common ancestor of two commits, None if their histories are unrelated
pub fn find_merge_base(repo: &Repository, a: CommitId, b: CommitId) -> StorageResult<Option<CommitId>> {
    match repo.merge_base(a.raw(), b.raw()) {
        Ok(oid) => Ok(Some(CommitId::new(oid))),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(StorageError::Git(e)),
    }
}

/// Rows written on both sides since the merge base.
///
/// An empty result means the two sides touched disjoint rows.
pub fn detect_conflicts(repo: &Repository, ours: CommitId, theirs: CommitId) -> StorageResult<Vec<PathBuf>> {
    let base = find_merge_base(repo, ours, theirs)?.ok_or_else(|| {
        StorageError::Internal("no common ancestor found for conflict detection".to_string())
    })?;

    let our_paths: HashSet<PathBuf> = changed_paths(repo, base, ours)?.into_iter().collect();

    let conflicts = changed_paths(repo, base, theirs)?
        .into_iter()
        .filter(|p| our_paths.contains(p))
        .collect();

    Ok(conflicts)
}

/// message formatting for store operations
pub struct CommitMessage;

impl CommitMessage {
    fn row_op(op: &str, entity: &str, key: &str, tx_id: &str) -> String {
        format!("[{}] {}/{} tx:{}", op, entity, key, tx_id)
    }

    pub fn insert(entity: &str, key: &str, tx_id: &str) -> String {
        Self::row_op("INSERT", entity, key, tx_id)
    }

    pub fn update(entity: &str, key: &str, tx_id: &str) -> String {
        Self::row_op("UPDATE", entity, key, tx_id)
    }

    pub fn delete(entity: &str, key: &str, tx_id: &str) -> String {
        Self::row_op("DELETE", entity, key, tx_id)
    }

    /// bulk delete issued by one statement
    pub fn delete_many(entity: &str, count: usize, tx_id: &str) -> String {
        format!("[DELETE] {} x{} tx:{}", entity, count, tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::TreeMutator;
    use crate::storage::types::{BlobId, EntityName, RowKey};
    use tempfile::TempDir;

    fn setup_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        (dir, repo)
    }

    /// commit on top of `parent` that writes one row
    fn commit_row(repo: &Repository, parent: CommitId, entity: &str, key: &str, body: &[u8]) -> CommitId {
        let tree = get_tree_at_commit(repo, parent).unwrap();
        let mut mutator = TreeMutator::from_tree(repo, &tree).unwrap();
        let blob = BlobId::new(repo.blob(body).unwrap());
        mutator
            .upsert_row(&EntityName::new(entity).unwrap(), &RowKey::new(key).unwrap(), blob)
            .unwrap();
        let tree_id = mutator.write().unwrap();

        CommitBuilder::new(repo)
            .tree(tree_id)
            .parent(parent)
            .message(format!("write {}/{}", entity, key))
            .commit()
            .unwrap()
    }

    #[test]
    fn test_initial_commit() {
        let (_dir, repo) = setup_repo();
        let commit_id = create_initial_commit(&repo, &GitSignature::default()).unwrap();
        let commit = repo.find_commit(commit_id.raw()).unwrap();

        assert!(commit.message().unwrap().contains("Initialize"));
        assert_eq!(commit.parent_count(), 0);
        assert_eq!(commit.author().name(), Some("gittx"));
    }

    #[test]
    fn test_changed_paths() {
        let (_dir, repo) = setup_repo();
        let c1 = create_initial_commit(&repo, &GitSignature::default()).unwrap();
        let c2 = commit_row(&repo, c1, "Domain", "row1", b"{}");
        let c3 = commit_row(&repo, c2, "Domain", "row1", b"{\"v\":1}");

        assert_eq!(changed_paths(&repo, c1, c2).unwrap(), vec![PathBuf::from("Domain/row1.json")]);
        assert_eq!(changed_paths(&repo, c2, c3).unwrap(), vec![PathBuf::from("Domain/row1.json")]);
        assert!(changed_paths(&repo, c2, c2).unwrap().is_empty());
    }

    #[test]
    fn test_detect_conflicts() {
        let (_dir, repo) = setup_repo();
        let base = create_initial_commit(&repo, &GitSignature::default()).unwrap();

        let ours = commit_row(&repo, base, "Domain", "a", b"{\"v\":1}");
        let theirs = commit_row(&repo, base, "Domain", "a", b"{\"v\":2}");
        let disjoint = commit_row(&repo, base, "Domain", "b", b"{\"v\":3}");

        assert_eq!(find_merge_base(&repo, ours, theirs).unwrap(), Some(base));
        assert_eq!(
            detect_conflicts(&repo, ours, theirs).unwrap(),
            vec![PathBuf::from("Domain/a.json")]
        );
        assert!(detect_conflicts(&repo, ours, disjoint).unwrap().is_empty());
    }

    #[test]
    fn test_commit_messages() {
        assert_eq!(CommitMessage::insert("Domain", "ab", "tx1"), "[INSERT] Domain/ab tx:tx1");
        assert_eq!(CommitMessage::delete("Domain", "ab", "tx1"), "[DELETE] Domain/ab tx:tx1");
        assert_eq!(CommitMessage::delete_many("Domain", 3, "tx1"), "[DELETE] Domain x3 tx:tx1");
    }
}
