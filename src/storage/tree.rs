//! Tree operations for entity storage.
//!
//! In Git, a tree is a directory. Here:
//! - the root tree contains one directory per entity name
//! - each entity directory contains row blobs (`<row-key>.json`)
//!
//! Entity directories are created on first write and disappear when their
//! last row is deleted, so there is no DDL step.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use git2::{FileMode, ObjectType, Repository, Tree, TreeBuilder as Git2TreeBuilder};

use crate::storage::blob::BlobId;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{EntityName, RowKey, RowPath, TreeId};

/// A read only handle to a git tree at a specific commit
///
/// think of it as a snapshot - it won't change even if new commits are made.
#[derive(Debug)]
pub struct TreeHandle<'repo> {
    tree: Tree<'repo>,
}

impl<'repo> TreeHandle<'repo> {
    pub(crate) fn new(tree: Tree<'repo>) -> Self {
        Self { tree }
    }

    pub fn id(&self) -> TreeId {
        TreeId::new(self.tree.id())
    }

    pub(crate) fn inner(&self) -> &Tree<'repo> {
        &self.tree
    }

    /// subtree for one entity, None if nothing was ever stored for it
    fn entity_tree<'r>(&self, repo: &'r Repository, entity: &EntityName) -> StorageResult<Option<Tree<'r>>> {
        match self.tree.get_name(entity.as_str()) {
            Some(entry) => {
                if entry.kind() != Some(ObjectType::Tree) {
                    return Err(StorageError::CorruptedData {
                        path: entity.as_str().into(),
                        reason: format!("expected a directory, found {:?}", entry.kind()),
                    });
                }
                Ok(Some(repo.find_tree(entry.id())?))
            }
            None => Ok(None),
        }
    }

    /// list all row keys of an entity
    pub fn list_rows(&self, repo: &Repository, entity: &EntityName) -> StorageResult<Vec<RowKey>> {
        let tree = match self.entity_tree(repo, entity)? {
            Some(t) => t,
            None => return Ok(Vec::new()),
        };

        let keys = tree
            .iter()
            .filter(|entry| entry.kind() == Some(ObjectType::Blob))
            .filter_map(|entry| {
                let key = entry.name()?.strip_suffix(".json")?;
                RowKey::new(key).ok()
            })
            .collect();

        Ok(keys)
    }

    /// get the blob ID for a specific row
    pub fn get_row_blob_id(
        &self,
        repo: &Repository,
        entity: &EntityName,
        key: &RowKey,
    ) -> StorageResult<Option<BlobId>> {
        let tree = match self.entity_tree(repo, entity)? {
            Some(t) => t,
            None => return Ok(None),
        };

        let result = match tree.get_name(&RowPath::file_name(key)) {
            Some(entry) if entry.kind() == Some(ObjectType::Blob) => Ok(Some(BlobId::new(entry.id()))),
            Some(entry) => Err(StorageError::CorruptedData {
                path: RowPath::new(entity.clone(), key.clone()).to_path_buf(),
                reason: format!("expected a file, found {:?}", entry.kind()),
            }),
            None => Ok(None),
        };
        result
    }

    pub fn row_exists(&self, repo: &Repository, entity: &EntityName, key: &RowKey) -> StorageResult<bool> {
        Ok(self.get_row_blob_id(repo, entity, key)?.is_some())
    }
}

/// a mutable tree builder for making changes
///
/// collects changes and produces a new root tree when written;
/// the original tree is not modified
///
/// ```ignore
/// let mut mutator = TreeMutator::from_tree(repo, &tree)?;
/// mutator.upsert_row(&entity, &key, blob_id)?;
/// mutator.delete_row(&entity, &other_key)?;
/// let new_tree_id = mutator.write()?;
/// ```
pub struct TreeMutator<'repo> {
    repo: &'repo Repository,
    root_builder: Git2TreeBuilder<'repo>,
    /// builders for entity directories touched so far
    modified: HashMap<String, Git2TreeBuilder<'repo>>,
    /// entity directory tree IDs as found in the original tree
    original: HashMap<String, git2::Oid>,
}

impl<'repo> TreeMutator<'repo> {
    pub fn from_tree(repo: &'repo Repository, tree: &TreeHandle<'_>) -> StorageResult<Self> {
        let root_builder = repo.treebuilder(Some(tree.inner()))?;

        let mut original = HashMap::new();
        for entry in tree.inner().iter() {
            if entry.kind() == Some(ObjectType::Tree) {
                if let Some(name) = entry.name() {
                    original.insert(name.to_string(), entry.id());
                }
            }
        }

        Ok(Self {
            repo,
            root_builder,
            modified: HashMap::new(),
            original,
        })
    }

    pub fn empty(repo: &'repo Repository) -> StorageResult<Self> {
        Ok(Self {
            repo,
            root_builder: repo.treebuilder(None)?,
            modified: HashMap::new(),
            original: HashMap::new(),
        })
    }

    /// get or create the builder for an entity directory
    fn entity_builder(&mut self, entity: &EntityName) -> StorageResult<&mut Git2TreeBuilder<'repo>> {
        match self.modified.entry(entity.as_str().to_string()) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let builder = match self.original.get(entity.as_str()) {
                    Some(id) => {
                        let tree = self.repo.find_tree(*id)?;
                        self.repo.treebuilder(Some(&tree))?
                    }
                    None => self.repo.treebuilder(None)?,
                };
                Ok(v.insert(builder))
            }
        }
    }

    /// insert or replace a row
    pub fn upsert_row(&mut self, entity: &EntityName, key: &RowKey, blob_id: BlobId) -> StorageResult<()> {
        let builder = self.entity_builder(entity)?;
        builder.insert(RowPath::file_name(key), blob_id.raw(), FileMode::Blob.into())?;
        Ok(())
    }

    /// delete a row, failing if it is not there
    pub fn delete_row(&mut self, entity: &EntityName, key: &RowKey) -> StorageResult<()> {
        let builder = self.entity_builder(entity)?;
        builder
            .remove(RowPath::file_name(key))
            .map_err(|_| StorageError::RowNotFound {
                entity: entity.clone(),
                key: key.clone(),
            })
    }

    /// write all changes and return the new root tree ID
    pub fn write(mut self) -> StorageResult<TreeId> {
        for (name, builder) in self.modified {
            if builder.len() == 0 {
                if self.root_builder.get(name.as_str())?.is_some() {
                    self.root_builder.remove(name.as_str())?;
                }
                continue;
            }
            let subtree = builder.write()?;
            self.root_builder.insert(name.as_str(), subtree, FileMode::Tree.into())?;
        }

        let root_id = self.root_builder.write()?;
        Ok(TreeId::new(root_id))
    }
}

/// the empty root tree used by the initial commit
pub fn create_initial_tree(repo: &Repository) -> StorageResult<TreeId> {
    TreeMutator::empty(repo)?.write()
}
