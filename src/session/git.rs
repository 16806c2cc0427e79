//! Git-backed store.
//!
//! Each transaction works on its own `tx/<id>` branch forked from `main`;
//! every write is one commit on that branch. Commit is first-committer-wins:
//! `main` is fast-forwarded to the branch tip only if it has not moved since
//! the transaction began. Otherwise the commit fails with a retriable
//! conflict and the branch is discarded.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::{Session, SessionFactory};
use crate::metamodel::EntityKey;
use crate::sql::{Bindings, ParseError, Parser, Predicate, Projection, Statement};
use crate::storage::{
    BranchName, CommitId, EntityName, GitRepository, GitSignature, Row, StorageError, StorageResult,
};

/// Where and how to open a [`GitStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the repository directory.
    pub path: PathBuf,
    /// Initialize a repository if none exists at `path`.
    pub create_if_missing: bool,
    /// Author of every commit the store writes.
    pub signature: GitSignature,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".gittx"),
            create_if_missing: true,
            signature: GitSignature::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }
}

/// Session factory over one Git repository.
///
/// Clones share the repository, the commit lock and the closed flag.
#[derive(Clone)]
pub struct GitStore {
    repo: GitRepository,
    /// serializes the check-then-fast-forward of `main`
    commit_lock: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
}

impl GitStore {
    /// Open the store, removing transaction branches left by a crashed process.
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        let repo = if config.create_if_missing {
            GitRepository::open_or_init(&config.path, config.signature)?
        } else {
            GitRepository::open(&config.path, config.signature)?
        };

        let abandoned = repo.cleanup_abandoned_transactions()?;
        if abandoned > 0 {
            info!(path = %config.path.display(), abandoned, "removed abandoned transaction branches");
        }

        Ok(Self {
            repo,
            commit_lock: Arc::new(Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A store in a fresh temporary directory, removed when the `TempDir` drops.
    pub fn open_temporary() -> StorageResult<(TempDir, Self)> {
        let dir = TempDir::new()?;
        let store = Self::open(StoreConfig::new(dir.path()))?;
        Ok((dir, store))
    }

    pub fn repository(&self) -> &GitRepository {
        &self.repo
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl SessionFactory for GitStore {
    type Session = GitSession;

    fn open_session(&self) -> StorageResult<GitSession> {
        if self.is_closed() {
            return Err(StorageError::StoreClosed);
        }
        Ok(GitSession {
            repo: self.repo.clone(),
            commit_lock: self.commit_lock.clone(),
            tx: None,
            open: true,
        })
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for GitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitStore")
            .field("path", &self.repo.path())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug)]
struct OpenTransaction {
    tx_id: String,
    branch: BranchName,
    /// `main` when the transaction began
    base_commit: CommitId,
    /// tip of the transaction branch
    current_commit: CommitId,
    read_only: bool,
}

impl OpenTransaction {
    fn advance(&mut self, repo: &GitRepository, commit: CommitId) -> StorageResult<()> {
        self.current_commit = commit;
        repo.update_branch(&self.branch, commit)
    }
}

/// A session on a [`GitStore`]. Not shared between threads.
#[derive(Debug)]
pub struct GitSession {
    repo: GitRepository,
    commit_lock: Arc<Mutex<()>>,
    tx: Option<OpenTransaction>,
    open: bool,
}

impl GitSession {
    /// id of the open transaction, if any
    pub fn transaction_id(&self) -> Option<&str> {
        self.tx.as_ref().map(|tx| tx.tx_id.as_str())
    }

    pub fn is_read_only(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.read_only)
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::SessionClosed)
        }
    }

    /// Reads see the transaction's own writes, or `main` outside a transaction.
    fn read_commit(&self) -> StorageResult<CommitId> {
        self.ensure_open()?;
        match &self.tx {
            Some(tx) => Ok(tx.current_commit),
            None => self.repo.head(),
        }
    }

    fn writable<'a>(
        tx: &'a mut Option<OpenTransaction>,
        open: bool,
        op: &'static str,
    ) -> StorageResult<&'a mut OpenTransaction> {
        if !open {
            return Err(StorageError::SessionClosed);
        }
        let tx = tx.as_mut().ok_or(StorageError::NoActiveTransaction)?;
        if tx.read_only {
            return Err(StorageError::ReadOnly(op));
        }
        Ok(tx)
    }

    /// Fast-forward `main` to the transaction tip if nobody else got there first.
    fn publish(&self, tx: &OpenTransaction) -> StorageResult<()> {
        if tx.current_commit == tx.base_commit {
            return Ok(());
        }

        let main = self.repo.head()?;
        if main != tx.base_commit {
            let conflicting_paths = self.repo.detect_conflicts(tx.current_commit, main)?;
            if !conflicting_paths.is_empty() {
                return Err(StorageError::MergeConflict { conflicting_paths });
            }
            return Err(StorageError::ConcurrentModification {
                branch: BranchName::MAIN.to_string(),
            });
        }

        self.repo.fast_forward_main(tx.base_commit, tx.current_commit)
    }

    fn discard(&self, tx: &OpenTransaction) {
        if let Err(e) = self.repo.delete_branch(&tx.branch) {
            warn!(tx_id = %tx.tx_id, error = %e, "failed to delete transaction branch");
        }
    }
}

fn matches_filter(row: &Row, filter: &[Predicate], bindings: &Bindings) -> StorageResult<bool> {
    for predicate in filter {
        if !predicate.matches(row.column(&predicate.column), bindings)? {
            return Ok(false);
        }
    }
    Ok(true)
}

impl Session for GitSession {
    fn begin(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        if let Some(tx) = &self.tx {
            return Err(StorageError::TransactionAlreadyActive(tx.tx_id.clone()));
        }

        let tx_id = Ulid::new().to_string().to_lowercase();
        let base_commit = self.repo.head()?;
        let branch = self.repo.create_transaction_branch(&tx_id, base_commit)?;
        debug!(tx_id = %tx_id, base = %base_commit.short(), "transaction started");

        self.tx = Some(OpenTransaction {
            tx_id,
            branch,
            base_commit,
            current_commit: base_commit,
            read_only: false,
        });
        Ok(())
    }

    fn commit(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        let tx = self.tx.take().ok_or(StorageError::NoActiveTransaction)?;

        let result = {
            let _guard = self.commit_lock.lock();
            self.publish(&tx)
        };
        self.discard(&tx);

        match &result {
            Ok(()) => debug!(tx_id = %tx.tx_id, tip = %tx.current_commit.short(), "transaction committed"),
            Err(e) => debug!(tx_id = %tx.tx_id, error = %e, "transaction commit failed"),
        }
        result
    }

    fn rollback(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        let tx = self.tx.take().ok_or(StorageError::NoActiveTransaction)?;
        self.repo.delete_branch(&tx.branch)?;
        debug!(tx_id = %tx.tx_id, "transaction rolled back");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn supports_read_only(&self) -> bool {
        true
    }

    fn find(&mut self, key: &EntityKey) -> StorageResult<Option<Value>> {
        let at = self.read_commit()?;
        let row = self.repo.read_row(key.entity(), &key.row_key()?, at)?;
        Ok(row.map(|r| r.to_value()))
    }

    fn persist(&mut self, key: &EntityKey, entity: Value) -> StorageResult<()> {
        let row = Row::from_value(key.row_key()?, key.identity(), entity)?;
        let tx = Self::writable(&mut self.tx, self.open, "INSERT")?;
        let commit = self.repo.insert_row(key.entity(), row, tx.current_commit, &tx.tx_id)?;
        tx.advance(&self.repo, commit)
    }

    fn merge(&mut self, key: &EntityKey, entity: Value) -> StorageResult<()> {
        let row_key = key.row_key()?;
        let tx = Self::writable(&mut self.tx, self.open, "MERGE")?;
        let commit = self.repo.upsert_row(
            key.entity(),
            &row_key,
            key.identity(),
            entity,
            tx.current_commit,
            &tx.tx_id,
        )?;
        tx.advance(&self.repo, commit)
    }

    fn query(&mut self, sql: &str, bindings: &Bindings, max_results: Option<usize>) -> StorageResult<Vec<Value>> {
        let select = match Parser::parse(sql)? {
            Statement::Select(select) => select,
            other => return Err(ParseError::UnsupportedStatement(format!("not a query: {:?}", other)).into()),
        };

        let entity = EntityName::new(select.entity.as_str())?;
        let limit = match (select.limit, max_results) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let at = self.read_commit()?;
        let mut results = Vec::new();
        for row in self.repo.scan_rows(&entity, at)? {
            if limit.is_some_and(|n| results.len() >= n) {
                break;
            }
            if matches_filter(&row, &select.filter, bindings)? {
                results.push(match &select.projection {
                    Projection::Constant(value) => value.clone(),
                    Projection::Entity => row.to_value(),
                });
            }
        }
        Ok(results)
    }

    fn execute_update(&mut self, sql: &str, bindings: &Bindings) -> StorageResult<usize> {
        match Parser::parse(sql)? {
            Statement::SetReadOnly => {
                self.ensure_open()?;
                let tx = self.tx.as_mut().ok_or(StorageError::NoActiveTransaction)?;
                tx.read_only = true;
                Ok(0)
            }
            Statement::Delete(delete) => {
                let entity = EntityName::new(delete.entity.as_str())?;
                let tx = Self::writable(&mut self.tx, self.open, "DELETE")?;

                let mut keys = Vec::new();
                for row in self.repo.scan_rows(&entity, tx.current_commit)? {
                    if matches_filter(&row, &delete.filter, bindings)? {
                        keys.push(row.key);
                    }
                }
                if keys.is_empty() {
                    return Ok(0);
                }

                let commit = self.repo.delete_rows(&entity, &keys, tx.current_commit, &tx.tx_id)?;
                tx.advance(&self.repo, commit)?;
                Ok(keys.len())
            }
            Statement::Select(_) => {
                Err(ParseError::UnsupportedStatement("SELECT is not an update".into()).into())
            }
        }
    }

    fn close(&mut self) -> StorageResult<()> {
        if let Some(tx) = self.tx.take() {
            self.discard(&tx);
            debug!(tx_id = %tx.tx_id, "transaction discarded on close");
        }
        self.open = false;
        Ok(())
    }
}

impl Drop for GitSession {
    fn drop(&mut self) {
        if self.open {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metamodel::{EntityDescriptor, EntityType};
    use serde_json::json;

    fn domain_type() -> EntityType {
        EntityDescriptor::single("Domain", "name").validate().unwrap()
    }

    fn key(name: &str) -> EntityKey {
        EntityKey::from_sql_key(&domain_type(), &json!(name)).unwrap()
    }

    fn setup() -> (TempDir, GitStore) {
        GitStore::open_temporary().unwrap()
    }

    fn insert(store: &GitStore, name: &str, value: Value) {
        let mut session = store.open_session().unwrap();
        session.begin().unwrap();
        session.persist(&key(name), value).unwrap();
        session.commit().unwrap();
    }

    #[test]
    fn test_commit_publishes_writes() {
        let (_dir, store) = setup();
        let mut session = store.open_session().unwrap();
        session.begin().unwrap();
        session.persist(&key("x.tld"), json!({"name": "x.tld", "ttl": 60})).unwrap();

        let mut other = store.open_session().unwrap();
        assert_eq!(other.find(&key("x.tld")).unwrap(), None);
        assert_eq!(session.find(&key("x.tld")).unwrap().unwrap()["ttl"], json!(60));

        session.commit().unwrap();
        assert!(!session.is_active());
        assert_eq!(other.find(&key("x.tld")).unwrap().unwrap()["ttl"], json!(60));
        assert!(store.repository().list_transaction_branches().unwrap().is_empty());
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (_dir, store) = setup();
        let head = store.repository().head().unwrap();

        let mut session = store.open_session().unwrap();
        session.begin().unwrap();
        session.merge(&key("x.tld"), json!({"name": "x.tld"})).unwrap();
        session.rollback().unwrap();

        assert_eq!(store.repository().head().unwrap(), head);
        assert_eq!(session.find(&key("x.tld")).unwrap(), None);
        assert!(matches!(session.rollback(), Err(StorageError::NoActiveTransaction)));
    }

    #[test]
    fn test_persist_existing_fails() {
        let (_dir, store) = setup();
        insert(&store, "x.tld", json!({"name": "x.tld"}));

        let mut session = store.open_session().unwrap();
        session.begin().unwrap();
        let result = session.persist(&key("x.tld"), json!({"name": "x.tld"}));
        assert!(matches!(result, Err(StorageError::RowAlreadyExists { .. })));
    }

    #[test]
    fn test_writes_require_transaction() {
        let (_dir, store) = setup();
        let mut session = store.open_session().unwrap();
        let result = session.merge(&key("x.tld"), json!({"name": "x.tld"}));
        assert!(matches!(result, Err(StorageError::NoActiveTransaction)));

        session.begin().unwrap();
        assert!(matches!(session.begin(), Err(StorageError::TransactionAlreadyActive(_))));
    }

    #[test]
    fn test_read_only_directive_rejects_writes() {
        let (_dir, store) = setup();
        insert(&store, "x.tld", json!({"name": "x.tld"}));

        let mut session = store.open_session().unwrap();
        session.begin().unwrap();
        assert_eq!(session.execute_update("SET TRANSACTION READ ONLY", &Bindings::new()).unwrap(), 0);
        assert!(session.is_read_only());

        assert!(session.find(&key("x.tld")).unwrap().is_some());
        let result = session.merge(&key("y.tld"), json!({"name": "y.tld"}));
        assert!(matches!(result, Err(StorageError::ReadOnly("MERGE"))));
        let result = session.execute_update("DELETE FROM \"Domain\"", &Bindings::new());
        assert!(matches!(result, Err(StorageError::ReadOnly("DELETE"))));

        session.commit().unwrap();
    }

    #[test]
    fn test_query_filters_and_limits() {
        let (_dir, store) = setup();
        let mut session = store.open_session().unwrap();
        session.begin().unwrap();
        for (name, tld) in [("a.com", "com"), ("b.com", "com"), ("c.org", "org")] {
            session.persist(&key(name), json!({"name": name, "tld": tld})).unwrap();
        }

        let by_tld = Bindings::new().bind("tld", json!("com"));
        let all = session
            .query("SELECT d FROM \"Domain\" d WHERE \"tld\" = :tld", &by_tld, None)
            .unwrap();
        assert_eq!(all.len(), 2);

        let probe = session
            .query("SELECT 1 FROM \"Domain\" WHERE \"tld\" = :tld", &by_tld, Some(1))
            .unwrap();
        assert_eq!(probe, vec![json!(1)]);

        let limited = session.query("SELECT * FROM \"Domain\" LIMIT 2", &Bindings::new(), None).unwrap();
        assert_eq!(limited.len(), 2);

        let unbound = session.query("SELECT 1 FROM \"Domain\" WHERE \"tld\" = :tld", &Bindings::new(), None);
        assert!(matches!(unbound, Err(StorageError::Statement(ParseError::UnboundParameter(_)))));
    }

    #[test]
    fn test_delete_counts_rows() {
        let (_dir, store) = setup();
        insert(&store, "a.com", json!({"name": "a.com", "tld": "com"}));
        insert(&store, "b.com", json!({"name": "b.com", "tld": "com"}));

        let mut session = store.open_session().unwrap();
        session.begin().unwrap();
        let com = Bindings::new().bind("tld", json!("com"));
        let none = Bindings::new().bind("tld", json!("net"));
        assert_eq!(session.execute_update("DELETE FROM \"Domain\" WHERE \"tld\" = :tld", &none).unwrap(), 0);
        assert_eq!(session.execute_update("DELETE FROM \"Domain\" WHERE \"tld\" = :tld", &com).unwrap(), 2);
        session.commit().unwrap();

        let mut reader = store.open_session().unwrap();
        assert!(reader.query("SELECT * FROM \"Domain\"", &Bindings::new(), None).unwrap().is_empty());
    }

    #[test]
    fn test_first_committer_wins() {
        let (_dir, store) = setup();
        let mut first = store.open_session().unwrap();
        let mut second = store.open_session().unwrap();
        let mut third = store.open_session().unwrap();
        first.begin().unwrap();
        second.begin().unwrap();
        third.begin().unwrap();

        first.merge(&key("x.tld"), json!({"name": "x.tld", "v": 1})).unwrap();
        second.merge(&key("x.tld"), json!({"name": "x.tld", "v": 2})).unwrap();
        third.merge(&key("y.tld"), json!({"name": "y.tld"})).unwrap();

        first.commit().unwrap();

        let overlapping = second.commit().unwrap_err();
        assert!(matches!(overlapping, StorageError::MergeConflict { .. }));
        assert!(overlapping.is_retriable());

        let disjoint = third.commit().unwrap_err();
        assert!(matches!(disjoint, StorageError::ConcurrentModification { .. }));
        assert!(!second.is_active());
        assert!(store.repository().list_transaction_branches().unwrap().is_empty());
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let (_dir, store) = setup();
        {
            let mut session = store.open_session().unwrap();
            session.begin().unwrap();
            session.merge(&key("x.tld"), json!({"name": "x.tld"})).unwrap();
        }
        assert!(store.repository().list_transaction_branches().unwrap().is_empty());

        let mut reader = store.open_session().unwrap();
        assert_eq!(reader.find(&key("x.tld")).unwrap(), None);
        reader.close().unwrap();
        assert!(matches!(reader.find(&key("x.tld")), Err(StorageError::SessionClosed)));
    }

    #[test]
    fn test_open_removes_abandoned_branches() {
        let dir = TempDir::new().unwrap();
        let store = GitStore::open(StoreConfig::new(dir.path())).unwrap();
        let mut crashed = store.open_session().unwrap();
        crashed.begin().unwrap();
        std::mem::forget(crashed);
        assert_eq!(store.repository().list_transaction_branches().unwrap().len(), 1);

        let reopened = GitStore::open(StoreConfig::new(dir.path()).create_if_missing(false)).unwrap();
        assert!(reopened.repository().list_transaction_branches().unwrap().is_empty());
    }

    #[test]
    fn test_closed_store_rejects_sessions() {
        let (_dir, store) = setup();
        store.close().unwrap();
        assert!(matches!(store.open_session(), Err(StorageError::StoreClosed)));
    }

    #[test]
    fn test_store_config_from_json() {
        let config: StoreConfig = serde_json::from_str(r#"{"path": "/tmp/store"}"#).unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/store"));
        assert!(config.create_if_missing);
        assert_eq!(config.signature, GitSignature::gittx());
    }
}
