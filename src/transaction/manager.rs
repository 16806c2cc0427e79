//! Transaction manager.
//!
//! Runs units of work inside store transactions and offers keyed entity
//! operations to them. Work receives the caller's [`TransactionContext`];
//! calls made while the context is active join the open transaction instead
//! of starting another one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::clock::{Clock, SystemClock};
use super::config::ManagerConfig;
use super::context::{AttemptScope, TransactionContext};
use super::error::{TransactionError, TransactionResult};
use super::replication::{ReplicationLogBuilder, TransactionEntity};
use super::retry::{
    is_failed_query_retriable, is_failed_read_retriable, is_failed_txn_retriable, Retrier, Sleeper,
    SystemSleeper,
};
use crate::metamodel::{Entity, EntityKey, Metamodel, VKey};
use crate::session::{Session, SessionFactory};
use crate::sql::{quote_ident, Bindings};

/// Context type for the sessions of factory `F`.
pub type Context<F> = TransactionContext<<F as SessionFactory>::Session>;

const READ_ONLY_DIRECTIVE: &str = "SET TRANSACTION READ ONLY";

/// Coordinates transactions over one session factory.
///
/// Holds no per-transaction state, so one manager can be shared by any
/// number of threads, each with its own context.
pub struct TransactionManager<F: SessionFactory> {
    factory: F,
    metamodel: Metamodel,
    retrier: Retrier,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
}

impl<F: SessionFactory> TransactionManager<F> {
    pub fn new(factory: F, config: ManagerConfig) -> Self {
        let retrier = Retrier::new(config.retry.clone(), Arc::new(SystemSleeper));
        Self {
            factory,
            metamodel: Metamodel::new(),
            retrier,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.retrier = Retrier::new(self.config.retry.clone(), sleeper);
        self
    }

    /// A fresh, inactive context for one caller.
    pub fn new_context(&self) -> Context<F> {
        TransactionContext::new()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    // ==================== Transaction control ====================

    /// Run `work` in a transaction, retrying the whole transaction on
    /// conflicts. Inside an open transaction, `work` just runs.
    pub fn run_in_transaction<T, W>(&self, ctx: &mut Context<F>, work: W) -> TransactionResult<T>
    where
        W: FnMut(&mut Context<F>) -> TransactionResult<T>,
    {
        self.run_retrying(ctx, false, work, is_failed_txn_retriable)
    }

    /// Like [`run_in_transaction`](Self::run_in_transaction) but a failure
    /// is returned on the first attempt.
    pub fn run_in_transaction_no_retry<T, W>(&self, ctx: &mut Context<F>, mut work: W) -> TransactionResult<T>
    where
        W: FnMut(&mut Context<F>) -> TransactionResult<T>,
    {
        if ctx.is_active() {
            return work(ctx);
        }
        self.attempt(ctx, false, &mut work)
    }

    /// Run `work` in a transaction marked read only before `work` starts.
    pub fn run_read_only<T, W>(&self, ctx: &mut Context<F>, work: W) -> TransactionResult<T>
    where
        W: FnMut(&mut Context<F>) -> TransactionResult<T>,
    {
        self.run_retrying(ctx, true, work, is_failed_read_retriable)
    }

    /// Same as [`run_in_transaction`](Self::run_in_transaction); an open
    /// transaction is reused rather than suspended.
    pub fn run_in_new_transaction<T, W>(&self, ctx: &mut Context<F>, work: W) -> TransactionResult<T>
    where
        W: FnMut(&mut Context<F>) -> TransactionResult<T>,
    {
        self.run_in_transaction(ctx, work)
    }

    /// Run query-style work in a transaction, retrying only transient
    /// store failures.
    pub fn run_transactionless<T, W>(&self, ctx: &mut Context<F>, work: W) -> TransactionResult<T>
    where
        W: FnMut(&mut Context<F>) -> TransactionResult<T>,
    {
        self.run_retrying(ctx, false, work, is_failed_query_retriable)
    }

    fn run_retrying<T, W, P>(&self, ctx: &mut Context<F>, read_only: bool, mut work: W, retriable: P) -> TransactionResult<T>
    where
        W: FnMut(&mut Context<F>) -> TransactionResult<T>,
        P: Fn(&TransactionError) -> bool,
    {
        if ctx.is_active() {
            return work(ctx);
        }
        self.retrier
            .call_with_retry(|| self.attempt(ctx, read_only, &mut work), retriable)
    }

    /// One physical transaction. The context is empty again when this returns.
    fn attempt<T, W>(&self, ctx: &mut Context<F>, read_only: bool, work: &mut W) -> TransactionResult<T>
    where
        W: FnMut(&mut Context<F>) -> TransactionResult<T>,
    {
        let mut scope = AttemptScope::enter(ctx);
        let session = self.factory.open_session()?;
        let log_builder = self.config.replicate_transactions.then(ReplicationLogBuilder::new);
        scope.activate(session, self.clock.now_utc(), log_builder);

        match self.begin_work_commit(&mut scope, read_only, work) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.rollback_quietly(&mut scope, &e);
                Err(e)
            }
        }
    }

    fn begin_work_commit<T, W>(&self, ctx: &mut Context<F>, read_only: bool, work: &mut W) -> TransactionResult<T>
    where
        W: FnMut(&mut Context<F>) -> TransactionResult<T>,
    {
        let session = ctx.session_mut()?;
        session.begin()?;
        if read_only && session.supports_read_only() {
            session.execute_update(READ_ONLY_DIRECTIVE, &Bindings::new())?;
        }

        let value = work(ctx)?;
        self.record_transaction(ctx)?;
        ctx.session_mut()?.commit()?;
        Ok(value)
    }

    /// Roll back after `cause`. A failing rollback is logged, never returned.
    fn rollback_quietly(&self, ctx: &mut Context<F>, cause: &TransactionError) {
        let Ok(session) = ctx.session_mut() else {
            return;
        };
        if !session.is_active() {
            return;
        }
        match session.rollback() {
            Ok(()) => warn!(error = %cause, "error during transaction; transaction rolled back"),
            Err(e) => error!(error = %e, cause = %cause, "rollback failed; suppressing error"),
        }
    }

    /// Persist the replication record, if replicating and anything changed.
    fn record_transaction(&self, ctx: &mut Context<F>) -> TransactionResult<()> {
        let Some(builder) = ctx.take_log_builder() else {
            return Ok(());
        };
        let record = builder.build();
        if record.is_empty() {
            return Ok(());
        }

        let entity = TransactionEntity::new(&record, ctx.transaction_time()?)?;
        let (key, value) = self.identify(&entity)?;
        ctx.session_mut()?.persist(&key, value)?;
        debug!(id = %entity.id, mutations = record.len(), "replication record persisted");
        Ok(())
    }

    // ==================== Context queries ====================

    pub fn in_transaction(&self, ctx: &Context<F>) -> bool {
        ctx.is_active()
    }

    pub fn assert_in_transaction(&self, ctx: &Context<F>) -> TransactionResult<()> {
        if ctx.is_active() {
            Ok(())
        } else {
            Err(TransactionError::NotInTransaction)
        }
    }

    /// Start time of the open transaction.
    pub fn transaction_time(&self, ctx: &Context<F>) -> TransactionResult<DateTime<Utc>> {
        self.assert_in_transaction(ctx)?;
        ctx.transaction_time()
    }

    /// The open transaction's session, for work the manager has no
    /// operation for.
    pub fn session<'c>(&self, ctx: &'c mut Context<F>) -> TransactionResult<&'c mut F::Session> {
        ctx.session_mut()
    }

    /// Close the session factory. Later transactions fail.
    pub fn teardown(&self) -> TransactionResult<()> {
        self.factory.close()?;
        Ok(())
    }

    // ==================== Keys ====================

    fn key_of<T: Entity>(&self, key: &VKey<T>) -> TransactionResult<EntityKey> {
        let entity_type = self.metamodel.entity_type::<T>()?;
        let raw = serde_json::to_value(key.key())?;
        Ok(EntityKey::from_sql_key(&entity_type, &raw)?)
    }

    fn identify<T: Entity>(&self, entity: &T) -> TransactionResult<(EntityKey, Value)> {
        let entity_type = self.metamodel.entity_type::<T>()?;
        let value = serde_json::to_value(entity)?;
        let key = EntityKey::from_entity(&entity_type, &value)?;
        Ok((key, value))
    }

    // ==================== Loads ====================

    /// Load an entity, failing with `NotFound` if it does not exist.
    pub fn load<T: Entity>(&self, ctx: &mut Context<F>, key: &VKey<T>) -> TransactionResult<T> {
        self.assert_in_transaction(ctx)?;
        let entity_key = self.key_of(key)?;
        match ctx.session_mut()?.find(&entity_key)? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(TransactionError::NotFound(entity_key.to_string())),
        }
    }

    pub fn try_load<T: Entity>(&self, ctx: &mut Context<F>, key: &VKey<T>) -> TransactionResult<Option<T>> {
        self.assert_in_transaction(ctx)?;
        let entity_key = self.key_of(key)?;
        let found = ctx.session_mut()?.find(&entity_key)?;
        Ok(found.map(serde_json::from_value).transpose()?)
    }

    /// Load every existing entity among `keys`. Missing keys are left out
    /// and repeated keys loaded once.
    pub fn load_many<'k, T, I>(&self, ctx: &mut Context<F>, keys: I) -> TransactionResult<HashMap<VKey<T>, T>>
    where
        T: Entity,
        I: IntoIterator<Item = &'k VKey<T>>,
    {
        self.assert_in_transaction(ctx)?;
        let mut loaded = HashMap::new();
        let mut missing = HashSet::new();
        for key in keys {
            if loaded.contains_key(key) || missing.contains(key) {
                continue;
            }
            match self.try_load(ctx, key)? {
                Some(entity) => {
                    loaded.insert(key.clone(), entity);
                }
                None => {
                    missing.insert(key.clone());
                }
            }
        }
        Ok(loaded)
    }

    pub fn load_all<T: Entity>(&self, ctx: &mut Context<F>) -> TransactionResult<Vec<T>> {
        self.assert_in_transaction(ctx)?;
        let entity_type = self.metamodel.entity_type::<T>()?;
        let sql = format!("SELECT e FROM {} e", quote_ident(entity_type.name().as_str()));
        ctx.session_mut()?
            .query(&sql, &Bindings::new(), None)?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(TransactionError::from))
            .collect()
    }

    // ==================== Writes ====================

    /// Insert a new entity. Fails if one with the same identity exists.
    pub fn save<T: Entity>(&self, ctx: &mut Context<F>, entity: &T) -> TransactionResult<()> {
        self.assert_in_transaction(ctx)?;
        let (key, value) = self.identify(entity)?;
        ctx.session_mut()?.persist(&key, value.clone())?;
        if let Some(builder) = ctx.log_builder_mut() {
            builder.add_update(&key, value);
        }
        Ok(())
    }

    /// Insert or replace.
    pub fn upsert<T: Entity>(&self, ctx: &mut Context<F>, entity: &T) -> TransactionResult<()> {
        self.assert_in_transaction(ctx)?;
        let (key, value) = self.identify(entity)?;
        self.merge(ctx, &key, value)
    }

    /// Replace an existing entity, failing with `PreconditionFailed` if
    /// there is none.
    pub fn update<T: Entity>(&self, ctx: &mut Context<F>, entity: &T) -> TransactionResult<()> {
        self.assert_in_transaction(ctx)?;
        let (key, value) = self.identify(entity)?;
        if !self.exists_key(ctx, &key)? {
            return Err(TransactionError::PreconditionFailed(format!(
                "cannot update {}: it does not exist",
                key
            )));
        }
        self.merge(ctx, &key, value)
    }

    fn merge(&self, ctx: &mut Context<F>, key: &EntityKey, value: Value) -> TransactionResult<()> {
        ctx.session_mut()?.merge(key, value.clone())?;
        if let Some(builder) = ctx.log_builder_mut() {
            builder.add_update(key, value);
        }
        Ok(())
    }

    pub fn save_all<'e, T, I>(&self, ctx: &mut Context<F>, entities: I) -> TransactionResult<()>
    where
        T: Entity,
        I: IntoIterator<Item = &'e T>,
    {
        entities.into_iter().try_for_each(|e| self.save(ctx, e))
    }

    pub fn upsert_all<'e, T, I>(&self, ctx: &mut Context<F>, entities: I) -> TransactionResult<()>
    where
        T: Entity,
        I: IntoIterator<Item = &'e T>,
    {
        entities.into_iter().try_for_each(|e| self.upsert(ctx, e))
    }

    pub fn update_all<'e, T, I>(&self, ctx: &mut Context<F>, entities: I) -> TransactionResult<()>
    where
        T: Entity,
        I: IntoIterator<Item = &'e T>,
    {
        entities.into_iter().try_for_each(|e| self.update(ctx, e))
    }

    // ==================== Deletes ====================

    /// Delete by key, returning the number of rows removed.
    pub fn delete<T: Entity>(&self, ctx: &mut Context<F>, key: &VKey<T>) -> TransactionResult<usize> {
        self.assert_in_transaction(ctx)?;
        let entity_key = self.key_of(key)?;
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(entity_key.entity().as_str()),
            entity_key.and_clause()
        );
        if let Some(builder) = ctx.log_builder_mut() {
            builder.add_delete(&entity_key);
        }
        Ok(ctx.session_mut()?.execute_update(&sql, &entity_key.bindings())?)
    }

    pub fn delete_all<'k, T, I>(&self, ctx: &mut Context<F>, keys: I) -> TransactionResult<usize>
    where
        T: Entity,
        I: IntoIterator<Item = &'k VKey<T>>,
    {
        let mut removed = 0;
        for key in keys {
            removed += self.delete(ctx, key)?;
        }
        Ok(removed)
    }

    /// Delete exactly one row, failing with `PreconditionFailed` otherwise.
    pub fn delete_or_throw<T: Entity>(&self, ctx: &mut Context<F>, key: &VKey<T>) -> TransactionResult<()> {
        match self.delete(ctx, key)? {
            1 => Ok(()),
            n => Err(TransactionError::PreconditionFailed(format!(
                "expected to delete one row for {:?}, deleted {}",
                key, n
            ))),
        }
    }

    // ==================== Existence ====================

    pub fn exists<T: Entity>(&self, ctx: &mut Context<F>, key: &VKey<T>) -> TransactionResult<bool> {
        self.assert_in_transaction(ctx)?;
        let entity_key = self.key_of(key)?;
        self.exists_key(ctx, &entity_key)
    }

    pub fn exists_entity<T: Entity>(&self, ctx: &mut Context<F>, entity: &T) -> TransactionResult<bool> {
        self.assert_in_transaction(ctx)?;
        let (key, _) = self.identify(entity)?;
        self.exists_key(ctx, &key)
    }

    fn exists_key(&self, ctx: &mut Context<F>, key: &EntityKey) -> TransactionResult<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE {}",
            quote_ident(key.entity().as_str()),
            key.and_clause()
        );
        let found = ctx.session_mut()?.query(&sql, &key.bindings(), Some(1))?;
        Ok(!found.is_empty())
    }
}

impl<F: SessionFactory> std::fmt::Debug for TransactionManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("metamodel", &self.metamodel)
            .finish()
    }
}
