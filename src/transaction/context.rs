//! Call-scoped transaction state.
//!
//! A `TransactionContext` belongs to one caller and is threaded through its
//! call chain by `&mut`. While a transaction is open it owns the session, the
//! start time, and the replication builder; otherwise it holds nothing.

use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use tracing::warn;

use super::error::{TransactionError, TransactionResult};
use super::replication::ReplicationLogBuilder;
use crate::session::Session;

pub struct TransactionContext<S: Session> {
    session: Option<S>,
    active: bool,
    transaction_time: Option<DateTime<Utc>>,
    log_builder: Option<ReplicationLogBuilder>,
}

impl<S: Session> TransactionContext<S> {
    /// An empty context, outside of any transaction.
    pub fn new() -> Self {
        Self {
            session: None,
            active: false,
            transaction_time: None,
            log_builder: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn session_mut(&mut self) -> TransactionResult<&mut S> {
        match (self.active, self.session.as_mut()) {
            (true, Some(session)) => Ok(session),
            _ => Err(TransactionError::NotInTransaction),
        }
    }

    pub fn transaction_time(&self) -> TransactionResult<DateTime<Utc>> {
        self.transaction_time.ok_or(TransactionError::NotInTransaction)
    }

    /// The replication builder, present only while replicating.
    pub fn log_builder_mut(&mut self) -> Option<&mut ReplicationLogBuilder> {
        self.log_builder.as_mut()
    }

    pub(crate) fn take_log_builder(&mut self) -> Option<ReplicationLogBuilder> {
        self.log_builder.take()
    }

    pub(crate) fn activate(
        &mut self,
        session: S,
        transaction_time: DateTime<Utc>,
        log_builder: Option<ReplicationLogBuilder>,
    ) {
        self.session = Some(session);
        self.active = true;
        self.transaction_time = Some(transaction_time);
        self.log_builder = log_builder;
    }

    /// Reset to empty, handing back the session.
    pub(crate) fn clear(&mut self) -> Option<S> {
        self.active = false;
        self.transaction_time = None;
        self.log_builder = None;
        self.session.take()
    }
}

impl<S: Session> Default for TransactionContext<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Session> std::fmt::Debug for TransactionContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("active", &self.active)
            .field("transaction_time", &self.transaction_time)
            .field("replicating", &self.log_builder.is_some())
            .finish()
    }
}

/// Scope of one transaction attempt. Dropping it clears the context and
/// closes the session, whichever way the attempt ended.
pub(crate) struct AttemptScope<'a, S: Session> {
    ctx: &'a mut TransactionContext<S>,
}

impl<'a, S: Session> AttemptScope<'a, S> {
    pub(crate) fn enter(ctx: &'a mut TransactionContext<S>) -> Self {
        Self { ctx }
    }
}

impl<S: Session> Deref for AttemptScope<'_, S> {
    type Target = TransactionContext<S>;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl<S: Session> DerefMut for AttemptScope<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl<S: Session> Drop for AttemptScope<'_, S> {
    fn drop(&mut self) {
        if let Some(mut session) = self.ctx.clear() {
            if let Err(e) = session.close() {
                warn!(error = %e, "failed to close session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{GitSession, GitStore, SessionFactory};

    #[test]
    fn test_empty_context() {
        let mut ctx = TransactionContext::<GitSession>::new();
        assert!(!ctx.is_active());
        assert!(matches!(ctx.session_mut(), Err(TransactionError::NotInTransaction)));
        assert!(matches!(ctx.transaction_time(), Err(TransactionError::NotInTransaction)));
        assert!(ctx.log_builder_mut().is_none());
    }

    #[test]
    fn test_scope_clears_and_closes() {
        let (_dir, store) = GitStore::open_temporary().unwrap();
        let mut ctx = TransactionContext::new();
        {
            let mut scope = AttemptScope::enter(&mut ctx);
            let mut session = store.open_session().unwrap();
            session.begin().unwrap();
            scope.activate(session, Utc::now(), Some(ReplicationLogBuilder::new()));

            assert!(scope.is_active());
            assert!(scope.session_mut().unwrap().is_active());
            assert!(scope.log_builder_mut().is_some());
        }
        assert!(!ctx.is_active());
        assert!(ctx.transaction_time().is_err());
        assert!(ctx.log_builder_mut().is_none());
        assert!(store.repository().list_transaction_branches().unwrap().is_empty());
    }
}
