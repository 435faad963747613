use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::QueryEngine;
use crate::error::{Result, SqliteArbiterError};
use crate::remote::RemoteClient;
use crate::results::{ResultSet, Row};
use crate::value::RowValue;

/// Where a context's statements actually run: the local engine handle, or the
/// arbiter that owns the handle on the far side of a worker boundary.
#[derive(Clone)]
pub(crate) enum Executor {
    Local(Arc<dyn QueryEngine>),
    Remote(RemoteClient),
}

impl Executor {
    pub(crate) async fn select(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet> {
        match self {
            Executor::Local(engine) => engine.select(sql, params).await,
            Executor::Remote(client) => client.select(sql, params).await,
        }
    }

    pub(crate) async fn execute(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet> {
        match self {
            Executor::Local(engine) => engine.execute(sql, params).await,
            Executor::Remote(client) => client.execute(sql, params).await,
        }
    }

    pub(crate) async fn execute_batch(
        &self,
        sql: &str,
        param_sets: &[Vec<RowValue>],
    ) -> Result<()> {
        match self {
            Executor::Local(engine) => engine.execute_batch(sql, param_sets).await,
            Executor::Remote(client) => client.execute_batch(sql, param_sets).await,
        }
    }

    pub(crate) async fn autocommit(&self) -> Result<bool> {
        match self {
            Executor::Local(engine) => engine.autocommit().await,
            Executor::Remote(client) => client.autocommit().await,
        }
    }
}

struct ContextInner {
    executor: Executor,
    closed: AtomicBool,
    db_closed: Arc<AtomicBool>,
}

/// A lock-scoped handle for issuing read statements.
///
/// Valid only while the lock that produced it is held. The lock-holding call
/// frame closes the context when the caller's callback returns, so a clone
/// retained beyond the callback fails every operation with
/// [`SqliteArbiterError::ContextClosed`].
#[derive(Clone)]
pub struct ReadContext {
    inner: Arc<ContextInner>,
}

impl ReadContext {
    pub(crate) fn new(executor: Executor, db_closed: Arc<AtomicBool>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                executor,
                closed: AtomicBool::new(false),
                db_closed,
            }),
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// True once the governing lock has been released or the database closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
            || self.inner.db_closed.load(Ordering::Acquire)
    }

    fn guard(&self) -> Result<&Executor> {
        if self.is_closed() {
            return Err(SqliteArbiterError::ContextClosed);
        }
        Ok(&self.inner.executor)
    }

    /// Run a query and return all rows, any count including zero.
    ///
    /// # Errors
    ///
    /// Fails with [`SqliteArbiterError::ContextClosed`] on an expired context,
    /// or propagates the engine's execution error.
    pub async fn get_all(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet> {
        self.guard()?.select(sql, params).await
    }

    /// Run a query expected to return exactly one row.
    ///
    /// # Errors
    ///
    /// Fails with [`SqliteArbiterError::Cardinality`] on zero or multiple
    /// rows, and [`SqliteArbiterError::ContextClosed`] on an expired context.
    pub async fn get(&self, sql: &str, params: &[RowValue]) -> Result<Row> {
        let mut rows = self.get_all(sql, params).await?.rows;
        match rows.len() {
            1 => Ok(rows.swap_remove(0)),
            n => Err(SqliteArbiterError::Cardinality(n)),
        }
    }

    /// Run a query expected to return at most one row. Zero rows is `None`.
    ///
    /// # Errors
    ///
    /// Fails with [`SqliteArbiterError::Cardinality`] on multiple rows, and
    /// [`SqliteArbiterError::ContextClosed`] on an expired context.
    pub async fn get_optional(&self, sql: &str, params: &[RowValue]) -> Result<Option<Row>> {
        let mut rows = self.get_all(sql, params).await?.rows;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(rows.swap_remove(0))),
            n => Err(SqliteArbiterError::Cardinality(n)),
        }
    }

    /// Whether the underlying connection currently has an implicit
    /// transaction open.
    ///
    /// # Errors
    ///
    /// Fails with [`SqliteArbiterError::ContextClosed`] on an expired context.
    pub async fn get_autocommit(&self) -> Result<bool> {
        self.guard()?.autocommit().await
    }
}

/// A lock-scoped handle with mutation capability on top of [`ReadContext`].
#[derive(Clone)]
pub struct WriteContext {
    read: ReadContext,
}

impl WriteContext {
    pub(crate) fn new(executor: Executor, db_closed: Arc<AtomicBool>) -> Self {
        Self {
            read: ReadContext::new(executor, db_closed),
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.read.mark_closed();
    }

    /// Run a mutating statement; returns any result rows (e.g. `RETURNING`)
    /// and the affected-row count.
    ///
    /// # Errors
    ///
    /// Fails with [`SqliteArbiterError::ContextClosed`] on an expired context,
    /// or propagates the engine's execution error.
    pub async fn execute(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet> {
        self.read.guard()?.execute(sql, params).await
    }

    /// Apply the same statement once per parameter set, sequentially, without
    /// transferring intermediate result rows back.
    ///
    /// # Errors
    ///
    /// Fails with [`SqliteArbiterError::ContextClosed`] on an expired context,
    /// or propagates the engine's execution error.
    pub async fn execute_batch(&self, sql: &str, param_sets: &[Vec<RowValue>]) -> Result<()> {
        self.read.guard()?.execute_batch(sql, param_sets).await
    }
}

impl Deref for WriteContext {
    type Target = ReadContext;

    fn deref(&self) -> &Self::Target {
        &self.read
    }
}
