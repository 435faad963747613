use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::context::{Executor, ReadContext, WriteContext};
use crate::engine::QueryEngine;
use crate::error::{Result, SqliteArbiterError};
use crate::mutex::ScopedMutex;
use crate::remote::{RemoteClient, RemoteGrant};
use crate::updates::UpdateStream;

/// The mode of a lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    /// Read-mode hold; concurrent holders permitted.
    Shared,
    /// Write-mode hold; at most one holder system-wide.
    Exclusive,
}

/// How a connection serializes its callers: a local mutex when this process
/// owns the handle, or the message protocol when an arbiter does.
enum Arbitration {
    Local(ScopedMutex),
    Remote(RemoteClient),
}

enum GrantInner {
    Local(OwnedMutexGuard<()>),
    Remote(RemoteGrant),
}

/// RAII hold on a connection's lock. Dropping releases unconditionally; the
/// happy path calls [`release`](LockGrant::release) to await the remote
/// acknowledgement.
pub(crate) struct LockGrant {
    inner: Option<GrantInner>,
    locked: Arc<AtomicBool>,
}

impl LockGrant {
    pub(crate) async fn release(mut self) -> Result<()> {
        self.locked.store(false, Ordering::Release);
        match self.inner.take() {
            Some(GrantInner::Local(guard)) => {
                drop(guard);
                Ok(())
            }
            Some(GrantInner::Remote(grant)) => grant.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGrant {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.locked.store(false, Ordering::Release);
        }
        // GrantInner drop handles the rest: a local guard unlocks, a remote
        // grant sends its fire-and-forget release.
    }
}

/// One physical handle to the database.
///
/// Owned by a [`ConnectionPool`](crate::pool::ConnectionPool), or used
/// standalone as a single-connection database: in the cross-context
/// deployment each execution context holds one remote `Connection` served by
/// the shared arbiter.
pub struct Connection {
    executor: Executor,
    arbitration: Arbitration,
    read_only: bool,
    locked: Arc<AtomicBool>,
    label: String,
    /// Shared with the owning pool (and every context): set when either the
    /// pool or this connection closes.
    closed: Arc<AtomicBool>,
    /// Connection-local dispose latch. Distinct from `closed` so a pool-wide
    /// close still disposes each engine exactly once.
    disposed: AtomicBool,
}

impl Connection {
    pub(crate) fn local(
        engine: Arc<dyn QueryEngine>,
        read_only: bool,
        label: String,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            executor: Executor::Local(engine),
            arbitration: Arbitration::Local(ScopedMutex::new()),
            read_only,
            locked: Arc::new(AtomicBool::new(false)),
            label,
            closed,
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn remote(client: RemoteClient, label: String) -> Self {
        Self {
            executor: Executor::Remote(client.clone()),
            arbitration: Arbitration::Remote(client),
            read_only: false,
            locked: Arc::new(AtomicBool::new(false)),
            label,
            closed: Arc::new(AtomicBool::new(false)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Open a standalone single-connection database over `factory`.
    ///
    /// # Errors
    ///
    /// Propagates the factory's open failure.
    pub async fn open(
        factory: &dyn crate::engine::ConnectionFactory,
        read_only: bool,
        label: impl Into<String>,
    ) -> Result<Self> {
        let label = label.into();
        let engine = factory.open(read_only, &label).await?;
        Ok(Self::local(
            engine,
            read_only,
            label,
            Arc::new(AtomicBool::new(false)),
        ))
    }

    /// Whether this connection was opened read-only.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Whether this connection currently holds its lock for a context.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Debug label given at open time.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    fn guard(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SqliteArbiterError::Connection(format!(
                "connection `{}` is closed",
                self.label
            )));
        }
        Ok(())
    }

    /// Acquire this connection's lock.
    ///
    /// In local mode both kinds collapse to the per-connection mutex: read
    /// concurrency comes from the pool holding multiple read connections, not
    /// from sharing one. In remote mode the kind is forwarded to the arbiter,
    /// which tracks shared holders across all contexts.
    pub(crate) async fn acquire(
        &self,
        kind: LockKind,
        timeout: Option<Duration>,
    ) -> Result<LockGrant> {
        self.guard()?;
        let inner = match &self.arbitration {
            Arbitration::Local(mutex) => GrantInner::Local(mutex.acquire_owned(timeout).await?),
            Arbitration::Remote(client) => GrantInner::Remote(client.acquire(kind, timeout).await?),
        };
        self.locked.store(true, Ordering::Release);
        Ok(LockGrant {
            inner: Some(inner),
            locked: Arc::clone(&self.locked),
        })
    }

    pub(crate) fn read_context(&self) -> ReadContext {
        ReadContext::new(self.executor.clone(), Arc::clone(&self.closed))
    }

    pub(crate) fn write_context(&self) -> WriteContext {
        WriteContext::new(self.executor.clone(), Arc::clone(&self.closed))
    }

    /// Acquire a shared lock and run `f` with a read context scoped to it.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteArbiterError::LockTimeout`] if the lock is not granted
    /// within `timeout` (`f` never runs), or propagates `f`'s error after the
    /// lock is released.
    pub async fn read_lock<F, Fut, R>(&self, timeout: Option<Duration>, f: F) -> Result<R>
    where
        F: FnOnce(ReadContext) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let grant = self.acquire(LockKind::Shared, timeout).await?;
        let ctx = self.read_context();
        let outcome = f(ctx.clone()).await;
        ctx.mark_closed();
        finish_with_release(grant, outcome).await
    }

    /// Acquire the exclusive lock and run `f` with a write context scoped to
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteArbiterError::Config`] on a read-only connection,
    /// [`SqliteArbiterError::LockTimeout`] if the lock is not granted within
    /// `timeout`, or propagates `f`'s error after the lock is released.
    pub async fn write_lock<F, Fut, R>(&self, timeout: Option<Duration>, f: F) -> Result<R>
    where
        F: FnOnce(WriteContext) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        if self.read_only {
            return Err(SqliteArbiterError::Config(format!(
                "connection `{}` is read-only",
                self.label
            )));
        }
        let grant = self.acquire(LockKind::Exclusive, timeout).await?;
        let ctx = self.write_context();
        let outcome = f(ctx.clone()).await;
        ctx.mark_closed();
        finish_with_release(grant, outcome).await
    }

    /// Whether the connection currently has an implicit transaction open.
    /// Requires no lock.
    ///
    /// # Errors
    ///
    /// Fails on a closed connection or an engine/protocol failure.
    pub async fn get_autocommit(&self) -> Result<bool> {
        self.guard()?;
        self.executor.autocommit().await
    }

    /// Subscribe to change notifications for the underlying database.
    ///
    /// # Errors
    ///
    /// Fails on a closed connection or when the arbiter is unreachable.
    pub async fn updates(&self) -> Result<UpdateStream> {
        self.guard()?;
        let receiver = match &self.executor {
            Executor::Local(engine) => engine.subscribe(),
            Executor::Remote(client) => client.subscribe().await?,
        };
        Ok(UpdateStream::new(receiver))
    }

    /// Close this connection. Local mode disposes the engine handle; remote
    /// mode only invalidates this caller's view, since the arbiter owns the
    /// real handle.
    ///
    /// # Errors
    ///
    /// Propagates the engine's disposal error.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.executor {
            Executor::Local(engine) => engine.dispose().await,
            Executor::Remote(_) => Ok(()),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("read_only", &self.read_only)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Combine a callback outcome with the result of releasing its lock. The
/// callback's error takes precedence; a release failure after a successful
/// callback surfaces, since the caller's work may depend on the release.
pub(crate) async fn finish_with_release<R>(grant: LockGrant, outcome: Result<R>) -> Result<R> {
    match (outcome, grant.release().await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            warn!(error = %release_err, "lock release failed while propagating callback error");
            Err(err)
        }
    }
}
