use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as TokioMutex, OnceCell, RwLock, mpsc};
use tracing::debug;

use crate::connection::{Connection, LockGrant, LockKind, finish_with_release};
use crate::context::{ReadContext, WriteContext};
use crate::engine::ConnectionFactory;
use crate::error::{Result, SqliteArbiterError};
use crate::mutex::with_deadline;
use crate::updates::UpdateStream;

/// Default cap on the read connection list.
pub const DEFAULT_MAX_READERS: usize = 5;

const WRITER_LABEL: &str = "writer";

/// Single-writer, multi-reader connection pool.
///
/// Owns at most one write [`Connection`] (created on the first write request,
/// kept for the pool's lifetime) and a list of read connections grown lazily
/// up to `max_readers`, only when no idle reader exists.
///
/// `read_lock` races an acquisition attempt across every registered reader so
/// a call is serviced by whichever reader frees up first rather than queueing
/// behind one designated connection.
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    max_readers: usize,
    readers: StdMutex<Vec<Arc<Connection>>>,
    /// Serializes pool growth so two callers that both find no idle reader
    /// open one new connection between them, not two.
    grow_lock: TokioMutex<()>,
    /// Pool-wide read/write gate: read locks hold it shared, the write lock
    /// holds it exclusively. Per-connection mutexes serialize callers on one
    /// connection; this gate is what keeps reads from overlapping a write
    /// across different connections. tokio's `RwLock` is write-preferring
    /// and FIFO, so neither side starves.
    gate: Arc<RwLock<()>>,
    write_conn: OnceCell<Arc<Connection>>,
    closed: Arc<AtomicBool>,
}

impl ConnectionPool {
    /// Create a pool over the given connection factory.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteArbiterError::Config`] when `max_readers` is zero.
    pub fn new(factory: Arc<dyn ConnectionFactory>, max_readers: usize) -> Result<Self> {
        if max_readers == 0 {
            return Err(SqliteArbiterError::Config(
                "max_readers must be at least 1".into(),
            ));
        }
        Ok(Self {
            factory,
            max_readers,
            readers: StdMutex::new(Vec::new()),
            grow_lock: TokioMutex::new(()),
            gate: Arc::new(RwLock::new(())),
            write_conn: OnceCell::new(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Fluent builder for a pool over a SQLite database file.
    #[cfg(feature = "sqlite")]
    #[must_use]
    pub fn sqlite_builder(path: impl Into<String>) -> SqlitePoolBuilder {
        SqlitePoolBuilder::new(path.into())
    }

    /// The reader cap this pool was built with.
    #[must_use]
    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    /// Number of read connections opened so far.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.lock_readers().len()
    }

    fn lock_readers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Connection>>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn guard(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SqliteArbiterError::Connection("pool is closed".into()));
        }
        Ok(())
    }

    /// Acquire a shared lock on any reader and run `f` with a read context.
    ///
    /// Every currently-registered reader is raced concurrently; exactly one
    /// winner invokes `f`, losing attempts release silently, and a timeout on
    /// a losing attempt never surfaces. `timeout` is one budget for the whole
    /// call: the gate wait, pool growth, and the race all draw from it.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteArbiterError::LockTimeout`] when every attempt times
    /// out (`f` never runs), or propagates `f`'s error after release.
    pub async fn read_lock<F, Fut, R>(&self, timeout: Option<Duration>, f: F) -> Result<R>
    where
        F: FnOnce(ReadContext) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.guard()?;
        let started = Instant::now();
        let shared_gate = with_deadline(timeout, Arc::clone(&self.gate).read_owned()).await?;
        let readers = self.readers_for_race().await?;
        let remaining = remaining_budget(timeout, started);

        let won = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel::<(Arc<Connection>, LockGrant)>(1);
        for conn in readers {
            let won = Arc::clone(&won);
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(grant) = conn.acquire(LockKind::Shared, remaining).await else {
                    return;
                };
                if won
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = tx.send((conn, grant)).await;
                }
                // A grant that lost the race drops here, releasing at once.
            });
        }
        drop(tx);

        let Some((conn, grant)) = rx.recv().await else {
            return Err(match timeout {
                Some(deadline) => SqliteArbiterError::LockTimeout(deadline),
                None => SqliteArbiterError::Connection(
                    "every read lock attempt failed".into(),
                ),
            });
        };

        let ctx = conn.read_context();
        let outcome = f(ctx.clone()).await;
        ctx.mark_closed();
        let outcome = finish_with_release(grant, outcome).await;
        drop(shared_gate);
        outcome
    }

    /// Acquire the exclusive write lock and run `f` with a write context.
    ///
    /// The write connection is created on first use and reused for the
    /// pool's lifetime; there is exactly one, so this is a plain delegation
    /// to its lock with no race. `timeout` is one budget for the whole call,
    /// spanning the gate wait and the connection's own acquisition.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteArbiterError::LockTimeout`] if the lock is not granted
    /// within `timeout` (`f` never runs), or propagates `f`'s error after
    /// release.
    pub async fn write_lock<F, Fut, R>(&self, timeout: Option<Duration>, f: F) -> Result<R>
    where
        F: FnOnce(WriteContext) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.guard()?;
        let started = Instant::now();
        let conn = self.write_connection().await?;
        let excl_gate = with_deadline(
            remaining_budget(timeout, started),
            Arc::clone(&self.gate).write_owned(),
        )
        .await?;
        let outcome = conn.write_lock(remaining_budget(timeout, started), f).await;
        drop(excl_gate);
        outcome
    }

    /// Subscribe to change notifications. Updates originate on the write
    /// connection, which is created now if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Fails on a closed pool or if opening the write connection fails.
    pub async fn updates(&self) -> Result<UpdateStream> {
        self.guard()?;
        self.write_connection().await?.updates().await
    }

    /// Whether the write connection currently has an implicit transaction
    /// open. Requires no lock.
    ///
    /// # Errors
    ///
    /// Fails on a closed pool or an engine failure.
    pub async fn get_autocommit(&self) -> Result<bool> {
        self.guard()?;
        self.write_connection().await?.get_autocommit().await
    }

    /// Close the pool: mark every outstanding context invalid and dispose
    /// each connection.
    ///
    /// # Errors
    ///
    /// Returns the first disposal error encountered; remaining connections
    /// are still closed.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let readers: Vec<Arc<Connection>> = self.lock_readers().drain(..).collect();
        let mut first_err = None;
        if let Some(writer) = self.write_conn.get()
            && let Err(err) = writer.close().await
        {
            first_err = Some(err);
        }
        for conn in readers {
            if let Err(err) = conn.close().await
                && first_err.is_none()
            {
                first_err = Some(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn write_connection(&self) -> Result<&Arc<Connection>> {
        self.write_conn
            .get_or_try_init(|| async {
                let engine = self.factory.open(false, WRITER_LABEL).await?;
                Ok(Arc::new(Connection::local(
                    engine,
                    false,
                    WRITER_LABEL.to_owned(),
                    Arc::clone(&self.closed),
                )))
            })
            .await
    }

    /// Snapshot the reader list, growing it first when no reader is idle and
    /// the cap allows. The requesting call waits for a new connection to
    /// finish opening before racing against it; callers that do not need
    /// growth are never blocked here.
    async fn readers_for_race(&self) -> Result<Vec<Arc<Connection>>> {
        if let Some(snapshot) = self.snapshot_if_serviceable() {
            return Ok(snapshot);
        }

        let _growth = self.grow_lock.lock().await;
        // A concurrent grower may have added an idle reader meanwhile.
        if let Some(snapshot) = self.snapshot_if_serviceable() {
            return Ok(snapshot);
        }

        let label = format!("reader-{}", self.reader_count() + 1);
        debug!(label = %label, "growing read pool");
        let engine = self.factory.open(true, &label).await?;
        let conn = Arc::new(Connection::local(
            engine,
            true,
            label,
            Arc::clone(&self.closed),
        ));
        let mut readers = self.lock_readers();
        readers.push(conn);
        Ok(readers.clone())
    }

    /// A snapshot the caller can race against without growing: some reader is
    /// idle, or the cap is reached (waiting on a busy reader is then the only
    /// option).
    fn snapshot_if_serviceable(&self) -> Option<Vec<Arc<Connection>>> {
        let readers = self.lock_readers();
        if readers.is_empty() {
            return None;
        }
        if readers.iter().any(|conn| !conn.is_locked()) || readers.len() >= self.max_readers {
            Some(readers.clone())
        } else {
            None
        }
    }
}

/// What is left of a call-wide deadline after some of it has been spent.
/// Saturates at zero, which makes the next bounded wait fail immediately.
fn remaining_budget(timeout: Option<Duration>, started: Instant) -> Option<Duration> {
    timeout.map(|total| total.saturating_sub(started.elapsed()))
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_readers", &self.max_readers)
            .field("readers", &self.reader_count())
            .field("writer", &self.write_conn.get().is_some())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Fluent builder for a SQLite-backed pool.
///
/// `build` performs a throwaway read-write open first so the database file
/// exists and WAL is enabled before any read-only connection is attempted;
/// the pooled write connection itself stays lazy.
#[cfg(feature = "sqlite")]
#[derive(Debug, Clone)]
pub struct SqlitePoolBuilder {
    path: String,
    max_readers: usize,
    busy_timeout: Option<Duration>,
}

#[cfg(feature = "sqlite")]
impl SqlitePoolBuilder {
    #[must_use]
    fn new(path: String) -> Self {
        Self {
            path,
            max_readers: DEFAULT_MAX_READERS,
            busy_timeout: None,
        }
    }

    #[must_use]
    pub fn max_readers(mut self, max_readers: usize) -> Self {
        self.max_readers = max_readers;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = Some(busy_timeout);
        self
    }

    /// Build the pool.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteArbiterError`] if the smoke open fails or the
    /// configuration is invalid.
    pub async fn build(self) -> Result<ConnectionPool> {
        use crate::engine::sqlite::SqliteFactory;

        let mut factory = SqliteFactory::new(self.path);
        if let Some(busy_timeout) = self.busy_timeout {
            factory = factory.with_busy_timeout(busy_timeout);
        }
        let setup = factory.open(false, "setup").await?;
        setup.dispose().await?;
        ConnectionPool::new(Arc::new(factory), self.max_readers)
    }
}
