//! Deterministic engine and factory stubs for lock and pool tests.
//!
//! Available with the `test-utils` feature. The stubs never touch a real
//! database: selects are answered from scripted result sets and executes are
//! logged, so tests can focus on arbitration behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::engine::{ConnectionFactory, QueryEngine, TableUpdate};
use crate::error::{Result, SqliteArbiterError};
use crate::results::ResultSet;
use crate::value::RowValue;

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`QueryEngine`] stub.
pub struct StubEngine {
    label: String,
    scripted: StdMutex<HashMap<String, ResultSet>>,
    executed: StdMutex<Vec<(String, Vec<RowValue>)>>,
    autocommit: AtomicBool,
    disposed: AtomicBool,
    updates: broadcast::Sender<TableUpdate>,
}

impl StubEngine {
    #[must_use]
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(64);
        Arc::new(Self {
            label: label.into(),
            scripted: StdMutex::new(HashMap::new()),
            executed: StdMutex::new(Vec::new()),
            autocommit: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            updates,
        })
    }

    /// Script the result set returned for an exact SQL string.
    pub fn script_select(&self, sql: impl Into<String>, result: ResultSet) {
        lock(&self.scripted).insert(sql.into(), result);
    }

    /// Every statement passed to `execute` or `execute_batch`, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<(String, Vec<RowValue>)> {
        lock(&self.executed).clone()
    }

    pub fn set_autocommit(&self, autocommit: bool) {
        self.autocommit.store(autocommit, Ordering::Release);
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Publish a change notification, as a storage engine would after a
    /// mutation.
    pub fn notify(&self, table: impl Into<String>) {
        let _ = self.updates.send(TableUpdate {
            table: table.into(),
        });
    }

    fn guard(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(SqliteArbiterError::Connection(format!(
                "stub engine `{}` is disposed",
                self.label
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QueryEngine for StubEngine {
    async fn select(&self, sql: &str, _params: &[RowValue]) -> Result<ResultSet> {
        self.guard()?;
        Ok(lock(&self.scripted).get(sql).cloned().unwrap_or_default())
    }

    async fn execute(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet> {
        self.guard()?;
        lock(&self.executed).push((sql.to_owned(), params.to_vec()));
        let mut result = ResultSet::default();
        result.rows_affected = 1;
        Ok(result)
    }

    async fn execute_batch(&self, sql: &str, param_sets: &[Vec<RowValue>]) -> Result<()> {
        self.guard()?;
        let mut executed = lock(&self.executed);
        for set in param_sets {
            executed.push((sql.to_owned(), set.clone()));
        }
        Ok(())
    }

    async fn autocommit(&self) -> Result<bool> {
        self.guard()?;
        Ok(self.autocommit.load(Ordering::Acquire))
    }

    async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::Release);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TableUpdate> {
        self.updates.subscribe()
    }
}

/// Factory of [`StubEngine`]s that records every open.
#[derive(Default)]
pub struct StubFactory {
    open_delay: Option<Duration>,
    opened: AtomicUsize,
    engines: StdMutex<Vec<Arc<StubEngine>>>,
}

impl StubFactory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delay each open, to widen pool-growth race windows in tests.
    #[must_use]
    pub fn with_open_delay(open_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            open_delay: Some(open_delay),
            ..Self::default()
        })
    }

    /// Number of connections opened through this factory.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// Every engine handed out so far, in open order.
    #[must_use]
    pub fn engines(&self) -> Vec<Arc<StubEngine>> {
        lock(&self.engines).clone()
    }
}

#[async_trait]
impl ConnectionFactory for StubFactory {
    async fn open(&self, read_only: bool, label: &str) -> Result<Arc<dyn QueryEngine>> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        self.opened.fetch_add(1, Ordering::AcqRel);
        let mode = if read_only { "ro" } else { "rw" };
        let engine = StubEngine::new(format!("{label}-{mode}"));
        lock(&self.engines).push(Arc::clone(&engine));
        Ok(engine)
    }
}
