use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::hooks::Action;
use rusqlite::types::Value;
use rusqlite::{Connection as RawConnection, OpenFlags};
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::engine::{QueryEngine, TableUpdate};
use crate::error::{Result, SqliteArbiterError};
use crate::results::ResultSet;
use crate::value::RowValue;

use super::channel::Command;
use super::query::{build_result_set, convert_params, values_as_tosql};

pub(super) struct OpenSettings {
    pub path: String,
    pub read_only: bool,
    pub busy_timeout: Duration,
    pub label: String,
}

/// SQLite engine backed by a dedicated worker thread that owns the only
/// `rusqlite::Connection`.
///
/// `rusqlite::Connection` is `!Sync`; commands cross to the worker over a
/// channel and results come back over oneshots, so async callers never touch
/// the raw handle.
pub struct SqliteEngine {
    sender: Sender<Command>,
    updates: broadcast::Sender<TableUpdate>,
    label: String,
    disposed: AtomicBool,
}

impl SqliteEngine {
    /// Open a connection and spawn its worker thread. Resolves only once the
    /// connection is open, configured, and serving commands.
    pub(super) async fn open(
        settings: OpenSettings,
        updates: broadcast::Sender<TableUpdate>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let label = settings.label.clone();
        let hook_updates = updates.clone();
        thread::Builder::new()
            .name(format!("sqlite-engine-{label}"))
            .spawn(move || run_engine_worker(&settings, hook_updates, ready_tx, &receiver))
            .map_err(|err| {
                SqliteArbiterError::Connection(format!(
                    "failed to spawn SQLite engine thread: {err}"
                ))
            })?;

        ready_rx.await.map_err(|_| {
            SqliteArbiterError::Connection(
                "SQLite engine thread exited before reporting readiness".into(),
            )
        })??;

        debug!(label = %label, "sqlite engine ready");
        Ok(Self {
            sender,
            updates,
            label,
            disposed: AtomicBool::new(false),
        })
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| SqliteArbiterError::Connection("SQLite engine worker closed".into()))
    }

    fn guard(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SqliteArbiterError::Connection(format!(
                "SQLite engine `{}` is disposed",
                self.label
            )));
        }
        Ok(())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
        drop_message: &'static str,
    ) -> Result<T> {
        self.guard()?;
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx))?;
        rx.await
            .map_err(|_| SqliteArbiterError::Connection(drop_message.into()))?
    }
}

#[async_trait]
impl QueryEngine for SqliteEngine {
    async fn select(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet> {
        let sql = sql.to_owned();
        let params = convert_params(params);
        self.request(
            |respond_to| Command::Select {
                sql,
                params,
                respond_to,
            },
            "SQLite engine worker dropped while executing select",
        )
        .await
    }

    async fn execute(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet> {
        let sql = sql.to_owned();
        let params = convert_params(params);
        self.request(
            |respond_to| Command::Execute {
                sql,
                params,
                respond_to,
            },
            "SQLite engine worker dropped while executing statement",
        )
        .await
    }

    async fn execute_batch(&self, sql: &str, param_sets: &[Vec<RowValue>]) -> Result<()> {
        let sql = sql.to_owned();
        let param_sets: Vec<Vec<Value>> = param_sets
            .iter()
            .map(|set| convert_params(set))
            .collect();
        self.request(
            |respond_to| Command::ExecuteBatch {
                sql,
                param_sets,
                respond_to,
            },
            "SQLite engine worker dropped while executing batch",
        )
        .await
    }

    async fn autocommit(&self) -> Result<bool> {
        self.request(
            |respond_to| Command::AutoCommit { respond_to },
            "SQLite engine worker dropped while reading autocommit state",
        )
        .await
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Dispose { respond_to: tx })?;
        rx.await.map_err(|_| {
            SqliteArbiterError::Connection(
                "SQLite engine worker dropped while disposing".into(),
            )
        })?
    }

    fn subscribe(&self) -> broadcast::Receiver<TableUpdate> {
        self.updates.subscribe()
    }
}

impl Drop for SqliteEngine {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

impl fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteEngine")
            .field("label", &self.label)
            .field("disposed", &self.disposed)
            .finish()
    }
}

fn run_engine_worker(
    settings: &OpenSettings,
    updates: broadcast::Sender<TableUpdate>,
    ready_tx: oneshot::Sender<Result<()>>,
    receiver: &Receiver<Command>,
) {
    let mut conn = match open_connection(settings, updates) {
        Ok(conn) => {
            let _ = ready_tx.send(Ok(()));
            conn
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    while let Ok(command) = receiver.recv() {
        match command {
            Command::Shutdown => break,
            Command::Dispose { respond_to } => {
                let _ = respond_to.send(Ok(()));
                break;
            }
            Command::Select {
                sql,
                params,
                respond_to,
            } => {
                let _ = respond_to.send(run_select(&conn, &sql, &params));
            }
            Command::Execute {
                sql,
                params,
                respond_to,
            } => {
                let _ = respond_to.send(run_execute(&conn, &sql, &params));
            }
            Command::ExecuteBatch {
                sql,
                param_sets,
                respond_to,
            } => {
                let _ = respond_to.send(run_execute_batch(&mut conn, &sql, &param_sets));
            }
            Command::AutoCommit { respond_to } => {
                let _ = respond_to.send(Ok(conn.is_autocommit()));
            }
        }
    }
}

fn open_connection(
    settings: &OpenSettings,
    updates: broadcast::Sender<TableUpdate>,
) -> Result<RawConnection> {
    let flags = if settings.read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::default()
    };
    let conn = RawConnection::open_with_flags(&settings.path, flags)?;
    conn.busy_timeout(settings.busy_timeout)?;
    if !settings.read_only {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.update_hook(Some(
        move |_action: Action, _db: &str, table: &str, _rowid: i64| {
            let _ = updates.send(TableUpdate {
                table: table.to_owned(),
            });
        },
    ));
    Ok(conn)
}

fn run_select(conn: &RawConnection, sql: &str, params: &[Value]) -> Result<ResultSet> {
    let mut stmt = conn.prepare(sql)?;
    build_result_set(&mut stmt, params)
}

fn run_execute(conn: &RawConnection, sql: &str, params: &[Value]) -> Result<ResultSet> {
    let mut result = {
        let mut stmt = conn.prepare(sql)?;
        if stmt.column_count() > 0 {
            build_result_set(&mut stmt, params)?
        } else {
            let param_refs = values_as_tosql(params);
            stmt.execute(&param_refs[..])?;
            ResultSet::default()
        }
    };
    result.rows_affected = usize::try_from(conn.changes()).unwrap_or(usize::MAX);
    Ok(result)
}

fn run_execute_batch(
    conn: &mut RawConnection,
    sql: &str,
    param_sets: &[Vec<Value>],
) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(sql)?;
        for set in param_sets {
            let param_refs = values_as_tosql(set);
            stmt.execute(&param_refs[..])?;
        }
    }
    tx.commit()?;
    Ok(())
}
