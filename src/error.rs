use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SqliteArbiterError>;

#[derive(Debug, Error)]
pub enum SqliteArbiterError {
    /// A lock acquisition deadline elapsed before the lock was granted.
    /// Recoverable; the callback was never invoked.
    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    /// An operation was attempted through a context whose governing lock has
    /// already been released, or whose database has been closed.
    #[error("context is closed; its lock has been released")]
    ContextClosed,

    /// `get` or `get_optional` saw a row count the call does not permit.
    /// Carries the observed number of rows.
    #[error("query returned {0} rows where a single row was required")]
    Cardinality(usize),

    /// The lock arbiter rejected or failed a coordination message. Fatal to
    /// the in-flight lock attempt.
    #[error("lock arbiter protocol failure: {0}")]
    Protocol(String),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("SQL execution error: {0}")]
    Execution(String),

    #[error("configuration error: {0}")]
    Config(String),
}
