//! # sqlite-arbiter
//!
//! Asynchronous, safely-concurrent access to a single-writer, multi-reader
//! embedded database. The crate arbitrates *access* rather than interpreting
//! SQL: it guarantees that exactly one write is ever in flight, that reads
//! run concurrently with each other but never while a write holds the
//! database, and that a bounded set of physical connections is grown lazily
//! and raced fairly. The same guarantees hold when the only database handle
//! lives in a separate execution context, via the message-based arbiter in
//! [`remote`].
//!
//! ```no_run
//! use sqlite_arbiter::{ConnectionPool, RowValue};
//!
//! # async fn demo() -> sqlite_arbiter::Result<()> {
//! let pool = ConnectionPool::sqlite_builder("app.db").max_readers(4).build().await?;
//!
//! pool.write_lock(None, |tx| async move {
//!     tx.execute(
//!         "INSERT INTO users (name) VALUES (?1)",
//!         &[RowValue::Text("alice".into())],
//!     )
//!     .await?;
//!     Ok(())
//! })
//! .await?;
//!
//! let name = pool
//!     .read_lock(None, |ctx| async move {
//!         ctx.get("SELECT name FROM users WHERE id = ?1", &[RowValue::Int(1)])
//!             .await
//!     })
//!     .await?;
//! # let _ = name;
//! # Ok(())
//! # }
//! ```

mod connection;
mod context;
mod error;
mod mutex;
mod pool;
mod updates;
mod value;

pub mod engine;
pub mod remote;
pub mod results;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use connection::{Connection, LockKind};
pub use context::{ReadContext, WriteContext};
pub use error::{Result, SqliteArbiterError};
pub use mutex::ScopedMutex;
pub use pool::{ConnectionPool, DEFAULT_MAX_READERS};
pub use updates::UpdateStream;
pub use value::RowValue;

#[cfg(feature = "sqlite")]
pub use pool::SqlitePoolBuilder;

pub use engine::{ConnectionFactory, QueryEngine, TableUpdate};
pub use remote::{ArbiterHandle, LockArbiter};
pub use results::{ResultSet, Row};

/// Convenient imports for common functionality.
pub mod prelude {
    pub use crate::engine::{ConnectionFactory, QueryEngine, TableUpdate};
    pub use crate::{
        Connection, ConnectionPool, LockKind, ReadContext, Result, Row, RowValue, ResultSet,
        SqliteArbiterError, UpdateStream, WriteContext,
    };

    #[cfg(feature = "sqlite")]
    pub use crate::engine::sqlite::SqliteFactory;
    #[cfg(feature = "sqlite")]
    pub use crate::pool::SqlitePoolBuilder;
}
