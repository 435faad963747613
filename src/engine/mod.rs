//! Collaborator seams for the storage engine and the connection factory.
//!
//! The core of this crate arbitrates *access*; it never interprets SQL. Both
//! traits here are the narrow interfaces through which the arbitration layer
//! consumes the execution layer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::results::ResultSet;
use crate::value::RowValue;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// A change notification emitted after a statement mutates a table.
///
/// Pass-through plumbing only: the arbitration core forwards these without
/// inspecting them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableUpdate {
    /// Name of the mutated table.
    pub table: String,
}

/// One physical handle to the underlying database.
///
/// Implementations must be fully usable by the time the factory's `open`
/// returns them, and must tolerate `dispose` being called at most once.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Run a read statement and materialize all of its rows.
    async fn select(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet>;

    /// Run a mutating statement; returns any result rows (e.g. `RETURNING`)
    /// and the affected-row count.
    async fn execute(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet>;

    /// Apply the same statement once per parameter set, sequentially, without
    /// transferring intermediate result rows back.
    async fn execute_batch(&self, sql: &str, param_sets: &[Vec<RowValue>]) -> Result<()>;

    /// Whether the connection currently has no explicit transaction open.
    async fn autocommit(&self) -> Result<bool>;

    /// Close the handle. Further calls fail.
    async fn dispose(&self) -> Result<()>;

    /// Subscribe to the change-notification feed of this handle.
    fn subscribe(&self) -> broadcast::Receiver<TableUpdate>;
}

/// Opens physical connections on demand.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection. Completes only once the connection is fully usable;
    /// callers may race lock acquisitions against it immediately afterwards.
    async fn open(&self, read_only: bool, label: &str) -> Result<Arc<dyn QueryEngine>>;
}
