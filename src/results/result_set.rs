use std::sync::Arc;

use crate::value::RowValue;

use super::row::Row;

/// The materialized result of one query or mutation.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// Rows returned by the statement, in arrival order.
    pub rows: Vec<Row>,
    /// Rows affected, for mutating statements.
    pub rows_affected: usize,
    /// Column names shared by all rows.
    column_names: Option<Arc<Vec<String>>>,
}

impl ResultSet {
    /// Create an empty result set with preallocated row capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> ResultSet {
        ResultSet {
            rows: Vec::with_capacity(capacity),
            rows_affected: 0,
            column_names: None,
        }
    }

    /// Set the column names shared by every row added afterwards.
    pub fn set_column_names(&mut self, column_names: Arc<Vec<String>>) {
        self.column_names = Some(column_names);
    }

    /// The shared column names, if any rows carry them.
    #[must_use]
    pub fn column_names(&self) -> Option<&Arc<Vec<String>>> {
        self.column_names.as_ref()
    }

    /// Append a row built from raw values using the shared column names.
    /// No-op until `set_column_names` has been called.
    pub fn push_values(&mut self, values: Vec<RowValue>) {
        if let Some(column_names) = &self.column_names {
            self.rows.push(Row::new(Arc::clone(column_names), values));
        }
    }

    /// Number of rows in the result.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the result carries no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
