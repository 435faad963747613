use std::sync::Arc;

use crate::value::RowValue;

/// A single row from a query result.
///
/// Column names are shared across all rows of one result set via `Arc` so a
/// large result does not duplicate the header per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    column_names: Arc<Vec<String>>,
    values: Vec<RowValue>,
}

impl Row {
    pub(crate) fn new(column_names: Arc<Vec<String>>, values: Vec<RowValue>) -> Self {
        Self {
            column_names,
            values,
        }
    }

    /// Look up a value by column name.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&RowValue> {
        let idx = self.column_names.iter().position(|name| name == column)?;
        self.values.get(idx)
    }

    /// Look up a value by positional index.
    #[must_use]
    pub fn get_index(&self, idx: usize) -> Option<&RowValue> {
        self.values.get(idx)
    }

    /// The column names for this row, in declaration order.
    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// All values in column order.
    #[must_use]
    pub fn values(&self) -> &[RowValue] {
        &self.values
    }
}
