use std::fmt::Write;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Statement, ToSql};

use crate::error::{Result, SqliteArbiterError};
use crate::results::ResultSet;
use crate::value::RowValue;

/// Convert a single [`RowValue`] into a rusqlite value.
#[must_use]
pub(super) fn row_value_to_sqlite(value: &RowValue) -> Value {
    match value {
        RowValue::Int(i) => Value::Integer(*i),
        RowValue::Float(f) => Value::Real(*f),
        RowValue::Text(s) => Value::Text(s.clone()),
        RowValue::Bool(b) => Value::Integer(i64::from(*b)),
        RowValue::Timestamp(dt) => {
            let mut buf = String::with_capacity(32);
            // Infallible: writing into a String cannot fail.
            let _ = write!(buf, "{}", dt.format("%F %T%.f"));
            Value::Text(buf)
        }
        RowValue::Null => Value::Null,
        RowValue::Json(jval) => Value::Text(jval.to_string()),
        RowValue::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

pub(super) fn convert_params(params: &[RowValue]) -> Vec<Value> {
    params.iter().map(row_value_to_sqlite).collect()
}

pub(super) fn values_as_tosql(values: &[Value]) -> Vec<&dyn ToSql> {
    values.iter().map(|v| v as &dyn ToSql).collect()
}

/// Extract a [`RowValue`] from a SQLite row at the given column index.
///
/// # Errors
///
/// Returns [`SqliteArbiterError::Sqlite`] if the value cannot be read.
fn extract_value(row: &rusqlite::Row, idx: usize) -> Result<RowValue> {
    let value: Value = row.get(idx).map_err(SqliteArbiterError::Sqlite)?;
    Ok(match value {
        Value::Null => RowValue::Null,
        Value::Integer(i) => RowValue::Int(i),
        Value::Real(f) => RowValue::Float(f),
        Value::Text(s) => RowValue::Text(s),
        Value::Blob(b) => RowValue::Blob(b),
    })
}

/// Run a prepared statement and materialize every row it produces.
///
/// # Errors
///
/// Returns [`SqliteArbiterError`] if query execution or value extraction
/// fails.
pub fn build_result_set(stmt: &mut Statement, params: &[Value]) -> Result<ResultSet> {
    let param_refs = values_as_tosql(params);
    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(std::string::ToString::to_string)
        .collect();
    let column_count = column_names.len();

    let mut result_set = ResultSet::with_capacity(10);
    result_set.set_column_names(Arc::new(column_names));

    let mut rows_iter = stmt.query(&param_refs[..])?;
    while let Some(row) = rows_iter.next()? {
        let mut row_values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            row_values.push(extract_value(row, i)?);
        }
        result_set.push_values(row_values);
    }

    Ok(result_set)
}
