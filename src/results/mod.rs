// Query result model shared by every execution path.
//
// - row: a single row with shared column metadata
// - result_set: an ordered collection of rows plus DML metadata

mod result_set;
mod row;

pub use result_set::ResultSet;
pub use row::Row;
