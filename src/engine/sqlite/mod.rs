// SQLite engine - rusqlite driven from a dedicated worker thread.
//
// - channel: command vocabulary between async callers and the worker
// - query:   parameter and result conversion
// - worker:  thread spawn, dispatch loop, and the public engine handle
// - factory: ConnectionFactory implementation

mod channel;
mod factory;
mod query;
mod worker;

pub use factory::SqliteFactory;
pub use query::build_result_set;
pub use worker::SqliteEngine;
