use rusqlite::types::Value;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::results::ResultSet;

pub(super) enum Command {
    Select {
        sql: String,
        params: Vec<Value>,
        respond_to: oneshot::Sender<Result<ResultSet>>,
    },
    Execute {
        sql: String,
        params: Vec<Value>,
        respond_to: oneshot::Sender<Result<ResultSet>>,
    },
    ExecuteBatch {
        sql: String,
        param_sets: Vec<Vec<Value>>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    AutoCommit {
        respond_to: oneshot::Sender<Result<bool>>,
    },
    Dispose {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}
