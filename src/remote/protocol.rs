use tokio::sync::{broadcast, oneshot};

use crate::connection::LockKind;
use crate::engine::TableUpdate;
use crate::error::Result;
use crate::results::ResultSet;
use crate::value::RowValue;

/// Identifies one granted lock hold for the release round-trip.
pub(crate) type GrantId = u64;

/// The request envelope exchanged with the arbiter. Each request carries its
/// own response channel; transport is ordered per sender, and arbitration
/// order across senders belongs to the arbiter.
pub(super) enum Command {
    RequestLock {
        kind: LockKind,
        respond_to: oneshot::Sender<Result<GrantId>>,
    },
    ReleaseLock {
        grant: GrantId,
        respond_to: oneshot::Sender<Result<()>>,
    },
    GetAutoCommit {
        respond_to: oneshot::Sender<Result<bool>>,
    },
    Select {
        sql: String,
        params: Vec<RowValue>,
        respond_to: oneshot::Sender<Result<ResultSet>>,
    },
    Execute {
        sql: String,
        params: Vec<RowValue>,
        respond_to: oneshot::Sender<Result<ResultSet>>,
    },
    ExecuteBatch {
        sql: String,
        param_sets: Vec<Vec<RowValue>>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        respond_to: oneshot::Sender<broadcast::Receiver<TableUpdate>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<Result<()>>,
    },
}
