use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::connection::LockKind;
use crate::engine::TableUpdate;
use crate::error::{Result, SqliteArbiterError};
use crate::mutex::with_deadline;
use crate::results::ResultSet;
use crate::value::RowValue;

use super::protocol::{Command, GrantId};

/// Caller-side handle to a running arbiter.
///
/// Every operation is one opaque request/response exchange. The client holds
/// no lock state of its own; grants live in [`RemoteGrant`] values that
/// release themselves on every exit path.
#[derive(Clone)]
pub struct RemoteClient {
    sender: mpsc::UnboundedSender<Command>,
}

impl RemoteClient {
    pub(super) fn new(sender: mpsc::UnboundedSender<Command>) -> Self {
        Self { sender }
    }

    fn send_command(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| SqliteArbiterError::Protocol("lock arbiter is not running".into()))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
        drop_message: &'static str,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send_command(build(tx))?;
        rx.await
            .map_err(|_| SqliteArbiterError::Protocol(drop_message.into()))?
    }

    /// Request a lock grant, waiting at most `timeout`.
    ///
    /// A timed-out request never leaks a hold: the receiver is closed so a
    /// later grant fails to send and the arbiter reclaims it, and a grant
    /// that raced in just before the close is released here.
    pub(crate) async fn acquire(
        &self,
        kind: LockKind,
        timeout: Option<Duration>,
    ) -> Result<RemoteGrant> {
        let (tx, mut rx) = oneshot::channel();
        self.send_command(Command::RequestLock {
            kind,
            respond_to: tx,
        })?;
        let grant = match with_deadline(timeout, &mut rx).await {
            Ok(response) => response.map_err(|_| {
                SqliteArbiterError::Protocol("lock arbiter dropped a pending lock request".into())
            })??,
            Err(timed_out) => {
                // The arbiter may have granted between the deadline and this
                // point; the send succeeded, so the ledger thinks we hold it.
                rx.close();
                if let Ok(Ok(grant)) = rx.try_recv() {
                    let (ack, _discard) = oneshot::channel();
                    let _ = self.send_command(Command::ReleaseLock {
                        grant,
                        respond_to: ack,
                    });
                }
                return Err(timed_out);
            }
        };
        Ok(RemoteGrant {
            client: self.clone(),
            grant,
            released: false,
        })
    }

    pub(crate) async fn select(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet> {
        let sql = sql.to_owned();
        let params = params.to_vec();
        self.request(
            |respond_to| Command::Select {
                sql,
                params,
                respond_to,
            },
            "lock arbiter dropped while executing select",
        )
        .await
    }

    pub(crate) async fn execute(&self, sql: &str, params: &[RowValue]) -> Result<ResultSet> {
        let sql = sql.to_owned();
        let params = params.to_vec();
        self.request(
            |respond_to| Command::Execute {
                sql,
                params,
                respond_to,
            },
            "lock arbiter dropped while executing statement",
        )
        .await
    }

    pub(crate) async fn execute_batch(
        &self,
        sql: &str,
        param_sets: &[Vec<RowValue>],
    ) -> Result<()> {
        let sql = sql.to_owned();
        let param_sets = param_sets.to_vec();
        self.request(
            |respond_to| Command::ExecuteBatch {
                sql,
                param_sets,
                respond_to,
            },
            "lock arbiter dropped while executing batch",
        )
        .await
    }

    pub(crate) async fn autocommit(&self) -> Result<bool> {
        self.request(
            |respond_to| Command::GetAutoCommit { respond_to },
            "lock arbiter dropped while reading autocommit state",
        )
        .await
    }

    pub(crate) async fn subscribe(&self) -> Result<broadcast::Receiver<TableUpdate>> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Subscribe { respond_to: tx })?;
        rx.await.map_err(|_| {
            SqliteArbiterError::Protocol("lock arbiter dropped while subscribing".into())
        })
    }
}

/// One granted lock hold. Must be released; dropping it without an explicit
/// release sends a fire-and-forget `releaseLock` as best-effort cleanup.
pub(crate) struct RemoteGrant {
    client: RemoteClient,
    grant: GrantId,
    released: bool,
}

impl RemoteGrant {
    /// Release the grant and wait for the arbiter's acknowledgement.
    pub(crate) async fn release(mut self) -> Result<()> {
        self.released = true;
        let grant = self.grant;
        self.client
            .request(
                |respond_to| Command::ReleaseLock { grant, respond_to },
                "lock arbiter dropped while releasing a lock",
            )
            .await
    }
}

impl Drop for RemoteGrant {
    fn drop(&mut self) {
        if !self.released {
            let (tx, _rx) = oneshot::channel();
            let _ = self.client.send_command(Command::ReleaseLock {
                grant: self.grant,
                respond_to: tx,
            });
        }
    }
}
