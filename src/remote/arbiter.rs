use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::{Connection, LockKind};
use crate::engine::QueryEngine;
use crate::error::{Result, SqliteArbiterError};

use super::client::RemoteClient;
use super::protocol::{Command, GrantId};

/// Spawns the arbiter task for a shared engine handle.
pub struct LockArbiter;

impl LockArbiter {
    /// Take exclusive ownership of `engine` and start serving the lock
    /// protocol. The returned handle is the only way to reach the engine.
    #[must_use]
    pub fn spawn(engine: Arc<dyn QueryEngine>) -> ArbiterHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_arbiter(engine, receiver));
        ArbiterHandle { sender }
    }
}

/// Cheap-clone handle to a running arbiter. Each independent execution
/// context calls [`connect`](ArbiterHandle::connect) for its own
/// [`Connection`].
#[derive(Clone)]
pub struct ArbiterHandle {
    sender: mpsc::UnboundedSender<Command>,
}

impl ArbiterHandle {
    /// Create a remote connection served by this arbiter.
    #[must_use]
    pub fn connect(&self, label: impl Into<String>) -> Connection {
        Connection::remote(RemoteClient::new(self.sender.clone()), label.into())
    }

    /// Stop the arbiter and dispose the engine it owns.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteArbiterError::Protocol`] if the arbiter is already
    /// gone, or the engine's disposal error.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::Shutdown { respond_to: tx })
            .map_err(|_| SqliteArbiterError::Protocol("lock arbiter is not running".into()))?;
        rx.await
            .map_err(|_| SqliteArbiterError::Protocol("lock arbiter dropped during shutdown".into()))?
    }
}

async fn run_arbiter(
    engine: Arc<dyn QueryEngine>,
    mut receiver: mpsc::UnboundedReceiver<Command>,
) {
    let mut ledger = LockLedger::default();

    while let Some(command) = receiver.recv().await {
        match command {
            Command::RequestLock { kind, respond_to } => {
                ledger.request(kind, respond_to);
            }
            Command::ReleaseLock { grant, respond_to } => {
                let _ = respond_to.send(ledger.release(grant));
            }
            Command::GetAutoCommit { respond_to } => {
                let _ = respond_to.send(engine.autocommit().await);
            }
            Command::Select {
                sql,
                params,
                respond_to,
            } => {
                let _ = respond_to.send(engine.select(&sql, &params).await);
            }
            Command::Execute {
                sql,
                params,
                respond_to,
            } => {
                let _ = respond_to.send(engine.execute(&sql, &params).await);
            }
            Command::ExecuteBatch {
                sql,
                param_sets,
                respond_to,
            } => {
                let _ = respond_to.send(engine.execute_batch(&sql, &param_sets).await);
            }
            Command::Subscribe { respond_to } => {
                let _ = respond_to.send(engine.subscribe());
            }
            Command::Shutdown { respond_to } => {
                let _ = respond_to.send(engine.dispose().await);
                return;
            }
        }
    }

    // Every client handle dropped; the engine has no reachable owner left.
    if let Err(err) = engine.dispose().await {
        warn!(error = %err, "failed to dispose engine after arbiter clients dropped");
    }
}

struct Waiter {
    kind: LockKind,
    respond_to: oneshot::Sender<Result<GrantId>>,
}

/// The arbiter-owned lock state machine: `Unlocked` is both sets empty,
/// `Held(shared)` is a non-empty `shared` set, `Held(exclusive)` is a present
/// `exclusive` grant. Waiters queue in strict FIFO order; a queued exclusive
/// request blocks later-arriving shared requests, so writers cannot starve
/// under shared churn.
#[derive(Default)]
struct LockLedger {
    shared: HashSet<GrantId>,
    exclusive: Option<GrantId>,
    queue: VecDeque<Waiter>,
    next_grant: GrantId,
}

impl LockLedger {
    fn request(&mut self, kind: LockKind, respond_to: oneshot::Sender<Result<GrantId>>) {
        if self.queue.is_empty() && self.can_grant(kind) {
            self.grant(kind, respond_to);
        } else {
            self.queue.push_back(Waiter { kind, respond_to });
        }
    }

    fn can_grant(&self, kind: LockKind) -> bool {
        match kind {
            LockKind::Shared => self.exclusive.is_none(),
            LockKind::Exclusive => self.exclusive.is_none() && self.shared.is_empty(),
        }
    }

    fn grant(&mut self, kind: LockKind, respond_to: oneshot::Sender<Result<GrantId>>) {
        self.next_grant += 1;
        let id = self.next_grant;
        match kind {
            LockKind::Shared => {
                self.shared.insert(id);
            }
            LockKind::Exclusive => {
                self.exclusive = Some(id);
            }
        }
        if respond_to.send(Ok(id)).is_err() {
            // Requester vanished (timed out) before the grant arrived.
            self.remove(id);
        } else {
            debug!(grant = id, ?kind, "lock granted");
        }
    }

    fn release(&mut self, grant: GrantId) -> Result<()> {
        if !self.remove(grant) {
            return Err(SqliteArbiterError::Protocol(format!(
                "release of unknown lock grant {grant}"
            )));
        }
        self.drain_queue();
        Ok(())
    }

    fn remove(&mut self, grant: GrantId) -> bool {
        if self.exclusive == Some(grant) {
            self.exclusive = None;
            true
        } else {
            self.shared.remove(&grant)
        }
    }

    fn drain_queue(&mut self) {
        loop {
            let front_grantable = match self.queue.front() {
                Some(waiter) => self.can_grant(waiter.kind),
                None => false,
            };
            if !front_grantable {
                break;
            }
            if let Some(waiter) = self.queue.pop_front() {
                self.grant(waiter.kind, waiter.respond_to);
            }
        }
    }
}
