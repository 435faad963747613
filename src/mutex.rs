use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

use crate::error::{Result, SqliteArbiterError};

/// Run `fut` under an optional deadline, mapping expiry to [`LockTimeout`].
///
/// [`LockTimeout`]: SqliteArbiterError::LockTimeout
pub(crate) async fn with_deadline<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = T>,
) -> Result<T> {
    match timeout {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| SqliteArbiterError::LockTimeout(deadline)),
        None => Ok(fut.await),
    }
}

/// Cooperative, asynchronous, non-reentrant exclusive lock with optional
/// acquire timeout.
///
/// `lock` scopes the hold to a callback: the lock is acquired, the callback
/// runs, and the lock is released on every exit path. Waiters are served in
/// FIFO order (the underlying `tokio::sync::Mutex` queue), so no waiter
/// starves. Re-locking from within the callback deadlocks; reentrancy is not
/// supported.
#[derive(Debug, Clone, Default)]
pub struct ScopedMutex {
    inner: Arc<TokioMutex<()>>,
}

impl ScopedMutex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, run `f`, release, and return `f`'s outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SqliteArbiterError::LockTimeout`] if `timeout` elapses before
    /// acquisition; `f` is never invoked in that case. Any error from `f`
    /// propagates after the lock is released.
    pub async fn lock<F, Fut, T>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire_owned(timeout).await?;
        let outcome = f().await;
        drop(guard);
        outcome
    }

    /// Acquire an owned guard, for callers that need to hold the lock across
    /// an `await` boundary of their own (the pool's read race).
    pub(crate) async fn acquire_owned(
        &self,
        timeout: Option<Duration>,
    ) -> Result<OwnedMutexGuard<()>> {
        with_deadline(timeout, Arc::clone(&self.inner).lock_owned()).await
    }
}
