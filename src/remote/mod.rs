//! Cross-context lock coordination.
//!
//! Used when the only database handle lives in a separate execution context.
//! The arbiter task exclusively owns the engine handle and the global lock
//! state; callers reach both through a tagged request/response protocol and
//! hold no state machine of their own beyond "awaiting a grant" and "holding
//! a grant".
//!
//! - protocol: the message vocabulary
//! - arbiter:  the task owning the engine and the lock ledger
//! - client:   caller-side request/response handle

mod arbiter;
mod client;
mod protocol;

pub use arbiter::{ArbiterHandle, LockArbiter};
pub(crate) use client::{RemoteClient, RemoteGrant};
