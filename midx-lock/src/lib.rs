//! File locking primitives shared by the index, transaction log and cache
//! file: fcntl byte-range advisory locks for the common case, and a dotlock
//! (`link(tmp, path.lock)`) for call sites where fcntl locks are unsafe or
//! insufficient (cross-process metadata writes done by the mailbox list
//! layer, outside this crate).
//!
//! Both backends share the same shape: `acquire(..) -> Result<Guard, Error>`,
//! where dropping the guard releases the lock. Acquisition blocks up to a
//! caller-supplied timeout; on timeout callers get `Error::Timeout` and
//! should surface a "mailbox busy" condition to their own caller.

pub mod dotlock;
pub mod fcntl;

use std::time::Duration;

pub use dotlock::{Dotlock, DotlockSettings};
pub use fcntl::FcntlGuard;

/// Default fcntl lock timeout: 60 seconds.
pub const DEFAULT_FCNTL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default dotlock timeout: 120 seconds.
pub const DEFAULT_DOTLOCK_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out waiting for lock after {0:?}")]
    Timeout(Duration),
    #[error("I/O error while locking: {0}")]
    Io(#[from] std::io::Error),
}
