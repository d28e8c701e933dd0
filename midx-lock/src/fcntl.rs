//! Whole-file advisory locks, implemented on top of `flock(2)`.
//!
//! Dovecot's lib-index uses fcntl byte-range locks and `flock` more or less
//! interchangeably for the "lock the whole file" case this crate needs.
//! `flock` is used here: its locks are attached to the open file
//! description rather than the (process, inode) pair that fcntl byte-range
//! locks use, so two independent opens in the same process still correctly
//! conflict — which matters for tests and for any caller that opens the
//! same index file more than once.

use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;

use crate::{LockError, LockKind};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An acquired lock over the whole of a file descriptor. Releasing happens
/// on `Drop`, or early via `release()`.
pub struct FcntlGuard {
    fd: RawFd,
    released: bool,
}

impl FcntlGuard {
    /// Acquire a lock of `kind` over the entire file backing `fd`, retrying
    /// until `timeout` elapses.
    pub fn acquire<F: AsRawFd>(fd: &F, kind: LockKind, timeout: Duration) -> Result<Self, LockError> {
        let fd = fd.as_raw_fd();
        let deadline = Instant::now() + timeout;
        let op = match kind {
            LockKind::Read => libc::LOCK_SH,
            LockKind::Write => libc::LOCK_EX,
        } | libc::LOCK_NB;

        loop {
            let rc = unsafe { libc::flock(fd, op) };
            if rc == 0 {
                return Ok(FcntlGuard { fd, released: false });
            }
            match Errno::last() {
                Errno::EWOULDBLOCK => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LockError::Timeout(timeout));
                    }
                    std::thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
                e => return Err(LockError::Io(std::io::Error::from(e))),
            }
        }
    }

    /// Release the lock now rather than waiting for `Drop`.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
        }
        self.released = true;
    }
}

impl Drop for FcntlGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn write_lock_excludes_second_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        let f1 = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let f2 = OpenOptions::new().read(true).write(true).open(&path).unwrap();

        let _g1 = FcntlGuard::acquire(&f1, LockKind::Write, Duration::from_millis(200)).unwrap();
        let err = FcntlGuard::acquire(&f2, LockKind::Write, Duration::from_millis(150));
        assert!(matches!(err, Err(LockError::Timeout(_))));
    }

    #[test]
    fn readers_do_not_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        let f1 = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let f2 = OpenOptions::new().read(true).write(true).open(&path).unwrap();

        let _g1 = FcntlGuard::acquire(&f1, LockKind::Read, Duration::from_millis(200)).unwrap();
        let _g2 = FcntlGuard::acquire(&f2, LockKind::Read, Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        let f1 = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let f2 = OpenOptions::new().read(true).write(true).open(&path).unwrap();

        {
            let _g1 = FcntlGuard::acquire(&f1, LockKind::Write, Duration::from_millis(200)).unwrap();
        }
        FcntlGuard::acquire(&f2, LockKind::Write, Duration::from_millis(200)).unwrap();
    }
}
