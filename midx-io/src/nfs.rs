//! NFS workarounds, gathered behind one policy object so the rest of the
//! workspace never has to special-case the filesystem directly.
//!
//! NFS clients cache attributes and data aggressively, which breaks the
//! "another process already wrote this, I should see it" assumption that
//! the locking and sync code otherwise relies on. When enabled, this
//! policy forces an attribute-cache flush around opens (by `stat`-ing a
//! sibling path, the cheapest portable way to provoke a revalidation) and
//! retries opens that fail with `ESTALE`.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;

#[derive(Clone, Copy, Debug)]
pub struct NfsPolicy {
    pub enabled: bool,
    pub estale_retry_count: u32,
    pub estale_retry_delay: Duration,
}

impl Default for NfsPolicy {
    fn default() -> Self {
        NfsPolicy {
            enabled: false,
            estale_retry_count: 3,
            estale_retry_delay: Duration::from_millis(100),
        }
    }
}

impl NfsPolicy {
    pub fn disabled() -> Self {
        NfsPolicy {
            enabled: false,
            ..Default::default()
        }
    }

    /// Open `path` with `opts`, applying the attribute-cache flush and
    /// ESTALE retry when the policy is enabled. A no-op passthrough to
    /// `opts.open(path)` when disabled.
    pub fn nfs_safe_open(&self, path: &Path, opts: &OpenOptions) -> io::Result<File> {
        if !self.enabled {
            return opts.open(path);
        }

        let mut attempt = 0;
        loop {
            self.flush_attr_cache(path);
            match opts.open(path) {
                Ok(f) => return Ok(f),
                Err(e) if is_estale(&e) && attempt < self.estale_retry_count => {
                    attempt += 1;
                    std::thread::sleep(self.estale_retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Provoke an attribute-cache revalidation by `stat`-ing the parent
    /// directory. Cheap and portable; real Dovecot does the equivalent by
    /// touching the directory's mtime in its `nfs_flush_*` helpers.
    fn flush_attr_cache(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            let _ = fs::metadata(parent);
        }
    }
}

fn is_estale(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::ESTALE as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_policy_opens_directly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        std::fs::write(&path, b"x").unwrap();

        let policy = NfsPolicy::disabled();
        let opts = OpenOptions::new().read(true).clone();
        let f = policy.nfs_safe_open(&path, &opts);
        assert!(f.is_ok());
    }

    #[test]
    fn enabled_policy_opens_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idx");
        std::fs::write(&path, b"x").unwrap();

        let policy = NfsPolicy {
            enabled: true,
            ..Default::default()
        };
        let opts = OpenOptions::new().read(true).clone();
        let f = policy.nfs_safe_open(&path, &opts);
        assert!(f.is_ok());
    }
}
