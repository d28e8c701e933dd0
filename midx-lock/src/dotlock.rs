//! Dotlock: a cooperative, creation-based lock implemented by atomically
//! `link`-ing a uniquely named temp file onto `<path>.lock`. Used where
//! fcntl/flock locks are unsafe (e.g. certain NFS setups) or where a
//! metadata file (not the index itself) needs cross-process exclusion.
//!
//! Staleness of an existing lock file is judged by three independent
//! signals, checked on every retry, any one of which is enough to reclaim
//! the lock:
//!
//! 1. the PID recorded in the lock file is not alive;
//! 2. the lock file itself is older than `immediate_stale_timeout`;
//! 3. the target file hasn't changed for `stale_timeout` — the presumed
//!    holder looks like it has stopped making progress.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use rand::Rng;

use crate::LockError;

const RANDOM_SLEEP_MIN_MS: u64 = 100;
const RANDOM_SLEEP_MAX_MS: u64 = 200;

#[derive(Clone, Debug)]
pub struct DotlockSettings {
    pub lock_suffix: String,
    /// A lock file older than this (by both mtime and ctime) is considered
    /// abandoned outright, regardless of liveness or target activity.
    pub immediate_stale_timeout: Duration,
    /// If the target file hasn't changed in this long, the holder is
    /// presumed stuck and the lock is reclaimed.
    pub stale_timeout: Duration,
}

impl Default for DotlockSettings {
    fn default() -> Self {
        Self {
            lock_suffix: ".lock".to_string(),
            immediate_stale_timeout: Duration::from_secs(2 * 60),
            stale_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Dotlock {
    lock_path: PathBuf,
}

struct TargetSnapshot {
    size: u64,
    mtime: i64,
    ctime: i64,
    observed_at: Instant,
}

impl Dotlock {
    /// Acquire the dotlock for `target`, retrying (with jitter) until
    /// `timeout` elapses.
    pub fn acquire(target: &Path, settings: &DotlockSettings, timeout: Duration) -> Result<Self, LockError> {
        let lock_path = lock_path_for(target, &settings.lock_suffix);
        let deadline = Instant::now() + timeout;
        let mut last_target = stat_target(target);

        loop {
            match try_create(&lock_path) {
                Ok(()) => return Ok(Dotlock { lock_path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&lock_path, target, settings, &mut last_target) {
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(LockError::Timeout(timeout));
                    }
                    let jitter = rand::thread_rng().gen_range(RANDOM_SLEEP_MIN_MS..=RANDOM_SLEEP_MAX_MS);
                    std::thread::sleep(Duration::from_millis(jitter));
                }
                Err(e) => return Err(LockError::Io(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for Dotlock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn lock_path_for(target: &Path, suffix: &str) -> PathBuf {
    let mut s = target.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Create `<path>.lock` by writing a uniquely-named temp file in the same
/// directory and `link`-ing it into place; `link` is atomic on POSIX so two
/// racing processes can never both believe they hold the lock.
fn try_create(lock_path: &Path) -> std::io::Result<()> {
    let dir = lock_path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let host = hostname();
    let rand_suffix: u64 = rand::thread_rng().gen();
    let temp_path = dir.join(format!(".dotlock.{}.{:016x}", pid, rand_suffix));

    {
        let mut f = File::options().write(true).create_new(true).open(&temp_path)?;
        writeln!(f, "{}:{}", pid, host)?;
    }

    let result = fs::hard_link(&temp_path, lock_path);
    let _ = fs::remove_file(&temp_path);
    result
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn read_lock_pid(lock_path: &Path) -> Option<(i32, String)> {
    let content = fs::read_to_string(lock_path).ok()?;
    let line = content.lines().next()?;
    let (pid_str, host) = line.split_once(':')?;
    let pid = pid_str.parse::<i32>().ok()?;
    Some((pid, host.to_string()))
}

fn stat_target(target: &Path) -> Option<TargetSnapshot> {
    let meta = fs::metadata(target).ok()?;
    Some(TargetSnapshot {
        size: meta.len(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
        observed_at: Instant::now(),
    })
}

fn is_stale(
    lock_path: &Path,
    target: &Path,
    settings: &DotlockSettings,
    last_target: &mut Option<TargetSnapshot>,
) -> bool {
    let meta = match fs::metadata(lock_path) {
        Ok(m) => m,
        Err(_) => return true, // already gone, treat as reclaimable
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let mtime = meta.mtime();
    let ctime = meta.ctime();
    let immediate = settings.immediate_stale_timeout.as_secs() as i64;
    if immediate != 0 && now > mtime + immediate && now > ctime + immediate {
        return true;
    }

    if let Some((pid, host)) = read_lock_pid(lock_path) {
        if host == hostname() {
            let alive = kill(Pid::from_raw(pid), None).is_ok();
            if !alive {
                return true;
            }
            if pid as u32 == std::process::id() {
                // stale lock left by a previous incarnation of ourselves
                return true;
            }
            // holder process is alive and foreign: fall through to the
            // target-activity check below rather than trusting liveness
            // alone forever.
        }
    }

    if settings.stale_timeout.is_zero() {
        return false;
    }

    let current = stat_target(target);
    let changed = match (&current, last_target.as_ref()) {
        (Some(cur), Some(prev)) => cur.size != prev.size || cur.mtime != prev.mtime || cur.ctime != prev.ctime,
        (Some(_), None) | (None, Some(_)) => true,
        (None, None) => false,
    };

    if changed || last_target.is_none() {
        *last_target = current.map(|s| TargetSnapshot {
            observed_at: Instant::now(),
            ..s
        });
        return false;
    }

    let since = last_target.as_ref().unwrap().observed_at.elapsed();
    since >= settings.stale_timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dovecot-uidlist");
        std::fs::write(&target, b"hello").unwrap();

        let settings = DotlockSettings::default();
        let lock = Dotlock::acquire(&target, &settings, Duration::from_secs(1)).unwrap();
        assert!(lock.path().exists());
        drop(lock);
        assert!(!lock_path_for(&target, &settings.lock_suffix).exists());
    }

    #[test]
    fn second_acquire_blocks_until_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dovecot-uidlist");
        std::fs::write(&target, b"hello").unwrap();
        let settings = DotlockSettings {
            immediate_stale_timeout: Duration::from_secs(3600),
            stale_timeout: Duration::from_secs(3600),
            ..Default::default()
        };

        let _first = Dotlock::acquire(&target, &settings, Duration::from_secs(1)).unwrap();
        let err = Dotlock::acquire(&target, &settings, Duration::from_millis(300));
        assert!(matches!(err, Err(LockError::Timeout(_))));
    }

    #[test]
    fn stale_lock_by_dead_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("dovecot-uidlist");
        std::fs::write(&target, b"hello").unwrap();
        let settings = DotlockSettings {
            immediate_stale_timeout: Duration::from_secs(3600),
            stale_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let lock_path = lock_path_for(&target, &settings.lock_suffix);

        // Simulate a lock file left behind by a pid that cannot possibly be alive.
        std::fs::write(&lock_path, format!("999999:{}\n", hostname())).unwrap();

        let lock = Dotlock::acquire(&target, &settings, Duration::from_secs(2)).unwrap();
        assert!(lock.path().exists());
    }
}
