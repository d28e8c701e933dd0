//! Mailbox configuration, loaded from TOML the same way the teacher's own
//! `read_config`/`write_config` helpers do.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MailboxConfig {
    /// Directory holding `<prefix>`, `<prefix>.log`, `<prefix>.log.2`,
    /// `<prefix>.cache`.
    pub index_dir: PathBuf,
    /// File name prefix, e.g. `dovecot.index`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub locking: LockingConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub nfs: NfsConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LockingConfig {
    #[serde(with = "duration_secs", default = "default_fcntl_timeout")]
    pub fcntl_timeout: Duration,
    #[serde(with = "duration_secs", default = "default_dotlock_timeout")]
    pub dotlock_timeout: Duration,
    #[serde(with = "duration_secs", default = "default_immediate_stale_timeout")]
    pub immediate_stale_timeout: Duration,
    #[serde(with = "duration_secs", default = "default_stale_timeout")]
    pub stale_timeout: Duration,
}

impl Default for LockingConfig {
    fn default() -> Self {
        LockingConfig {
            fcntl_timeout: default_fcntl_timeout(),
            dotlock_timeout: default_dotlock_timeout(),
            immediate_stale_timeout: default_immediate_stale_timeout(),
            stale_timeout: default_stale_timeout(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_rotate_size")]
    pub log_rotate_size: u64,
    #[serde(with = "duration_secs", default = "default_log_rotate_min_created_ago")]
    pub log_rotate_min_created_ago: Duration,
    #[serde(default)]
    pub fsync: bool,
    #[serde(default)]
    pub avoid_flag_updates: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            log_rotate_size: default_log_rotate_size(),
            log_rotate_min_created_ago: default_log_rotate_min_created_ago(),
            fsync: true,
            avoid_flag_updates: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CacheConfig {
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NfsConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_prefix() -> String {
    "dovecot.index".to_string()
}
fn default_fcntl_timeout() -> Duration {
    midx_lock::DEFAULT_FCNTL_TIMEOUT
}
fn default_dotlock_timeout() -> Duration {
    midx_lock::DEFAULT_DOTLOCK_TIMEOUT
}
fn default_immediate_stale_timeout() -> Duration {
    Duration::from_secs(2 * 60)
}
fn default_stale_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_log_rotate_size() -> u64 {
    32 * 1024
}
fn default_log_rotate_min_created_ago() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_write_buffer_size() -> usize {
    32 * 1024
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl MailboxConfig {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        MailboxConfig {
            index_dir: index_dir.into(),
            prefix: default_prefix(),
            locking: LockingConfig::default(),
            log: LogConfig::default(),
            cache: CacheConfig::default(),
            nfs: NfsConfig::default(),
        }
    }

    pub fn stem(&self) -> PathBuf {
        self.index_dir.join(&self.prefix)
    }
}

pub fn read_config(config_file: &Path) -> Result<MailboxConfig> {
    let mut file = std::fs::OpenOptions::new().read(true).open(config_file)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    toml::from_str(&content).map_err(Error::Config)
}

pub fn write_config(config_file: &Path, config: &MailboxConfig) -> Result<()> {
    let serialized = toml::to_string_pretty(config).expect("MailboxConfig always serializes");
    let mut file = std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(config_file)?;
    file.write_all(serialized.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("mailbox.toml");
        let config = MailboxConfig::new(dir.path());
        write_config(&config_path, &config).unwrap();
        let loaded = read_config(&config_path).unwrap();
        assert_eq!(loaded.index_dir, config.index_dir);
        assert_eq!(loaded.prefix, config.prefix);
        assert_eq!(loaded.locking.fcntl_timeout, config.locking.fcntl_timeout);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("mailbox.toml");
        std::fs::write(&config_path, format!("index_dir = \"{}\"\n", dir.path().display())).unwrap();
        let loaded = read_config(&config_path).unwrap();
        assert_eq!(loaded.prefix, "dovecot.index");
        assert_eq!(loaded.log.log_rotate_size, default_log_rotate_size());
    }
}
