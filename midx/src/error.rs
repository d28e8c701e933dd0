#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Lock(#[from] midx_lock::LockError),
    #[error(transparent)]
    Log(#[from] midx_log::LogError),
    #[error(transparent)]
    Cache(#[from] midx_cache::CacheError),
    #[error(transparent)]
    Index(#[from] midx_index::IndexError),
    #[error("mailbox busy: {0}")]
    Busy(String),
    #[error("index is corrupted and needs fsck: {0}")]
    NeedsFsck(String),
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
