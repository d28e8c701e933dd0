#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock error: {0}")]
    Lock(#[from] midx_lock::LockError),
    #[error("cache file corrupted: {0}")]
    Corrupted(String),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("cache file is unusable (missing or empty header)")]
    Unusable,
}
