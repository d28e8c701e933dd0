#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock error: {0}")]
    Lock(#[from] midx_lock::LockError),
    #[error("corrupted transaction log: {0}")]
    Corrupted(String),
    #[error("log record truncated: wanted {wanted} bytes, had {have}")]
    Truncated { wanted: usize, have: usize },
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),
}
