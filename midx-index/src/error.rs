#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("main index corrupted: {0}")]
    Corrupted(String),
    #[error("seq {seq} out of range (messages_count={count})")]
    SeqOutOfRange { seq: u32, count: u32 },
}
