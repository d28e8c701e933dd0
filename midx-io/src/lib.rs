//! Low-level file plumbing shared by the main index, transaction log and
//! cache file formats: the escaped-uint32 wire encoding, a mmap-or-heap
//! file mapping, and NFS workarounds.

pub mod escaped;
pub mod mapped;
pub mod nfs;

pub use escaped::{offset_to_uint32, uint32_to_offset};
pub use mapped::MappedFile;
pub use nfs::NfsPolicy;

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file too short: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
}
