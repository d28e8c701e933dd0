//! The transaction log: the append-only, replayable mutation stream that
//! the main index is a materialised view of.

pub mod error;
pub mod file;
pub mod header;
pub mod record;

pub use error::LogError;
pub use file::{LogFile, ReadRecord, RotateConfig};
pub use header::LogHeader;
pub use record::{AppendRecord, ExtRecUpdate, FlagUpdate, KeywordModify, LogRecord, RecordType, UidRange};
