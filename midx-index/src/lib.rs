//! The main index: a fixed-stride, UID-keyed record array plus a compact
//! header of mailbox-wide counters. This crate owns only the on-disk
//! layout and read-side lookups; replay from the transaction log and the
//! view/transaction API live in `midx`.

pub mod error;
pub mod flags;
pub mod header;
pub mod map;
pub mod record;

pub use error::IndexError;
pub use flags::{clear_flag, has_flag, set_flag, Flag, ALL_PERSISTENT_FLAGS};
pub use header::IndexHeader;
pub use map::IndexMap;
pub use record::IndexRecord;
