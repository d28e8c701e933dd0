//! The view/transaction API, sync engine and mailbox configuration that
//! tie the lower `midx-*` crates (lock, io, log, cache, index) into one
//! mailbox-shaped store. A caller opens an [`Index`], reads through a
//! [`View`], buffers mutations in a [`Transaction`], and drives
//! [`sync::sync_begin`] to replay the committed log into a consistent
//! snapshot — the same three-step shape the specification's §4.4 lays out.
//!
//! Backends (maildir/mbox/dbox-equivalents) are expected to implement
//! [`backend::Backend`] and drive a [`sync::SyncCtx`] to push each
//! `SyncRec` into their own storage.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod ext;
pub mod index;
pub mod keywords;
pub mod layout;
pub mod snapshot;
pub mod sync;
pub mod transaction;
pub mod view;

pub use cache::{cache_add, cache_lookup_field, CacheTransaction, FieldEntry, FieldMeta, CACHE_OFFSET_EXT_NAME};
pub use config::{read_config, write_config, MailboxConfig};
pub use error::{Error, Result};
pub use ext::ExtId;
pub use index::Index;
pub use keywords::{Keywords, KeywordsHandle};
pub use snapshot::Snapshot;
pub use sync::{sync_begin, SyncCtx, SyncFlags, SyncOutcome, SyncRec};
pub use transaction::{FlagModify, Transaction, TransactionFlags, TransactionView};
pub use view::View;

pub use midx_log::KeywordModify;
