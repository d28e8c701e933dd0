//! The write side of the API: a `Transaction` buffers mutations against a
//! base [`View`] and serialises them into log records on `commit`. No I/O
//! happens until then, mirroring the teacher's pattern of buffering a whole
//! IMAP command's side effects before a single `Bayou::sync` flush
//! (`aero-bayou/src/lib.rs`, generalised here from an object-storage append
//! log to the local transaction log in `midx-log`).

use std::collections::HashMap;
use std::sync::Arc;

use midx_log::{AppendRecord, ExtRecUpdate, FlagUpdate, KeywordModify, LogRecord, UidRange};

use crate::error::Result;
use crate::ext::ExtId;
use crate::index::Index;
use crate::snapshot::Snapshot;
use crate::view::View;

/// `EXTERNAL`: the backend already applied these mutations to its own
/// storage, so sync must not push them there again. `AVOID_FLAG_UPDATES`:
/// sync will not synthesise dirty-flag updates for this transaction's
/// effects. `HIDE`: invisible to views opened by the same process until the
/// next sync, so backend housekeeping doesn't perturb an active session's
/// sequence numbers.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransactionFlags {
    pub external: bool,
    pub avoid_flag_updates: bool,
    pub hide: bool,
}

/// §4.6's three-way `modify_type` for `update_flags`. The wire-level
/// `FlagUpdate` record only ever carries `add_flags`/`remove_flags` (§4.3's
/// "OR-add then AND-mask" replay rule), but that pair is already expressive
/// enough to encode `Replace` without a new record variant: setting
/// `add_flags = flags` and `remove_flags = !flags` makes every bit in
/// `flags` end up set and every other bit end up clear, regardless of what
/// the record held before — `(cur | flags) & !(!flags) == flags`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagModify {
    Add,
    Remove,
    Replace,
}

/// A tentatively-allocated append, visible to this transaction's own
/// `TransactionView` before commit.
struct PendingAppend {
    uid: u32,
    flags: u8,
    keywords: Vec<u8>,
}

pub struct Transaction {
    base: Arc<Snapshot>,
    flags: TransactionFlags,
    next_append_uid: u32,
    appends: Vec<PendingAppend>,
    expunges: Vec<UidRange>,
    flag_updates: Vec<FlagUpdate>,
    keyword_updates: Vec<(KeywordModify, String, Vec<UidRange>)>,
    keyword_resets: Vec<UidRange>,
    header_updates: Vec<(u32, Vec<u8>)>,
    ext_hdr_updates: Vec<(ExtId, u32, Vec<u8>)>,
    ext_rec_updates: HashMap<(ExtId, u32), Vec<u8>>,
}

impl Transaction {
    pub fn new(view: &View, flags: TransactionFlags) -> Self {
        let base = view.snapshot().clone();
        let next_append_uid = base.next_uid();
        Transaction {
            base,
            flags,
            next_append_uid,
            appends: Vec::new(),
            expunges: Vec::new(),
            flag_updates: Vec::new(),
            keyword_updates: Vec::new(),
            keyword_resets: Vec::new(),
            header_updates: Vec::new(),
            ext_hdr_updates: Vec::new(),
            ext_rec_updates: HashMap::new(),
        }
    }

    /// Buffer a new message. Returns the tentatively-allocated UID; the
    /// corresponding seq is only stable once viewed through
    /// `TransactionView`/after a sync picks the append up.
    pub fn append(&mut self, flags: u8) -> u32 {
        let uid = self.next_append_uid;
        self.next_append_uid += 1;
        self.appends.push(PendingAppend {
            uid,
            flags,
            keywords: Vec::new(),
        });
        uid
    }

    /// §4.6/§4.7 document `expunge(seq)` etc. against whatever a range of
    /// sequence numbers resolves to in this transaction's base view; the log
    /// itself only ever stores UID ranges (seq is never persistent), so every
    /// seq-taking entry point below resolves through this helper before
    /// buffering anything. A seq outside the base view's current record
    /// count (stale caller, or a seq minted by this same uncommitted
    /// transaction's own pending appends) resolves to `None` and the whole
    /// call is silently dropped, the same "nothing to apply" contract the
    /// cache's rotated-file-seq path already uses.
    fn uid_range_for_seqs(&self, seq1: u32, seq2: u32) -> Option<UidRange> {
        let uid1 = self.base.lookup_uid(seq1)?;
        let uid2 = self.base.lookup_uid(seq2)?;
        Some(UidRange { uid1, uid2 })
    }

    pub fn expunge(&mut self, seq1: u32, seq2: u32) {
        if let Some(range) = self.uid_range_for_seqs(seq1, seq2) {
            self.expunges.push(range);
        }
    }

    pub fn update_flags(&mut self, seq1: u32, seq2: u32, modify: FlagModify, flags: u8) {
        let (add_flags, remove_flags) = match modify {
            FlagModify::Add => (flags, 0),
            FlagModify::Remove => (0, flags),
            FlagModify::Replace => (flags, !flags),
        };
        if let Some(range) = self.uid_range_for_seqs(seq1, seq2) {
            self.flag_updates.push(FlagUpdate {
                uid1: range.uid1,
                uid2: range.uid2,
                add_flags,
                remove_flags,
            });
        }
    }

    pub fn update_keywords(&mut self, modify: KeywordModify, name: &str, seq1: u32, seq2: u32) {
        if let Some(range) = self.uid_range_for_seqs(seq1, seq2) {
            self.keyword_updates.push((modify, name.to_string(), vec![range]));
        }
    }

    pub fn reset_keywords(&mut self, seq1: u32, seq2: u32) {
        if let Some(range) = self.uid_range_for_seqs(seq1, seq2) {
            self.keyword_resets.push(range);
        }
    }

    pub fn update_header(&mut self, offset: u32, data: Vec<u8>) {
        self.header_updates.push((offset, data));
    }

    pub fn update_ext_header(&mut self, ext_id: ExtId, offset: u32, data: Vec<u8>) {
        self.ext_hdr_updates.push((ext_id, offset, data));
    }

    /// `update_ext(seq, ext_id, data) -> Option<Vec<u8>>`: buffer a
    /// per-record extension write, returning whatever this transaction had
    /// already buffered for the same `(ext_id, uid)` pair, if anything. A
    /// `seq` outside the base view resolves to nothing pending and `None`.
    pub fn update_ext_record(&mut self, ext_id: ExtId, seq: u32, data: Vec<u8>) -> Option<Vec<u8>> {
        let uid = self.base.lookup_uid(seq)?;
        self.ext_rec_updates.insert((ext_id, uid), data)
    }

    pub fn is_empty(&self) -> bool {
        self.appends.is_empty()
            && self.expunges.is_empty()
            && self.flag_updates.is_empty()
            && self.keyword_updates.is_empty()
            && self.keyword_resets.is_empty()
            && self.header_updates.is_empty()
            && self.ext_hdr_updates.is_empty()
            && self.ext_rec_updates.is_empty()
    }

    /// Serialise the buffered mutations into log records and append them.
    /// Returns `(file_seq, tail_offset)` past the last record written, for
    /// the caller to use as a durability watermark. Does not touch the
    /// index's in-memory snapshot — that only advances through `sync`.
    pub fn commit(self, index: &Index) -> Result<(u32, u64)> {
        if self.is_empty() {
            let state = index.state.lock().expect("index mutex poisoned");
            return Ok((state.log.header().file_seq, state.log.size()?));
        }

        let records = self.into_log_records();
        let mut state = index.state.lock().expect("index mutex poisoned");
        Index::append_log(&mut state, &records)
    }

    pub fn rollback(self) {
        // Buffers simply drop; nothing was ever written.
    }

    fn into_log_records(self) -> Vec<(LogRecord, bool)> {
        let external = self.flags.external;
        let mut out = Vec::new();

        if !self.appends.is_empty() {
            out.push((
                LogRecord::Append {
                    records: self
                        .appends
                        .into_iter()
                        .map(|a| AppendRecord {
                            uid: a.uid,
                            flags: a.flags,
                            keywords: a.keywords,
                        })
                        .collect(),
                },
                external,
            ));
        }
        if !self.expunges.is_empty() {
            out.push((LogRecord::Expunge { ranges: self.expunges }, external));
        }
        if !self.flag_updates.is_empty() {
            out.push((LogRecord::FlagUpdate { updates: self.flag_updates }, external));
        }
        for (modify, name, ranges) in self.keyword_updates {
            out.push((LogRecord::KeywordUpdate { modify, name, ranges }, external));
        }
        if !self.keyword_resets.is_empty() {
            out.push((LogRecord::KeywordReset { ranges: self.keyword_resets }, external));
        }
        for (offset, data) in self.header_updates {
            out.push((LogRecord::HeaderUpdate { offset, data }, external));
        }
        for (ext_id, offset, data) in self.ext_hdr_updates {
            out.push((LogRecord::ExtHdrUpdate { ext_id, offset, data }, external));
        }
        if !self.ext_rec_updates.is_empty() {
            let updates = self
                .ext_rec_updates
                .into_iter()
                .map(|((ext_id, uid), payload)| ExtRecUpdate { ext_id, uid, payload })
                .collect();
            out.push((LogRecord::ExtRecUpdate { updates }, external));
        }

        out
    }
}

/// Overlays this transaction's own pending appends and flag changes on top
/// of its base view, so an in-flight command handler can see the results of
/// its own buffered mutations before they're ever durable.
pub struct TransactionView<'t> {
    txn: &'t Transaction,
}

impl<'t> TransactionView<'t> {
    pub fn new(txn: &'t Transaction) -> Self {
        TransactionView { txn }
    }

    pub fn base_messages_count(&self) -> u32 {
        self.txn.base.messages_count()
    }

    /// Sequence numbers for records appended by this (not yet committed)
    /// transaction, counting on from the base view's message count.
    pub fn pending_append_uids(&self) -> Vec<u32> {
        self.txn.appends.iter().map(|a| a.uid).collect()
    }

    pub fn pending_flag_update_for(&self, uid: u32) -> Option<(u8, u8)> {
        self.txn
            .flag_updates
            .iter()
            .rev()
            .find(|u| uid >= u.uid1 && uid <= u.uid2)
            .map(|u| (u.add_flags, u.remove_flags))
    }
}
