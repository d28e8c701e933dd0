//! `View`: an immutable snapshot anchored at a particular `(log_seq,
//! log_offset)`, the read side of the API. All lookups are O(1) or O(log n)
//! against the underlying [`Snapshot`]; nothing here touches disk.

use std::sync::Arc;

use midx_index::IndexRecord;

use crate::error::Result;
use crate::index::Index;
use crate::snapshot::Snapshot;

#[derive(Clone)]
pub struct View {
    snapshot: Arc<Snapshot>,
}

impl View {
    /// Anchor a view at the index's current snapshot. Does not sync; call
    /// `sync::sync_begin` first if the caller needs up-to-date state.
    pub fn open(index: &Index) -> Result<Self> {
        Ok(View {
            snapshot: index.current_snapshot(),
        })
    }

    pub(crate) fn from_snapshot(snapshot: Arc<Snapshot>) -> Self {
        View { snapshot }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn messages_count(&self) -> u32 {
        self.snapshot.messages_count()
    }

    pub fn uid_validity(&self) -> u32 {
        self.snapshot.uid_validity()
    }

    pub fn next_uid(&self) -> u32 {
        self.snapshot.next_uid()
    }

    pub fn lookup(&self, seq: u32) -> Option<&IndexRecord> {
        self.snapshot.lookup(seq)
    }

    pub fn lookup_uid(&self, seq: u32) -> Option<u32> {
        self.snapshot.lookup_uid(seq)
    }

    pub fn seq_of_uid(&self, uid: u32) -> Option<u32> {
        self.snapshot.seq_of_uid(uid)
    }

    pub fn lookup_uid_range(&self, uid1: u32, uid2: u32) -> (u32, u32) {
        self.snapshot.lookup_uid_range(uid1, uid2)
    }

    pub fn lookup_first(&self, flags: u8, mask: u8) -> Option<u32> {
        self.snapshot.lookup_first(flags, mask)
    }

    pub fn keyword_names(&self) -> &[String] {
        self.snapshot.keywords.names()
    }

    /// Resolve `seq`'s keyword bitmap into the set of names it has set.
    pub fn keywords_of(&self, seq: u32) -> Vec<String> {
        let Some(record) = self.lookup(seq) else {
            return Vec::new();
        };
        self.snapshot
            .keywords
            .names()
            .iter()
            .enumerate()
            .filter(|(i, _)| crate::keywords::Keywords::bit_is_set(&record.keywords, *i))
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn ext_record(&self, ext_id: u32, uid: u32) -> Option<&[u8]> {
        self.snapshot.ext_record(ext_id, uid)
    }

    pub fn ext_header(&self, ext_id: u32) -> Option<&[u8]> {
        self.snapshot.ext_header(ext_id)
    }
}
