//! `Snapshot`: the in-memory materialisation a [`crate::view::View`] reads
//! through. Cloning a `Snapshot` handle is cheap (it's an `Arc`), the same
//! "clone is cheap, don't hesitate" contract the teacher's `UidIndex`
//! (built on `im::OrdMap`) gives its callers — here the immutability comes
//! from never mutating a `Snapshot` in place, only building a new one and
//! swapping the `Arc` (see `Index::replace_snapshot`).

use std::collections::HashMap;

use midx_index::{IndexHeader, IndexRecord};

use crate::error::{Error, Result};
use crate::ext::ExtRegistry;
use crate::keywords::Keywords;

#[derive(Clone)]
pub struct Snapshot {
    pub header: IndexHeader,
    /// UID-ascending, matching the main index's on-disk invariant.
    pub records: Vec<IndexRecord>,
    pub keywords: Keywords,
    pub ext_registry: ExtRegistry,
    pub ext_header_data: HashMap<u32, Vec<u8>>,
    pub ext_record_data: HashMap<u32, HashMap<u32, Vec<u8>>>,
    /// The transaction log position this snapshot reflects.
    pub log_seq: u32,
    pub log_offset: u64,
}

impl Snapshot {
    pub fn messages_count(&self) -> u32 {
        self.header.messages_count
    }

    pub fn uid_validity(&self) -> u32 {
        self.header.uid_validity
    }

    pub fn next_uid(&self) -> u32 {
        self.header.next_uid
    }

    /// `lookup(seq) -> Option<&Record>`, 1-based.
    pub fn lookup(&self, seq: u32) -> Option<&IndexRecord> {
        if seq == 0 {
            return None;
        }
        self.records.get(seq as usize - 1)
    }

    pub fn lookup_uid(&self, seq: u32) -> Option<u32> {
        self.lookup(seq).map(|r| r.uid)
    }

    pub fn seq_of_uid(&self, uid: u32) -> Option<u32> {
        self.records.binary_search_by_key(&uid, |r| r.uid).ok().map(|i| i as u32 + 1)
    }

    /// `lookup_uid_range(uid1, uid2) -> (seq1, seq2)`; an empty range is
    /// reported as `(1, 0)`, matching the source's "no records" encoding.
    pub fn lookup_uid_range(&self, uid1: u32, uid2: u32) -> (u32, u32) {
        if uid1 > uid2 || self.records.is_empty() {
            return (1, 0);
        }
        let lower = self.records.partition_point(|r| r.uid < uid1);
        let upper = self.records.partition_point(|r| r.uid <= uid2);
        if lower >= upper {
            (1, 0)
        } else {
            (lower as u32 + 1, upper as u32)
        }
    }

    /// `lookup_first(flags, mask) -> Option<Seq>`: linear scan, same as the
    /// source (there's no secondary index on flags).
    pub fn lookup_first(&self, flags: u8, mask: u8) -> Option<u32> {
        self.records.iter().position(|r| r.flags & mask == flags).map(|i| i as u32 + 1)
    }

    pub fn ext_record(&self, ext_id: u32, uid: u32) -> Option<&[u8]> {
        self.ext_record_data.get(&ext_id)?.get(&uid).map(|v| v.as_slice())
    }

    pub fn ext_header(&self, ext_id: u32) -> Option<&[u8]> {
        self.ext_header_data.get(&ext_id).map(|v| v.as_slice())
    }

    pub fn check_uid_monotonicity(&self) -> Result<()> {
        for w in self.records.windows(2) {
            if w[0].uid >= w[1].uid {
                return Err(Error::NeedsFsck(format!("UIDs out of order: {} >= {}", w[0].uid, w[1].uid)));
            }
        }
        if let Some(last) = self.records.last() {
            if last.uid >= self.header.next_uid {
                return Err(Error::NeedsFsck(format!(
                    "next_uid {} not past highest UID {}",
                    self.header.next_uid, last.uid
                )));
            }
        }
        Ok(())
    }
}
