//! `IndexMap`: a read-side object owning either an mmap region or a heap
//! copy of the whole index file, plus the parsed header and typed access
//! to the record array.

use std::fs::File;

use midx_io::MappedFile;

use crate::error::IndexError;
use crate::header::IndexHeader;
use crate::record::IndexRecord;

pub struct IndexMap {
    mapped: MappedFile,
    header: IndexHeader,
}

impl IndexMap {
    pub fn open_mmap(file: &File) -> Result<Self, IndexError> {
        let mapped = MappedFile::open_mmap(file)?;
        let header = IndexHeader::decode(mapped.as_slice())?;
        let map = IndexMap { mapped, header };
        map.check_file_invariants()?;
        Ok(map)
    }

    pub fn open_heap(file: &mut File) -> Result<Self, IndexError> {
        let mapped = MappedFile::open_heap(file)?;
        let header = IndexHeader::decode(mapped.as_slice())?;
        let map = IndexMap { mapped, header };
        map.check_file_invariants()?;
        Ok(map)
    }

    /// §4.2: the file must be an integral number of `record_size` chunks
    /// past `header_size`, and the header's own `messages_count` must agree
    /// with how many chunks are actually there — otherwise a corrupted
    /// counter would have every record lookup read (or slice) past the end
    /// of the file instead of being caught here.
    fn check_file_invariants(&self) -> Result<(), IndexError> {
        let body = self.mapped.len().saturating_sub(self.header.header_size as usize);
        if self.header.record_size == 0 || body % self.header.record_size as usize != 0 {
            return Err(IndexError::Corrupted(format!(
                "file size {} not header_size + N*record_size ({}, {})",
                self.mapped.len(),
                self.header.header_size,
                self.header.record_size
            )));
        }
        let record_count = body / self.header.record_size as usize;
        if record_count != self.header.messages_count as usize {
            return Err(IndexError::Corrupted(format!(
                "header messages_count {} does not match {} records on disk",
                self.header.messages_count, record_count
            )));
        }
        Ok(())
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn get_messages_count(&self) -> u32 {
        self.header.messages_count
    }

    fn record_bytes(&self, seq: u32) -> Option<&[u8]> {
        if seq == 0 || seq > self.header.messages_count {
            return None;
        }
        let start = self.header.header_size as usize + (seq as usize - 1) * self.header.record_size as usize;
        let end = start + self.header.record_size as usize;
        self.mapped.as_slice().get(start..end)
    }

    /// `lookup(seq) -> record`
    pub fn lookup(&self, seq: u32) -> Result<IndexRecord, IndexError> {
        let bytes = self.record_bytes(seq).ok_or(IndexError::SeqOutOfRange {
            seq,
            count: self.header.messages_count,
        })?;
        IndexRecord::decode(bytes, self.header.keywords_mask_size)
    }

    /// `lookup_uid(seq) -> uid`
    pub fn lookup_uid(&self, seq: u32) -> Result<u32, IndexError> {
        Ok(self.lookup(seq)?.uid)
    }

    /// `lookup_uid_range(uid1, uid2) -> (seq1, seq2)` via binary search;
    /// returns `(1, 0)` (empty range) if no record falls in `[uid1, uid2]`.
    pub fn lookup_uid_range(&self, uid1: u32, uid2: u32) -> Result<(u32, u32), IndexError> {
        let count = self.header.messages_count;
        if count == 0 || uid1 > uid2 {
            return Ok((1, 0));
        }

        let lower = self.partition_point(|uid| uid < uid1);
        let upper = self.partition_point(|uid| uid <= uid2);

        if lower >= upper {
            Ok((1, 0))
        } else {
            Ok((lower + 1, upper))
        }
    }

    /// Smallest seq (0-based) for which `pred(uid_at_seq)` is false, i.e.
    /// the standard `partition_point` binary search over UID-ascending
    /// records.
    fn partition_point(&self, pred: impl Fn(u32) -> bool) -> u32 {
        let count = self.header.messages_count;
        let mut lo = 0u32;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let uid = self.lookup_uid(mid + 1).expect("mid within [0, count)");
            if pred(uid) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// `lookup_first(flags, mask) -> seq`: first record whose
    /// `flags & mask == flags`. Linear scan; the source does the same
    /// (there's no secondary index on flags).
    pub fn lookup_first(&self, flags: u8, mask: u8) -> Result<Option<u32>, IndexError> {
        for seq in 1..=self.header.messages_count {
            let rec = self.lookup(seq)?;
            if rec.flags & mask == flags {
                return Ok(Some(seq));
            }
        }
        Ok(None)
    }

    /// Grow the backing storage to hold `additional` more records, via
    /// `file_set_size` + remap (mmap) or buffer extension (heap).
    pub fn grow(&mut self, file: &File, additional: u32) -> Result<(), IndexError> {
        let new_body = (self.header.messages_count + additional) as u64 * self.header.record_size as u64;
        let new_len = self.header.header_size as u64 + new_body;
        self.mapped.grow(file, new_len)?;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        self.mapped.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.mapped.as_mut_slice()
    }

    pub fn flush(&self) -> Result<(), IndexError> {
        Ok(self.mapped.flush()?)
    }

    pub fn set_header(&mut self, header: IndexHeader) {
        self.header = header;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::IndexHeader;
    use crate::record::IndexRecord;
    use std::io::Write;

    fn build_index(uids: &[u32]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dovecot.index");
        let mut hdr = IndexHeader::new(1, 0);
        hdr.messages_count = uids.len() as u32;
        hdr.next_uid = uids.iter().copied().max().unwrap_or(0) + 1;
        let mut buf = hdr.encode();
        for &uid in uids {
            let rec = IndexRecord {
                uid,
                flags: 0,
                keywords: vec![],
            };
            let mut rec_buf = vec![0u8; hdr.record_size as usize];
            rec.encode(hdr.record_size, &mut rec_buf).unwrap();
            buf.extend_from_slice(&rec_buf);
        }
        let mut f = File::create(&path).unwrap();
        f.write_all(&buf).unwrap();
        (dir, path)
    }

    #[test]
    fn lookup_and_uid_range() {
        let (_dir, path) = build_index(&[10, 20, 30, 40, 50]);
        let file = File::options().read(true).write(true).open(&path).unwrap();
        let map = IndexMap::open_mmap(&file).unwrap();

        assert_eq!(map.lookup_uid(1).unwrap(), 10);
        assert_eq!(map.lookup_uid(5).unwrap(), 50);
        assert_eq!(map.lookup_uid_range(20, 40).unwrap(), (2, 4));
        assert_eq!(map.lookup_uid_range(21, 29).unwrap(), (1, 0));
        assert_eq!(map.lookup_uid_range(0, 100).unwrap(), (1, 5));
    }

    #[test]
    fn lookup_first_matching_flags() {
        let (_dir, path) = build_index(&[1, 2, 3]);
        let file = File::options().read(true).write(true).open(&path).unwrap();
        let mut map = IndexMap::open_mmap(&file).unwrap();
        // hand-set flags on seq 2 to Seen
        {
            let hdr = *map.header();
            let start = hdr.header_size as usize + (2 - 1) * hdr.record_size as usize;
            map.as_mut_slice()[start + 4] = 0x08;
        }
        let seq = map.lookup_first(0x08, 0x08).unwrap();
        assert_eq!(seq, Some(2));
    }

    #[test]
    fn rejects_non_stride_aligned_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.index");
        let hdr = IndexHeader::new(1, 0);
        let mut buf = hdr.encode();
        buf.push(0); // one stray byte, not a full record
        let mut f = File::create(&path).unwrap();
        f.write_all(&buf).unwrap();
        let file = File::options().read(true).write(true).open(&path).unwrap();
        assert!(IndexMap::open_mmap(&file).is_err());
    }
}
