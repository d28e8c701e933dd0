//! Buffers cache adds for the current transaction until commit or until
//! the buffer crosses `write_buffer_size`, then flushes them as chunks.

use std::collections::HashMap;

use crate::error::CacheError;
use crate::file::CacheFile;
use crate::record::FieldEntry;

const DEFAULT_WRITE_BUFFER_SIZE: usize = 32 * 1024;

pub struct CacheTransaction {
    file_seq_at_open: u32,
    pending: Vec<(u32, Vec<FieldEntry>)>,
    write_buffer_size: usize,
    buffered_bytes: usize,
    last_offset_for_uid: HashMap<u32, u32>,
}

impl CacheTransaction {
    pub fn new(cache_file: &CacheFile) -> Self {
        Self::with_buffer_size(cache_file, DEFAULT_WRITE_BUFFER_SIZE)
    }

    pub fn with_buffer_size(cache_file: &CacheFile, write_buffer_size: usize) -> Self {
        CacheTransaction {
            file_seq_at_open: cache_file.header().file_seq,
            pending: Vec::new(),
            write_buffer_size,
            buffered_bytes: 0,
            last_offset_for_uid: HashMap::new(),
        }
    }

    pub fn add(&mut self, uid: u32, entries: Vec<FieldEntry>) {
        self.buffered_bytes += entries.iter().map(|e| e.payload.len() + 8).sum::<usize>();
        self.pending.push((uid, entries));
    }

    pub fn should_flush(&self) -> bool {
        self.buffered_bytes >= self.write_buffer_size
    }

    /// Flush buffered adds as chunks. If the cache file has rotated
    /// (`file_seq` changed) since this transaction was opened, all
    /// previously reserved offsets are void and the buffered adds are
    /// dropped silently — cache data is non-authoritative by design, so
    /// losing it costs a future re-read, not correctness.
    pub fn flush(&mut self, cache_file: &mut CacheFile) -> Result<Vec<(u32, u32)>, CacheError> {
        if cache_file.header().file_seq != self.file_seq_at_open {
            tracing::debug!(
                old_seq = self.file_seq_at_open,
                new_seq = cache_file.header().file_seq,
                "cache file rotated under an open transaction; dropping buffered adds"
            );
            self.pending.clear();
            self.buffered_bytes = 0;
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(self.pending.len());
        for (uid, entries) in self.pending.drain(..) {
            let prev = self.last_offset_for_uid.get(&uid).copied().unwrap_or(0);
            let offset = cache_file.write_chunk(prev, entries)?;
            self.last_offset_for_uid.insert(uid, offset);
            results.push((uid, offset));
        }
        self.buffered_bytes = 0;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldMeta;

    #[test]
    fn flush_links_repeated_uid_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dovecot.index.cache");
        let mut cache = CacheFile::create(&path, 1).unwrap();
        cache.register_fields(&[FieldMeta::new("hdr.subject", 0, 1)]).unwrap();

        let mut txn = CacheTransaction::new(&cache);
        txn.add(
            100,
            vec![FieldEntry {
                file_field_id: 0,
                payload: b"first".to_vec(),
            }],
        );
        let first = txn.flush(&mut cache).unwrap();
        assert_eq!(first.len(), 1);

        txn.add(
            100,
            vec![FieldEntry {
                file_field_id: 0,
                payload: b"second".to_vec(),
            }],
        );
        let second = txn.flush(&mut cache).unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].1, first[0].1);

        let value = cache.lookup_field(second[0].1, 0).unwrap();
        assert_eq!(value, Some(b"second".to_vec()));
    }

    #[test]
    fn rotated_file_seq_drops_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dovecot.index.cache");
        let mut cache = CacheFile::create(&path, 1).unwrap();
        let mut txn = CacheTransaction::new(&cache);
        txn.add(1, vec![]);

        // Simulate a compression pass bumping file_seq underneath us.
        cache.header_mut_for_test().file_seq += 1;

        let flushed = txn.flush(&mut cache).unwrap();
        assert!(flushed.is_empty());
    }
}
