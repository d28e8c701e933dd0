//! The cache file itself: header, field chain, record storage, and the
//! transaction/compression machinery built on top of them.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use midx_lock::fcntl::FcntlGuard;
use midx_lock::LockKind;

use crate::error::CacheError;
use crate::field::{Decision, FieldHeaderNode, FieldMeta, FieldRegistry};
use crate::header::{CacheHeader, GROW_PERCENTAGE, HEADER_SIZE};
use crate::record::{CacheRecord, FieldEntry, Hole, MIN_HOLE_RECORD_SIZE};

pub struct CacheFile {
    path: PathBuf,
    file: File,
    header: CacheHeader,
    fields: FieldRegistry,
    records_count: u32,
}

impl CacheFile {
    pub fn create(path: &Path, indexid: u32) -> Result<Self, CacheError> {
        let header = CacheHeader::new(indexid, 1);
        let mut file = OpenOptions::new().read(true).write(true).create_new(true).open(path)?;
        file.write_all(&header.encode())?;
        file.sync_all()?;
        Ok(CacheFile {
            path: path.to_path_buf(),
            file,
            header,
            fields: FieldRegistry::default(),
            records_count: 0,
        })
    }

    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut hdr_buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut hdr_buf)?;
        let header = CacheHeader::decode(&hdr_buf)?;

        let mut fields = FieldRegistry::default();
        if !header.is_unusable() && header.field_header_offset != 0 {
            let mut offset = header.field_header_offset;
            loop {
                // Field names are variable-length, so the node's exact
                // byte length isn't known up front: read everything from
                // this offset to EOF and let decode report how much of it
                // it actually consumed.
                file.seek(SeekFrom::Start(offset as u64))?;
                let remaining = file.metadata()?.len().saturating_sub(offset as u64);
                let mut node_buf = vec![0u8; remaining as usize];
                file.read_exact(&mut node_buf)?;
                let (node, _consumed) = FieldHeaderNode::decode(&node_buf)?;
                for f in node.fields {
                    if fields.find(&f.name).is_none() {
                        fields.fields.push(f);
                    }
                }
                if node.next_offset == 0 {
                    break;
                }
                offset = node.next_offset;
            }
        }

        Ok(CacheFile {
            path: path.to_path_buf(),
            file,
            header,
            fields,
            records_count: 0,
        })
    }

    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    #[cfg(test)]
    pub fn header_mut_for_test(&mut self) -> &mut CacheHeader {
        &mut self.header
    }

    pub fn fields(&self) -> &FieldRegistry {
        &self.fields
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_unusable(&self) -> bool {
        self.header.is_unusable()
    }

    /// Find-or-append fields, publishing an updated field header chain.
    /// The new node is written and `fdatasync`'ed before the previous
    /// node's `next_offset` (or the file header, for the first node) is
    /// patched, so a crash mid-write never makes a reader see a dangling
    /// link.
    pub fn register_fields(&mut self, new_fields: &[FieldMeta]) -> Result<Vec<u32>, CacheError> {
        let to_add: Vec<FieldMeta> = new_fields
            .iter()
            .filter(|f| self.fields.find(&f.name).is_none())
            .cloned()
            .collect();

        if to_add.is_empty() {
            return Ok(self.fields.register(new_fields));
        }

        let _guard = FcntlGuard::acquire(&self.file, LockKind::Write, Duration::from_secs(60))?;

        let node = FieldHeaderNode {
            fields: to_add.clone(),
            next_offset: 0,
        };
        let encoded = node.encode();
        let write_offset = self.reserve_tail(encoded.len() as u32)?;
        self.file.seek(SeekFrom::Start(write_offset as u64))?;
        self.file.write_all(&encoded)?;
        self.file.sync_data()?;

        self.header.field_header_offset = write_offset;
        self.persist_header()?;

        Ok(self.fields.register(&to_add))
    }

    fn persist_header(&mut self) -> Result<(), CacheError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Grow the file by `max(needed, used_file_size * GROW_PERCENTAGE%)`
    /// and return the offset reserved for the caller.
    fn reserve_tail(&mut self, needed: u32) -> Result<u32, CacheError> {
        let grow_by = needed.max(self.header.used_file_size * GROW_PERCENTAGE / 100).max(needed);
        let offset = self.header.used_file_size;
        let new_size = offset as u64 + grow_by as u64;
        self.file.set_len(new_size)?;
        self.header.used_file_size = offset + grow_by;
        Ok(offset)
    }

    /// Best-fit search over the hole chain; falls back to the tail.
    fn reserve_space(&mut self, needed: u32) -> Result<u32, CacheError> {
        let mut best: Option<(u32, Hole, u32 /* prev offset, 0 = header */)> = None;
        let mut offset = self.header.hole_offset;
        let mut prev = 0u32;
        while offset != 0 {
            self.file.seek(SeekFrom::Start(offset as u64))?;
            let mut buf = [0u8; MIN_HOLE_RECORD_SIZE];
            self.file.read_exact(&mut buf)?;
            let hole = Hole::decode(&buf)?;
            if hole.size >= needed && best.as_ref().map(|(_, b, _)| hole.size < b.1.size).unwrap_or(true) {
                best = Some((offset, hole, prev));
            }
            prev = offset;
            offset = hole.next_offset;
        }

        if let Some((hole_offset, hole, prev_offset)) = best {
            self.unlink_hole(prev_offset, hole.next_offset)?;
            self.header.deleted_space = self.header.deleted_space.saturating_sub(hole.size);
            if hole.size > needed + MIN_HOLE_RECORD_SIZE as u32 {
                let remainder_offset = hole_offset + needed;
                let remainder = Hole {
                    next_offset: self.header.hole_offset,
                    size: hole.size - needed,
                };
                self.file.seek(SeekFrom::Start(remainder_offset as u64))?;
                self.file.write_all(&remainder.encode())?;
                self.header.hole_offset = remainder_offset;
                self.header.deleted_space += remainder.size;
            }
            return Ok(hole_offset);
        }

        self.reserve_tail(needed)
    }

    fn unlink_hole(&mut self, prev_offset: u32, next: u32) -> Result<(), CacheError> {
        if prev_offset == 0 {
            self.header.hole_offset = next;
        } else {
            self.file.seek(SeekFrom::Start(prev_offset as u64))?;
            let mut buf = [0u8; MIN_HOLE_RECORD_SIZE];
            self.file.read_exact(&mut buf)?;
            let mut hole = Hole::decode(&buf)?;
            hole.next_offset = next;
            self.file.seek(SeekFrom::Start(prev_offset as u64))?;
            self.file.write_all(&hole.encode())?;
        }
        Ok(())
    }

    fn is_variable(&self, id: u32) -> bool {
        self.fields.get(id).map(|f| f.size == 0).unwrap_or(true)
    }

    fn fixed_size(&self, id: u32) -> u32 {
        self.fields.get(id).map(|f| f.size).unwrap_or(0)
    }

    /// Write one chunk for a UID, linking it to `prev_offset` (0 if this is
    /// the UID's first chunk). Returns the new chunk's offset.
    pub fn write_chunk(&mut self, prev_offset: u32, entries: Vec<FieldEntry>) -> Result<u32, CacheError> {
        let _guard = FcntlGuard::acquire(&self.file, LockKind::Write, Duration::from_secs(60))?;
        let record = CacheRecord { prev_offset, entries };
        let is_variable = |id| self.is_variable(id);
        let encoded = record.encode(is_variable);
        let offset = self.reserve_space(encoded.len() as u32)?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(&encoded)?;
        if prev_offset != 0 {
            self.records_count += 0; // continuation, not a new logical record
            self.header.continued_record_count += 1;
        } else {
            self.records_count += 1;
        }
        self.persist_header()?;
        Ok(offset)
    }

    /// Walk the chunk chain for a UID's cache offset looking for `field_id`,
    /// most recent chunk first.
    pub fn lookup_field(&mut self, mut chunk_offset: u32, field_id: u32) -> Result<Option<Vec<u8>>, CacheError> {
        while chunk_offset != 0 {
            self.file.seek(SeekFrom::Start(chunk_offset as u64))?;
            let mut len_prefix = [0u8; 8];
            self.file.read_exact(&mut len_prefix)?;
            let size = u32::from_le_bytes(len_prefix[4..8].try_into().unwrap());
            let mut buf = vec![0u8; size as usize];
            self.file.seek(SeekFrom::Start(chunk_offset as u64))?;
            self.file.read_exact(&mut buf)?;
            let record = CacheRecord::decode(&buf, |id| self.is_variable(id), |id| self.fixed_size(id))?;
            if let Some(e) = record.entries.iter().find(|e| e.file_field_id == field_id) {
                return Ok(Some(e.payload.clone()));
            }
            chunk_offset = record.prev_offset;
        }
        Ok(None)
    }

    pub fn needs_compression(&self) -> bool {
        self.header.needs_compression(self.records_count)
    }

    /// Rewrite the whole file containing only live records, one contiguous
    /// chunk per UID, walking UIDs in ascending order. `live` yields, per
    /// UID in ascending order, the field entries to keep (most-recent value
    /// per field only). Replaces the old file atomically via rename.
    pub fn compress(&mut self, live: impl Iterator<Item = (u32, Vec<FieldEntry>)>) -> Result<HashMap<u32, u32>, CacheError> {
        let tmp_path = {
            let mut p = self.path.as_os_str().to_owned();
            p.push(".tmp");
            PathBuf::from(p)
        };

        let new_header = CacheHeader::new(self.header.indexid, self.header.file_seq + 1);
        let mut new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        new_file.write_all(&new_header.encode())?;

        let mut offsets = HashMap::new();
        let mut cursor = HEADER_SIZE as u32;
        let mut new_records_count = 0u32;

        for (uid, entries) in live {
            if entries.is_empty() {
                continue;
            }
            let record = CacheRecord { prev_offset: 0, entries };
            let encoded = record.encode(|id| self.is_variable(id));
            new_file.seek(SeekFrom::Start(cursor as u64))?;
            new_file.write_all(&encoded)?;
            offsets.insert(uid, cursor);
            cursor += encoded.len() as u32;
            new_records_count += 1;
        }

        // Field decisions: demote stale Temp fields, then republish the
        // chain (dropping fields whose decision became No).
        for f in self.fields.fields.iter_mut() {
            f.maybe_demote(f.uid_highwater);
        }
        let kept_fields: Vec<FieldMeta> = self
            .fields
            .fields
            .iter()
            .filter(|f| f.decision != Decision::No)
            .cloned()
            .collect();
        let node = FieldHeaderNode {
            fields: kept_fields,
            next_offset: 0,
        };
        let node_encoded = node.encode();
        new_file.seek(SeekFrom::Start(cursor as u64))?;
        new_file.write_all(&node_encoded)?;
        let field_header_offset = cursor;
        cursor += node_encoded.len() as u32;

        let mut final_header = new_header;
        final_header.used_file_size = cursor;
        final_header.field_header_offset = field_header_offset;
        final_header.continued_record_count = 0;
        final_header.deleted_space = 0;
        final_header.hole_offset = 0;
        new_file.seek(SeekFrom::Start(0))?;
        new_file.write_all(&final_header.encode())?;
        new_file.sync_all()?;
        drop(new_file);

        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.header = final_header;
        self.records_count = new_records_count;

        Ok(offsets)
    }
}
