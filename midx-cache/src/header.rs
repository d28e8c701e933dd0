//! Cache file header.

use crate::error::CacheError;

pub const HEADER_SIZE: usize = 32;
pub const VERSION: u8 = 1;

/// `deleted_space / used_file_size > COMPRESS_PERCENTAGE` triggers a
/// compression pass.
pub const COMPRESS_PERCENTAGE: u32 = 20;
/// `continued_record_count / records_count > COMPRESS_CONTINUED_PERCENTAGE`
/// also triggers one: too many UIDs have grown multi-chunk chains.
pub const COMPRESS_CONTINUED_PERCENTAGE: u32 = 200;
/// A file below this size is never worth compressing.
pub const COMPRESS_MIN_SIZE: u64 = 1024 * 50;
/// Holes smaller than this aren't tracked; they're wasted space instead.
pub const MIN_HOLE_SIZE: u32 = 1024;
/// When growing the tail, grow by at least this percentage of the
/// current used size, to amortise repeated small appends.
pub const GROW_PERCENTAGE: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheHeader {
    pub version: u8,
    pub indexid: u32,
    pub file_seq: u32,
    pub continued_record_count: u32,
    pub hole_offset: u32,
    pub used_file_size: u32,
    pub deleted_space: u32,
    pub field_header_offset: u32,
}

impl CacheHeader {
    pub fn new(indexid: u32, file_seq: u32) -> Self {
        CacheHeader {
            version: VERSION,
            indexid,
            file_seq,
            continued_record_count: 0,
            hole_offset: 0,
            used_file_size: HEADER_SIZE as u32,
            deleted_space: 0,
            field_header_offset: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[4..8].copy_from_slice(&self.indexid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.file_seq.to_le_bytes());
        buf[12..16].copy_from_slice(&self.continued_record_count.to_le_bytes());
        buf[16..20].copy_from_slice(&self.hole_offset.to_le_bytes());
        buf[20..24].copy_from_slice(&self.used_file_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.deleted_space.to_le_bytes());
        buf[28..32].copy_from_slice(&self.field_header_offset.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CacheError> {
        if buf.len() < HEADER_SIZE {
            return Err(CacheError::Corrupted("cache header truncated".into()));
        }
        Ok(CacheHeader {
            version: buf[0],
            indexid: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            file_seq: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            continued_record_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            hole_offset: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            used_file_size: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            deleted_space: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            field_header_offset: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        })
    }

    /// Whether this header signals "usable but empty" (`hdr == NULL` in the
    /// source): preserved behaviour is to wait for the next compression
    /// pass rather than eagerly recreate it.
    pub fn is_unusable(&self) -> bool {
        self.indexid == 0
    }

    pub fn needs_compression(&self, records_count: u32) -> bool {
        if (self.used_file_size as u64) < COMPRESS_MIN_SIZE {
            return false;
        }
        let deleted_ratio = self.deleted_space.saturating_mul(100) / self.used_file_size.max(1);
        if deleted_ratio > COMPRESS_PERCENTAGE {
            return true;
        }
        if records_count > 0 {
            let continued_ratio = self.continued_record_count.saturating_mul(100) / records_count;
            if continued_ratio > COMPRESS_CONTINUED_PERCENTAGE {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hdr = CacheHeader::new(1, 1);
        let buf = hdr.encode();
        assert_eq!(CacheHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn compression_trigger_by_deleted_ratio() {
        let mut hdr = CacheHeader::new(1, 1);
        hdr.used_file_size = COMPRESS_MIN_SIZE as u32 + 1000;
        hdr.deleted_space = 300; // 30% > 20%
        assert!(hdr.needs_compression(100));
    }

    #[test]
    fn small_file_never_compresses() {
        let mut hdr = CacheHeader::new(1, 1);
        hdr.deleted_space = hdr.used_file_size; // 100% deleted, but tiny file
        assert!(!hdr.needs_compression(100));
    }
}
