//! The main index's fixed header, carrying the mailbox-wide counters that
//! let most queries avoid scanning the record array at all.

use crate::error::IndexError;

pub const BASE_HEADER_SIZE: usize = 124;
pub const VERSION: u8 = 1;
pub const DAY_FIRST_UID_SLOTS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: u8,
    pub base_header_size: u32,
    pub header_size: u32,
    pub record_size: u32,
    pub keywords_mask_size: u32,
    pub flags: u32,
    pub indexid: u32,
    pub uid_validity: u32,
    pub next_uid: u32,
    pub messages_count: u32,
    pub recent_messages_count: u32,
    pub seen_messages_count: u32,
    pub deleted_messages_count: u32,
    pub first_recent_uid_lowwater: u32,
    pub first_unseen_uid_lowwater: u32,
    pub first_deleted_uid_lowwater: u32,
    pub log_file_seq: u32,
    pub log_file_tail_offset: u32,
    pub log_file_head_offset: u32,
    pub sync_size: u64,
    pub sync_stamp: u32,
    pub day_stamp: u32,
    pub day_first_uid: [u32; DAY_FIRST_UID_SLOTS],
}

impl IndexHeader {
    pub fn new(indexid: u32, keywords_mask_size: u32) -> Self {
        let record_size = 4 + 1 + keywords_mask_size;
        IndexHeader {
            version: VERSION,
            base_header_size: BASE_HEADER_SIZE as u32,
            header_size: BASE_HEADER_SIZE as u32,
            record_size,
            keywords_mask_size,
            flags: 0,
            indexid,
            uid_validity: indexid,
            next_uid: 1,
            messages_count: 0,
            recent_messages_count: 0,
            seen_messages_count: 0,
            deleted_messages_count: 0,
            first_recent_uid_lowwater: 1,
            first_unseen_uid_lowwater: 1,
            first_deleted_uid_lowwater: 1,
            log_file_seq: 1,
            log_file_tail_offset: 0,
            log_file_head_offset: 0,
            sync_size: 0,
            sync_stamp: 0,
            day_stamp: 0,
            day_first_uid: [0; DAY_FIRST_UID_SLOTS],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.header_size as usize];
        buf[0] = self.version;
        buf[4..8].copy_from_slice(&self.base_header_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.header_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.record_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.keywords_mask_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.flags.to_le_bytes());
        buf[24..28].copy_from_slice(&self.indexid.to_le_bytes());
        buf[28..32].copy_from_slice(&self.uid_validity.to_le_bytes());
        buf[32..36].copy_from_slice(&self.next_uid.to_le_bytes());
        buf[36..40].copy_from_slice(&self.messages_count.to_le_bytes());
        buf[40..44].copy_from_slice(&self.recent_messages_count.to_le_bytes());
        buf[44..48].copy_from_slice(&self.seen_messages_count.to_le_bytes());
        buf[48..52].copy_from_slice(&self.deleted_messages_count.to_le_bytes());
        buf[52..56].copy_from_slice(&self.first_recent_uid_lowwater.to_le_bytes());
        buf[56..60].copy_from_slice(&self.first_unseen_uid_lowwater.to_le_bytes());
        buf[60..64].copy_from_slice(&self.first_deleted_uid_lowwater.to_le_bytes());
        buf[64..68].copy_from_slice(&self.log_file_seq.to_le_bytes());
        buf[68..72].copy_from_slice(&self.log_file_tail_offset.to_le_bytes());
        buf[72..76].copy_from_slice(&self.log_file_head_offset.to_le_bytes());
        buf[76..84].copy_from_slice(&self.sync_size.to_le_bytes());
        buf[84..88].copy_from_slice(&self.sync_stamp.to_le_bytes());
        buf[88..92].copy_from_slice(&self.day_stamp.to_le_bytes());
        let day_first_uid_off = 92;
        for (i, v) in self.day_first_uid.iter().enumerate() {
            let off = day_first_uid_off + i * 4;
            if off + 4 <= buf.len() {
                buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, IndexError> {
        if buf.len() < BASE_HEADER_SIZE {
            return Err(IndexError::Corrupted("index header truncated".into()));
        }
        let read_u32 = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let read_u64 = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());

        let mut day_first_uid = [0u32; DAY_FIRST_UID_SLOTS];
        for (i, slot) in day_first_uid.iter_mut().enumerate() {
            let off = 92 + i * 4;
            if off + 4 <= buf.len() {
                *slot = read_u32(off);
            }
        }

        let header = IndexHeader {
            version: buf[0],
            base_header_size: read_u32(4),
            header_size: read_u32(8),
            record_size: read_u32(12),
            keywords_mask_size: read_u32(16),
            flags: read_u32(20),
            indexid: read_u32(24),
            uid_validity: read_u32(28),
            next_uid: read_u32(32),
            messages_count: read_u32(36),
            recent_messages_count: read_u32(40),
            seen_messages_count: read_u32(44),
            deleted_messages_count: read_u32(48),
            first_recent_uid_lowwater: read_u32(52),
            first_unseen_uid_lowwater: read_u32(56),
            first_deleted_uid_lowwater: read_u32(60),
            log_file_seq: read_u32(64),
            log_file_tail_offset: read_u32(68),
            log_file_head_offset: read_u32(72),
            sync_size: read_u64(76),
            sync_stamp: read_u32(84),
            day_stamp: read_u32(88),
            day_first_uid,
        };
        header.check_invariants()?;
        Ok(header)
    }

    /// §3/§4.2 invariants: nonzero ids, record/header sizes at least the
    /// struct minimum (excess bytes are reserved for forward compatibility),
    /// lowwater marks not past `next_uid`.
    pub fn check_invariants(&self) -> Result<(), IndexError> {
        if self.indexid == 0 {
            return Err(IndexError::Corrupted("indexid is zero".into()));
        }
        if self.uid_validity == 0 {
            return Err(IndexError::Corrupted("uid_validity is zero".into()));
        }
        if self.record_size < 4 + 1 + self.keywords_mask_size {
            return Err(IndexError::Corrupted("record_size smaller than minimum record".into()));
        }
        if self.header_size < BASE_HEADER_SIZE as u32 {
            return Err(IndexError::Corrupted("header_size smaller than base header".into()));
        }
        if self.first_recent_uid_lowwater > self.next_uid
            || self.first_unseen_uid_lowwater > self.next_uid
            || self.first_deleted_uid_lowwater > self.next_uid
        {
            return Err(IndexError::Corrupted("lowwater mark exceeds next_uid".into()));
        }
        Ok(())
    }
}
