//! The fixed header at the start of every `.log`/`.log.2` file.

use crate::error::LogError;

pub const HEADER_SIZE: usize = 28;
pub const MAJOR_VERSION: u8 = 1;
pub const MINOR_VERSION: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub hdr_size: u32,
    pub indexid: u32,
    pub file_seq: u32,
    pub prev_file_seq: u32,
    pub prev_file_offset: u32,
    pub create_stamp: u32,
}

impl LogHeader {
    pub fn new(indexid: u32, file_seq: u32, prev_file_seq: u32, prev_file_offset: u32, create_stamp: u32) -> Self {
        LogHeader {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            hdr_size: HEADER_SIZE as u32,
            indexid,
            file_seq,
            prev_file_seq,
            prev_file_offset,
            create_stamp,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.major_version;
        buf[1] = self.minor_version;
        buf[2..4].copy_from_slice(&0u16.to_le_bytes()); // padding
        buf[4..8].copy_from_slice(&self.hdr_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.indexid.to_le_bytes());
        buf[12..16].copy_from_slice(&self.file_seq.to_le_bytes());
        buf[16..20].copy_from_slice(&self.prev_file_seq.to_le_bytes());
        buf[20..24].copy_from_slice(&self.prev_file_offset.to_le_bytes());
        buf[24..28].copy_from_slice(&self.create_stamp.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, LogError> {
        if buf.len() < HEADER_SIZE {
            return Err(LogError::Truncated {
                wanted: HEADER_SIZE,
                have: buf.len(),
            });
        }
        let major_version = buf[0];
        let minor_version = buf[1];
        let hdr_size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let indexid = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let file_seq = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let prev_file_seq = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let prev_file_offset = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let create_stamp = u32::from_le_bytes(buf[24..28].try_into().unwrap());

        if indexid == 0 {
            return Err(LogError::Corrupted("indexid is zero".into()));
        }

        Ok(LogHeader {
            major_version,
            minor_version,
            hdr_size,
            indexid,
            file_seq,
            prev_file_seq,
            prev_file_offset,
            create_stamp,
        })
    }

    /// Zero the indexid field in place to mark a file as corrupted, the
    /// same trick the reader uses to recognise "don't trust this file"
    /// without needing a dedicated flag.
    pub fn mark_corrupted(buf: &mut [u8]) {
        if buf.len() >= 12 {
            buf[8..12].copy_from_slice(&0u32.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hdr = LogHeader::new(42, 3, 2, 1024, 1_700_000_000);
        let buf = hdr.encode();
        let decoded = LogHeader::decode(&buf).unwrap();
        assert_eq!(hdr, decoded);
    }

    #[test]
    fn zero_indexid_rejected() {
        let hdr = LogHeader::new(0, 1, 0, 0, 0);
        let buf = hdr.encode();
        assert!(LogHeader::decode(&buf).is_err());
    }
}
