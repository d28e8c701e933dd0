//! The fixed-stride per-message record: `{uid, flags, keywords_bitmap}`.

use crate::error::IndexError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub uid: u32,
    pub flags: u8,
    pub keywords: Vec<u8>,
}

impl IndexRecord {
    pub fn encode(&self, record_size: u32, out: &mut [u8]) -> Result<(), IndexError> {
        if out.len() < record_size as usize {
            return Err(IndexError::Corrupted("record buffer shorter than record_size".into()));
        }
        out[0..4].copy_from_slice(&self.uid.to_le_bytes());
        out[4] = self.flags;
        let kw_len = (record_size as usize).saturating_sub(5).min(self.keywords.len());
        out[5..5 + kw_len].copy_from_slice(&self.keywords[..kw_len]);
        for b in &mut out[5 + kw_len..record_size as usize] {
            *b = 0;
        }
        Ok(())
    }

    pub fn decode(buf: &[u8], keywords_mask_size: u32) -> Result<Self, IndexError> {
        if buf.len() < 5 + keywords_mask_size as usize {
            return Err(IndexError::Corrupted("record buffer truncated".into()));
        }
        let uid = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let flags = buf[4];
        let keywords = buf[5..5 + keywords_mask_size as usize].to_vec();
        Ok(IndexRecord { uid, flags, keywords })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let record_size = 4 + 1 + 2;
        let rec = IndexRecord {
            uid: 77,
            flags: 0x09,
            keywords: vec![0xff, 0x01],
        };
        let mut buf = vec![0u8; record_size as usize];
        rec.encode(record_size, &mut buf).unwrap();
        let decoded = IndexRecord::decode(&buf, 2).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn forward_compat_excess_bytes_ignored() {
        // record_size larger than the minimum still round-trips the parsed
        // fields; the excess is reserved space, zeroed on encode.
        let record_size = 4 + 1 + 2 + 8;
        let rec = IndexRecord {
            uid: 1,
            flags: 0,
            keywords: vec![1, 2],
        };
        let mut buf = vec![0xaa; record_size as usize];
        rec.encode(record_size, &mut buf).unwrap();
        assert!(buf[7..].iter().all(|&b| b == 0));
        let decoded = IndexRecord::decode(&buf, 2).unwrap();
        assert_eq!(decoded.uid, 1);
        assert_eq!(decoded.keywords, vec![1, 2]);
    }
}
