//! Cache record chunks and holes.

use crate::error::CacheError;

/// Chosen so a reader that mis-parses a hole as a record sees a `size`
/// larger than the file and fails cleanly instead of reading garbage.
pub const HOLE_MAGIC: u32 = 0xffee_deff;
pub const MIN_HOLE_RECORD_SIZE: usize = 12;

/// One field's payload within a chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldEntry {
    pub file_field_id: u32,
    pub payload: Vec<u8>,
}

/// One chunk: all fields written for a UID in a single cache transaction
/// flush. `prev_offset` links to the previous chunk for the same UID (0
/// terminates the chain).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRecord {
    pub prev_offset: u32,
    pub entries: Vec<FieldEntry>,
}

impl CacheRecord {
    /// Total on-disk size once encoded, including the 8-byte chunk header.
    pub fn encoded_len(&self, variable_size_fields: impl Fn(u32) -> bool) -> usize {
        let mut len = 8;
        for e in &self.entries {
            len += 4;
            if variable_size_fields(e.file_field_id) {
                len += 4;
            }
            len += e.payload.len();
            len = (len + 3) & !3; // zero-pad to 4
        }
        len
    }

    pub fn encode(&self, variable_size_fields: impl Fn(u32) -> bool) -> Vec<u8> {
        let total = self.encoded_len(&variable_size_fields);
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&self.prev_offset.to_le_bytes());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        for e in &self.entries {
            out.extend_from_slice(&e.file_field_id.to_le_bytes());
            if variable_size_fields(e.file_field_id) {
                out.extend_from_slice(&(e.payload.len() as u32).to_le_bytes());
            }
            out.extend_from_slice(&e.payload);
            while out.len() % 4 != 0 {
                out.push(0);
            }
        }
        debug_assert_eq!(out.len(), total);
        out
    }

    pub fn decode(buf: &[u8], variable_size_fields: impl Fn(u32) -> bool, fixed_size: impl Fn(u32) -> u32) -> Result<Self, CacheError> {
        if buf.len() < 8 {
            return Err(CacheError::Corrupted("cache record truncated".into()));
        }
        let prev_offset = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        if size > buf.len() {
            return Err(CacheError::Corrupted("cache record size exceeds buffer".into()));
        }
        let mut pos = 8;
        let mut entries = Vec::new();
        while pos < size {
            if pos + 4 > size {
                return Err(CacheError::Corrupted("cache record entry truncated".into()));
            }
            let file_field_id = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let payload_len = if variable_size_fields(file_field_id) {
                if pos + 4 > size {
                    return Err(CacheError::Corrupted("cache record payload size truncated".into()));
                }
                let l = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4;
                l
            } else {
                fixed_size(file_field_id) as usize
            };
            if pos + payload_len > size {
                return Err(CacheError::Corrupted("cache record payload truncated".into()));
            }
            let payload = buf[pos..pos + payload_len].to_vec();
            pos += payload_len;
            pos = (pos + 3) & !3;
            entries.push(FieldEntry { file_field_id, payload });
        }
        Ok(CacheRecord { prev_offset, entries })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hole {
    pub next_offset: u32,
    pub size: u32,
}

impl Hole {
    pub fn encode(&self) -> [u8; MIN_HOLE_RECORD_SIZE] {
        let mut out = [0u8; MIN_HOLE_RECORD_SIZE];
        out[0..4].copy_from_slice(&self.next_offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&HOLE_MAGIC.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CacheError> {
        if buf.len() < MIN_HOLE_RECORD_SIZE {
            return Err(CacheError::Corrupted("hole record truncated".into()));
        }
        let magic = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if magic != HOLE_MAGIC {
            return Err(CacheError::Corrupted("hole magic mismatch".into()));
        }
        Ok(Hole {
            next_offset: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip_fixed_and_variable() {
        let rec = CacheRecord {
            prev_offset: 0,
            entries: vec![
                FieldEntry {
                    file_field_id: 0,
                    payload: vec![1, 2, 3, 4],
                },
                FieldEntry {
                    file_field_id: 1,
                    payload: vec![9, 9, 9],
                },
            ],
        };
        let is_variable = |id: u32| id == 1;
        let fixed_size = |id: u32| if id == 0 { 4 } else { 0 };
        let encoded = rec.encode(is_variable);
        let decoded = CacheRecord::decode(&encoded, is_variable, fixed_size).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn hole_round_trip() {
        let hole = Hole {
            next_offset: 2048,
            size: 512,
        };
        let buf = hole.encode();
        assert_eq!(Hole::decode(&buf).unwrap(), hole);
    }

    #[test]
    fn hole_magic_guards_misread() {
        let mut buf = [0u8; MIN_HOLE_RECORD_SIZE];
        buf[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(Hole::decode(&buf).is_err());
    }
}
