//! Transaction log record types and their wire encoding.
//!
//! Framing is `{size: escaped_u32, type: u32}` followed by the payload.
//! `size` covers the whole record (header included) and is written with
//! [`midx_io::offset_to_uint32`] so a reader can tell "not yet committed"
//! (all-zero bytes) apart from a genuine size. `type`'s low byte is the
//! [`RecordType`] discriminant; the top bit is the EXTERNAL flag — set
//! when the mailbox backend has already applied this record to its own
//! storage, so sync must not push it there again.

use midx_io::{offset_to_uint32, uint32_to_offset};

use crate::error::LogError;

pub const RECORD_HEADER_SIZE: usize = 8;
const EXTERNAL_BIT: u32 = 0x8000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UidRange {
    pub uid1: u32,
    pub uid2: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Append = 1,
    Expunge = 2,
    FlagUpdate = 3,
    KeywordUpdate = 4,
    KeywordReset = 5,
    HeaderUpdate = 6,
    ExtIntro = 7,
    ExtReset = 8,
    ExtHdrUpdate = 9,
    ExtRecUpdate = 10,
}

impl RecordType {
    fn from_u8(v: u8) -> Result<Self, LogError> {
        Ok(match v {
            1 => RecordType::Append,
            2 => RecordType::Expunge,
            3 => RecordType::FlagUpdate,
            4 => RecordType::KeywordUpdate,
            5 => RecordType::KeywordReset,
            6 => RecordType::HeaderUpdate,
            7 => RecordType::ExtIntro,
            8 => RecordType::ExtReset,
            9 => RecordType::ExtHdrUpdate,
            10 => RecordType::ExtRecUpdate,
            other => return Err(LogError::UnknownRecordType(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendRecord {
    pub uid: u32,
    pub flags: u8,
    pub keywords: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagUpdate {
    pub uid1: u32,
    pub uid2: u32,
    pub add_flags: u8,
    pub remove_flags: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeywordModify {
    Add,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtRecUpdate {
    pub ext_id: u32,
    pub uid: u32,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    Append {
        records: Vec<AppendRecord>,
    },
    Expunge {
        ranges: Vec<UidRange>,
    },
    FlagUpdate {
        updates: Vec<FlagUpdate>,
    },
    KeywordUpdate {
        modify: KeywordModify,
        name: String,
        ranges: Vec<UidRange>,
    },
    KeywordReset {
        ranges: Vec<UidRange>,
    },
    HeaderUpdate {
        offset: u32,
        data: Vec<u8>,
    },
    ExtIntro {
        ext_id_in_file: u32,
        reset_id: u32,
        name: String,
        hdr_size: u32,
        record_size: u32,
        record_align: u8,
    },
    ExtReset {
        new_reset_id: u32,
    },
    /// Patches `ext_id`'s per-header payload blob at `offset`, not the main
    /// index header.
    ExtHdrUpdate {
        ext_id: u32,
        offset: u32,
        data: Vec<u8>,
    },
    ExtRecUpdate {
        updates: Vec<ExtRecUpdate>,
    },
}

impl LogRecord {
    fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Append { .. } => RecordType::Append,
            LogRecord::Expunge { .. } => RecordType::Expunge,
            LogRecord::FlagUpdate { .. } => RecordType::FlagUpdate,
            LogRecord::KeywordUpdate { .. } => RecordType::KeywordUpdate,
            LogRecord::KeywordReset { .. } => RecordType::KeywordReset,
            LogRecord::HeaderUpdate { .. } => RecordType::HeaderUpdate,
            LogRecord::ExtIntro { .. } => RecordType::ExtIntro,
            LogRecord::ExtReset { .. } => RecordType::ExtReset,
            LogRecord::ExtHdrUpdate { .. } => RecordType::ExtHdrUpdate,
            LogRecord::ExtRecUpdate { .. } => RecordType::ExtRecUpdate,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            LogRecord::Append { records } => {
                out.extend_from_slice(&(records.len() as u32).to_le_bytes());
                for r in records {
                    out.extend_from_slice(&r.uid.to_le_bytes());
                    out.push(r.flags);
                    out.extend_from_slice(&(r.keywords.len() as u32).to_le_bytes());
                    out.extend_from_slice(&r.keywords);
                }
            }
            LogRecord::Expunge { ranges } | LogRecord::KeywordReset { ranges } => {
                out.extend_from_slice(&(ranges.len() as u32).to_le_bytes());
                for r in ranges {
                    out.extend_from_slice(&r.uid1.to_le_bytes());
                    out.extend_from_slice(&r.uid2.to_le_bytes());
                }
            }
            LogRecord::FlagUpdate { updates } => {
                out.extend_from_slice(&(updates.len() as u32).to_le_bytes());
                for u in updates {
                    out.extend_from_slice(&u.uid1.to_le_bytes());
                    out.extend_from_slice(&u.uid2.to_le_bytes());
                    out.push(u.add_flags);
                    out.push(u.remove_flags);
                }
            }
            LogRecord::KeywordUpdate { modify, name, ranges } => {
                out.push(match modify {
                    KeywordModify::Add => 0,
                    KeywordModify::Remove => 1,
                });
                let name_bytes = name.as_bytes();
                out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(name_bytes);
                out.extend_from_slice(&(ranges.len() as u32).to_le_bytes());
                for r in ranges {
                    out.extend_from_slice(&r.uid1.to_le_bytes());
                    out.extend_from_slice(&r.uid2.to_le_bytes());
                }
            }
            LogRecord::HeaderUpdate { offset, data } => {
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            LogRecord::ExtHdrUpdate { ext_id, offset, data } => {
                out.extend_from_slice(&ext_id.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            LogRecord::ExtIntro {
                ext_id_in_file,
                reset_id,
                name,
                hdr_size,
                record_size,
                record_align,
            } => {
                out.extend_from_slice(&ext_id_in_file.to_le_bytes());
                out.extend_from_slice(&reset_id.to_le_bytes());
                let name_bytes = name.as_bytes();
                out.extend_from_slice(&(name_bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(name_bytes);
                out.extend_from_slice(&hdr_size.to_le_bytes());
                out.extend_from_slice(&record_size.to_le_bytes());
                out.push(*record_align);
            }
            LogRecord::ExtReset { new_reset_id } => {
                out.extend_from_slice(&new_reset_id.to_le_bytes());
            }
            LogRecord::ExtRecUpdate { updates } => {
                out.extend_from_slice(&(updates.len() as u32).to_le_bytes());
                for u in updates {
                    out.extend_from_slice(&u.ext_id.to_le_bytes());
                    out.extend_from_slice(&u.uid.to_le_bytes());
                    out.extend_from_slice(&(u.payload.len() as u32).to_le_bytes());
                    out.extend_from_slice(&u.payload);
                }
            }
        }
    }

    /// Encode the full record (size + type header, then payload).
    pub fn encode(&self, external: bool) -> Vec<u8> {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);

        let total_len = RECORD_HEADER_SIZE + payload.len();
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&offset_to_uint32(total_len as u32).to_le_bytes());
        let mut type_word = self.record_type() as u32;
        if external {
            type_word |= EXTERNAL_BIT;
        }
        out.extend_from_slice(&type_word.to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Decode one record starting at `buf[0]`. Returns `None` if the size
    /// field reads as all-zero, meaning the writer hasn't committed this
    /// record yet — callers must treat that as end-of-log, not corruption.
    /// Returns the decoded record, its EXTERNAL flag, and the number of
    /// bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<Option<(LogRecord, bool, usize)>, LogError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let size_word = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let total_len = match uint32_to_offset(size_word) {
            None => return Ok(None),
            Some(v) => v as usize,
        };
        if total_len < RECORD_HEADER_SIZE {
            return Err(LogError::Corrupted(format!("record size {total_len} smaller than header")));
        }
        if buf.len() < total_len {
            return Err(LogError::Truncated {
                wanted: total_len,
                have: buf.len(),
            });
        }

        let type_word = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let external = type_word & EXTERNAL_BIT != 0;
        let record_type = RecordType::from_u8((type_word & 0xff) as u8)?;
        let payload = &buf[RECORD_HEADER_SIZE..total_len];

        let record = decode_payload(record_type, payload)?;
        Ok(Some((record, external, total_len)))
    }
}

fn decode_payload(record_type: RecordType, buf: &[u8]) -> Result<LogRecord, LogError> {
    let mut cursor = Cursor::new(buf);
    Ok(match record_type {
        RecordType::Append => {
            let count = cursor.u32()?;
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let uid = cursor.u32()?;
                let flags = cursor.u8()?;
                let kw_len = cursor.u32()?;
                let keywords = cursor.bytes(kw_len as usize)?.to_vec();
                records.push(AppendRecord { uid, flags, keywords });
            }
            LogRecord::Append { records }
        }
        RecordType::Expunge => LogRecord::Expunge {
            ranges: cursor.uid_ranges()?,
        },
        RecordType::KeywordReset => LogRecord::KeywordReset {
            ranges: cursor.uid_ranges()?,
        },
        RecordType::FlagUpdate => {
            let count = cursor.u32()?;
            let mut updates = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let uid1 = cursor.u32()?;
                let uid2 = cursor.u32()?;
                let add_flags = cursor.u8()?;
                let remove_flags = cursor.u8()?;
                updates.push(FlagUpdate {
                    uid1,
                    uid2,
                    add_flags,
                    remove_flags,
                });
            }
            LogRecord::FlagUpdate { updates }
        }
        RecordType::KeywordUpdate => {
            let modify = match cursor.u8()? {
                0 => KeywordModify::Add,
                1 => KeywordModify::Remove,
                other => return Err(LogError::Corrupted(format!("bad keyword modify tag {other}"))),
            };
            let name = cursor.string()?;
            let ranges = cursor.uid_ranges()?;
            LogRecord::KeywordUpdate { modify, name, ranges }
        }
        RecordType::HeaderUpdate => {
            let offset = cursor.u32()?;
            let data = cursor.blob()?;
            LogRecord::HeaderUpdate { offset, data }
        }
        RecordType::ExtHdrUpdate => {
            let ext_id = cursor.u32()?;
            let offset = cursor.u32()?;
            let data = cursor.blob()?;
            LogRecord::ExtHdrUpdate { ext_id, offset, data }
        }
        RecordType::ExtIntro => {
            let ext_id_in_file = cursor.u32()?;
            let reset_id = cursor.u32()?;
            let name = cursor.string()?;
            let hdr_size = cursor.u32()?;
            let record_size = cursor.u32()?;
            let record_align = cursor.u8()?;
            LogRecord::ExtIntro {
                ext_id_in_file,
                reset_id,
                name,
                hdr_size,
                record_size,
                record_align,
            }
        }
        RecordType::ExtReset => LogRecord::ExtReset {
            new_reset_id: cursor.u32()?,
        },
        RecordType::ExtRecUpdate => {
            let count = cursor.u32()?;
            let mut updates = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let ext_id = cursor.u32()?;
                let uid = cursor.u32()?;
                let payload = cursor.blob()?;
                updates.push(ExtRecUpdate { ext_id, uid, payload });
            }
            LogRecord::ExtRecUpdate { updates }
        }
    })
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], LogError> {
        if self.pos + len > self.buf.len() {
            return Err(LogError::Truncated {
                wanted: self.pos + len,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, LogError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, LogError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn blob(&mut self) -> Result<Vec<u8>, LogError> {
        let len = self.u32()? as usize;
        Ok(self.bytes(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, LogError> {
        let len = self.u32()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| LogError::Corrupted(e.to_string()))
    }

    fn uid_ranges(&mut self) -> Result<Vec<UidRange>, LogError> {
        let count = self.u32()?;
        let mut ranges = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let uid1 = self.u32()?;
            let uid2 = self.u32()?;
            ranges.push(UidRange { uid1, uid2 });
        }
        Ok(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_round_trip() {
        let rec = LogRecord::Append {
            records: vec![
                AppendRecord {
                    uid: 1,
                    flags: 0,
                    keywords: vec![],
                },
                AppendRecord {
                    uid: 2,
                    flags: 3,
                    keywords: vec![0b0000_0101],
                },
            ],
        };
        let encoded = rec.encode(false);
        let (decoded, external, consumed) = LogRecord::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, rec);
        assert!(!external);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn external_bit_round_trips() {
        let rec = LogRecord::ExtReset { new_reset_id: 7 };
        let encoded = rec.encode(true);
        let (decoded, external, _) = LogRecord::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, rec);
        assert!(external);
    }

    #[test]
    fn uncommitted_record_reads_as_none() {
        let buf = vec![0u8; RECORD_HEADER_SIZE];
        assert!(LogRecord::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn keyword_update_round_trip() {
        let rec = LogRecord::KeywordUpdate {
            modify: KeywordModify::Remove,
            name: "\\Important".to_string(),
            ranges: vec![UidRange { uid1: 5, uid2: 10 }],
        };
        let encoded = rec.encode(false);
        let (decoded, _, _) = LogRecord::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, rec);
    }
}
