//! Per-field metadata and the field header chain.
//!
//! Fields are registered once (by name) and thereafter referred to by a
//! small integer id local to the cache file. Each field carries a caching
//! `Decision` that decides whether future writes bother storing it at all.

use midx_io::{offset_to_uint32, uint32_to_offset};

use crate::error::CacheError;

/// Monotone lattice `No -> Temp -> Yes`, with a `Forced` flag that freezes
/// the level regardless of subsequent demotion. `Temp` is demoted back to
/// `No` at compression time if the field's uid_highwater hasn't advanced;
/// `Yes` never demotes on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Decision {
    No = 0,
    Temp = 1,
    Yes = 2,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: String,
    pub last_used: u32,
    /// 0 means variable-length.
    pub size: u32,
    pub field_type: u8,
    pub decision: Decision,
    pub forced: bool,
    /// Highest uid seen while `decision == Temp`; used to decide whether to
    /// demote back to `No` at compression.
    pub uid_highwater: u32,
}

impl FieldMeta {
    pub fn new(name: impl Into<String>, size: u32, field_type: u8) -> Self {
        FieldMeta {
            name: name.into(),
            last_used: 0,
            size,
            field_type,
            decision: Decision::Temp,
            forced: false,
            uid_highwater: 0,
        }
    }

    pub fn promote(&mut self, to: Decision) {
        if self.forced {
            return;
        }
        if to > self.decision {
            self.decision = to;
        }
    }

    /// Demotion applied at compression time: `Temp` fields whose
    /// `uid_highwater` hasn't advanced since the last pass fall back to
    /// `No`. `Yes` and `Forced` are untouched.
    pub fn maybe_demote(&mut self, current_uid_highwater: u32) {
        if self.forced || self.decision != Decision::Temp {
            return;
        }
        if current_uid_highwater <= self.uid_highwater {
            self.decision = Decision::No;
        }
    }
}

fn encode_one(f: &FieldMeta, out: &mut Vec<u8>) {
    out.extend_from_slice(&f.last_used.to_le_bytes());
    out.extend_from_slice(&f.size.to_le_bytes());
    out.push(f.field_type);
    let decision_byte = (f.decision as u8) | if f.forced { 0x80 } else { 0 };
    out.push(decision_byte);
    out.extend_from_slice(&f.uid_highwater.to_le_bytes());
    out.extend_from_slice(f.name.as_bytes());
    out.push(0);
}

fn decode_one(buf: &[u8], pos: &mut usize) -> Result<FieldMeta, CacheError> {
    let need = |want: usize, at: usize| -> Result<(), CacheError> {
        if at + want > buf.len() {
            Err(CacheError::Corrupted("field header truncated".into()))
        } else {
            Ok(())
        }
    };
    need(14, *pos)?;
    let last_used = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    let size = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    let field_type = buf[*pos];
    *pos += 1;
    let decision_byte = buf[*pos];
    *pos += 1;
    let uid_highwater = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;

    let nul = buf[*pos..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| CacheError::Corrupted("field name not NUL-terminated".into()))?;
    let name = String::from_utf8(buf[*pos..*pos + nul].to_vec()).map_err(|e| CacheError::Corrupted(e.to_string()))?;
    *pos += nul + 1;

    Ok(FieldMeta {
        name,
        last_used,
        size,
        field_type,
        decision: match decision_byte & 0x7f {
            0 => Decision::No,
            1 => Decision::Temp,
            2 => Decision::Yes,
            other => return Err(CacheError::Corrupted(format!("bad decision byte {other}"))),
        },
        forced: decision_byte & 0x80 != 0,
        uid_highwater,
    })
}

/// One link in the field header chain: a list of fields plus the escaped
/// offset of the next header (0 meaning "no next header yet", distinct from
/// "not committed" the way log records use the same trick).
pub struct FieldHeaderNode {
    pub fields: Vec<FieldMeta>,
    pub next_offset: u32,
}

impl FieldHeaderNode {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for f in &self.fields {
            encode_one(f, &mut out);
        }
        out.extend_from_slice(&offset_to_uint32(self.next_offset).to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CacheError> {
        if buf.len() < 4 {
            return Err(CacheError::Corrupted("field header truncated".into()));
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let mut pos = 4;
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            fields.push(decode_one(buf, &mut pos)?);
        }
        if pos + 4 > buf.len() {
            return Err(CacheError::Corrupted("field header missing next_offset".into()));
        }
        let next_word = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        let next_offset = uint32_to_offset(next_word).unwrap_or(0);
        pos += 4;
        Ok((FieldHeaderNode { fields, next_offset }, pos))
    }
}

/// The full in-memory registry, built by walking the on-disk chain once at
/// open time and kept up to date as fields are registered.
#[derive(Default)]
pub struct FieldRegistry {
    pub fields: Vec<FieldMeta>,
}

impl FieldRegistry {
    pub fn find(&self, name: &str) -> Option<u32> {
        self.fields.iter().position(|f| f.name == name).map(|i| i as u32)
    }

    pub fn get(&self, id: u32) -> Option<&FieldMeta> {
        self.fields.get(id as usize)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut FieldMeta> {
        self.fields.get_mut(id as usize)
    }

    /// Find-or-append each requested field, returning its id.
    pub fn register(&mut self, new_fields: &[FieldMeta]) -> Vec<u32> {
        let mut ids = Vec::with_capacity(new_fields.len());
        for nf in new_fields {
            if let Some(id) = self.find(&nf.name) {
                ids.push(id);
            } else {
                self.fields.push(nf.clone());
                ids.push((self.fields.len() - 1) as u32);
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_round_trip() {
        let node = FieldHeaderNode {
            fields: vec![FieldMeta::new("body.snippet", 0, 1), FieldMeta::new("imap.envelope", 128, 2)],
            next_offset: 4096,
        };
        let encoded = node.encode();
        let (decoded, consumed) = FieldHeaderNode::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.fields, node.fields);
        assert_eq!(decoded.next_offset, 4096);
    }

    #[test]
    fn decision_lattice_respects_forced() {
        let mut f = FieldMeta::new("x", 0, 0);
        f.decision = Decision::Yes;
        f.forced = true;
        f.promote(Decision::No); // promote only raises; forced blocks change anyway
        assert_eq!(f.decision, Decision::Yes);
    }

    #[test]
    fn registry_find_or_append() {
        let mut reg = FieldRegistry::default();
        let ids = reg.register(&[FieldMeta::new("a", 0, 0), FieldMeta::new("b", 0, 0)]);
        assert_eq!(ids, vec![0, 1]);
        let ids2 = reg.register(&[FieldMeta::new("b", 0, 0), FieldMeta::new("c", 0, 0)]);
        assert_eq!(ids2, vec![1, 2]);
    }
}
