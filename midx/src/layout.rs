//! The main index file's on-disk layout, built on top of `midx_index`'s
//! fixed base header/record encoding.
//!
//! `midx_index::IndexHeader`/`IndexRecord` understand only the base fields
//! documented in the specification; the `header_size`/`record_size` fields
//! they already carry exist precisely so a forward-compatible reader can
//! reserve trailing bytes it doesn't understand. This module is that
//! reader: it uses the trailing region of the header for the extension
//! registry plus any per-header extension payloads, and the trailing region
//! of every record for that record's per-record extension payloads, in
//! extension-registration order.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use midx_index::{IndexHeader, IndexRecord};

use crate::error::{Error, Result};
use crate::ext::ExtRegistry;
use crate::keywords::Keywords;

/// Encode the keyword name table, the extension registry, and per-header
/// extension payloads into the header's trailing bytes. Keyword names
/// otherwise live only in `KEYWORD_UPDATE` log records, which get dropped
/// on rotation once their range is folded into the index; without this
/// they'd be unrecoverable after a rotation plus a restart.
pub fn encode_header_trailer(keywords: &Keywords, ext: &ExtRegistry, ext_header_data: &HashMap<u32, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend_from_slice(&(keywords.names().len() as u32).to_le_bytes());
    for name in keywords.names() {
        let bytes = name.as_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }

    out.extend_from_slice(&(ext.len() as u32).to_le_bytes());
    for (id, e) in ext.iter() {
        let name = e.name.as_bytes();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&e.reset_id.to_le_bytes());
        out.extend_from_slice(&e.hdr_size.to_le_bytes());
        out.extend_from_slice(&e.record_size.to_le_bytes());
        out.push(e.record_align);
        let hdr_data = ext_header_data.get(&id).map(|v| v.as_slice()).unwrap_or(&[]);
        out.extend_from_slice(&(hdr_data.len() as u32).to_le_bytes());
        out.extend_from_slice(hdr_data);
    }
    out
}

pub fn decode_header_trailer(buf: &[u8]) -> Result<(Keywords, ExtRegistry, HashMap<u32, Vec<u8>>)> {
    let mut keywords = Keywords::default();
    let mut registry = ExtRegistry::default();
    let mut ext_header_data = HashMap::new();
    if buf.len() < 4 {
        return Ok((keywords, registry, ext_header_data));
    }

    let mut pos = 0;
    let kw_count = read_u32(buf, pos)?;
    pos += 4;
    for _ in 0..kw_count {
        let name_len = read_u32(buf, pos)? as usize;
        pos += 4;
        let name = read_string(buf, pos, name_len)?;
        pos += name_len;
        keywords.register(&name);
    }

    let count = read_u32(buf, pos)?;
    pos += 4;
    for _ in 0..count {
        let name_len = read_u32(buf, pos)? as usize;
        pos += 4;
        let name = read_string(buf, pos, name_len)?;
        pos += name_len;
        let reset_id = read_u32(buf, pos)?;
        pos += 4;
        let hdr_size = read_u32(buf, pos)?;
        pos += 4;
        let record_size = read_u32(buf, pos)?;
        pos += 4;
        let record_align = read_u8(buf, pos)?;
        pos += 1;
        let data_len = read_u32(buf, pos)? as usize;
        pos += 4;
        let data = read_bytes(buf, pos, data_len)?;
        pos += data_len;

        let id = registry.intro(&name, hdr_size, record_size, record_align);
        registry.reset(id, reset_id);
        if !data.is_empty() {
            ext_header_data.insert(id, data);
        }
    }
    Ok((keywords, registry, ext_header_data))
}

/// Per-record extension trailer: each per-record extension's bytes,
/// concatenated in registration order, zero-filled when the record has no
/// value recorded for that extension yet.
pub fn encode_record_trailer(ext: &ExtRegistry, uid: u32, ext_record_data: &HashMap<u32, HashMap<u32, Vec<u8>>>) -> Vec<u8> {
    let mut out = Vec::new();
    for (id, e) in ext.per_record() {
        let want = e.record_size as usize;
        let have = ext_record_data.get(&id).and_then(|m| m.get(&uid));
        match have {
            Some(bytes) if bytes.len() == want => out.extend_from_slice(bytes),
            _ => out.extend(std::iter::repeat(0u8).take(want)),
        }
    }
    out
}

pub fn decode_record_trailer(buf: &[u8], ext: &ExtRegistry, uid: u32, out: &mut HashMap<u32, HashMap<u32, Vec<u8>>>) {
    let mut pos = 0usize;
    for (id, e) in ext.per_record() {
        let want = e.record_size as usize;
        if pos + want > buf.len() {
            break;
        }
        let bytes = buf[pos..pos + want].to_vec();
        pos += want;
        if bytes.iter().any(|&b| b != 0) {
            out.entry(id).or_default().insert(uid, bytes);
        }
    }
}

pub fn ext_record_width(ext: &ExtRegistry) -> u32 {
    ext.per_record().map(|(_, e)| e.record_size).sum()
}

/// Write the full main index file (header, ext-registry trailer, every
/// record with its per-record extension trailer) atomically via
/// `tmp -> rename`, the same pattern `mail_index_write` uses.
pub fn write_index_file(
    path: &Path,
    header: &IndexHeader,
    records: &[IndexRecord],
    keywords: &Keywords,
    ext: &ExtRegistry,
    ext_header_data: &HashMap<u32, Vec<u8>>,
    ext_record_data: &HashMap<u32, HashMap<u32, Vec<u8>>>,
) -> Result<()> {
    let trailer = encode_header_trailer(keywords, ext, ext_header_data);
    let mut hdr = *header;
    hdr.header_size = midx_index::header::BASE_HEADER_SIZE as u32 + trailer.len() as u32;
    hdr.keywords_mask_size = keywords.mask_size();
    hdr.record_size = 5 + hdr.keywords_mask_size + ext_record_width(ext);

    let mut buf = hdr.encode();
    buf.extend_from_slice(&trailer);

    for rec in records {
        let mut rec_buf = vec![0u8; hdr.record_size as usize];
        rec.encode(5 + hdr.keywords_mask_size, &mut rec_buf)?;
        let trailer = encode_record_trailer(ext, rec.uid, ext_record_data);
        rec_buf[(5 + hdr.keywords_mask_size) as usize..].copy_from_slice(&trailer);
        buf.extend_from_slice(&rec_buf);
    }

    let tmp_path = {
        let mut p = path.as_os_str().to_owned();
        p.push(".tmp");
        std::path::PathBuf::from(p)
    };
    let mut tmp = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&tmp_path)?;
    tmp.write_all(&buf)?;
    tmp.sync_all()?;
    drop(tmp);
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read the full main index file back into its parts, the inverse of
/// [`write_index_file`].
pub fn read_index_file(
    path: &Path,
) -> Result<(
    IndexHeader,
    Vec<IndexRecord>,
    Keywords,
    ExtRegistry,
    HashMap<u32, Vec<u8>>,
    HashMap<u32, HashMap<u32, Vec<u8>>>,
)> {
    let file = File::options().read(true).write(true).open(path)?;
    let map = midx_index::IndexMap::open_mmap(&file)?;
    let header = *map.header();
    let base = midx_index::header::BASE_HEADER_SIZE;
    let trailer_buf = map
        .as_slice()
        .get(base..header.header_size as usize)
        .ok_or_else(|| Error::NeedsFsck("header_size points past end of file".into()))?;
    let (keywords, ext, ext_header_data) = decode_header_trailer(trailer_buf)?;

    let base_record_size = 5 + header.keywords_mask_size;
    let mut records = Vec::with_capacity(header.messages_count as usize);
    let mut ext_record_data = HashMap::new();
    for seq in 1..=header.messages_count {
        let start = header.header_size as usize + (seq as usize - 1) * header.record_size as usize;
        let end = start + header.record_size as usize;
        let rec_buf = map
            .as_slice()
            .get(start..end)
            .ok_or_else(|| Error::NeedsFsck(format!("record {seq} points past end of file")))?;
        let rec = IndexRecord::decode(rec_buf, header.keywords_mask_size)?;
        decode_record_trailer(&rec_buf[base_record_size as usize..], &ext, rec.uid, &mut ext_record_data);
        records.push(rec);
    }

    Ok((header, records, keywords, ext, ext_header_data, ext_record_data))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32> {
    buf.get(pos..pos + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .ok_or_else(|| Error::NeedsFsck("header trailer truncated".into()))
}

fn read_u8(buf: &[u8], pos: usize) -> Result<u8> {
    buf.get(pos).copied().ok_or_else(|| Error::NeedsFsck("header trailer truncated".into()))
}

fn read_bytes(buf: &[u8], pos: usize, len: usize) -> Result<Vec<u8>> {
    buf.get(pos..pos + len)
        .map(|s| s.to_vec())
        .ok_or_else(|| Error::NeedsFsck("header trailer truncated".into()))
}

fn read_string(buf: &[u8], pos: usize, len: usize) -> Result<String> {
    let bytes = read_bytes(buf, pos, len)?;
    String::from_utf8(bytes).map_err(|e| Error::NeedsFsck(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use midx_index::header::IndexHeader as Hdr;

    #[test]
    fn header_trailer_round_trip() {
        let mut keywords = Keywords::default();
        keywords.register("\\Seen");
        keywords.register("Work");

        let mut ext = ExtRegistry::default();
        let id = ext.intro("cache-offset", 0, 4, 4);
        ext.reset(id, 3);
        let mut hdr_data = HashMap::new();
        hdr_data.insert(id, vec![1, 2, 3]);

        let encoded = encode_header_trailer(&keywords, &ext, &hdr_data);
        let (decoded_kw, decoded_ext, decoded_hdr_data) = decode_header_trailer(&encoded).unwrap();
        assert_eq!(decoded_kw.names(), keywords.names());
        assert_eq!(decoded_ext.get(id).unwrap().reset_id, 3);
        assert_eq!(decoded_hdr_data.get(&id), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn record_trailer_round_trip() {
        let mut ext = ExtRegistry::default();
        ext.intro("cache-offset", 0, 4, 4);
        let mut data = HashMap::new();
        data.entry(0u32).or_insert_with(HashMap::new).insert(42u32, vec![9, 8, 7, 6]);

        let encoded = encode_record_trailer(&ext, 42, &data);
        let mut decoded = HashMap::new();
        decode_record_trailer(&encoded, &ext, 42, &mut decoded);
        assert_eq!(decoded.get(&0).unwrap().get(&42), Some(&vec![9, 8, 7, 6]));
    }

    #[test]
    fn full_file_round_trip_with_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dovecot.index");

        let mut ext = ExtRegistry::default();
        let cache_ext = ext.intro("cache-offset", 0, 4, 4);

        let mut hdr = Hdr::new(1, 0);
        hdr.messages_count = 2;
        hdr.next_uid = 3;
        let records = vec![
            midx_index::IndexRecord {
                uid: 1,
                flags: 0,
                keywords: vec![],
            },
            midx_index::IndexRecord {
                uid: 2,
                flags: 0x08,
                keywords: vec![],
            },
        ];
        let mut ext_record_data = HashMap::new();
        ext_record_data
            .entry(cache_ext)
            .or_insert_with(HashMap::new)
            .insert(2u32, 555u32.to_le_bytes().to_vec());

        write_index_file(&path, &hdr, &records, &Keywords::default(), &ext, &HashMap::new(), &ext_record_data).unwrap();
        let (read_hdr, read_records, _, read_ext, _, read_ext_data) = read_index_file(&path).unwrap();

        assert_eq!(read_hdr.messages_count, 2);
        assert_eq!(read_records[1].uid, 2);
        assert_eq!(read_ext.get(cache_ext).unwrap().name, "cache-offset");
        assert_eq!(read_ext_data.get(&cache_ext).unwrap().get(&2), Some(&555u32.to_le_bytes().to_vec()));
    }
}
