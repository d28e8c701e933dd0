//! The mailbox's ordered keyword name table and the bitmap helpers that
//! address it. Keyword deletion is notably absent, matching the source:
//! names only accrete, even across compression.

use crate::view::View;

#[derive(Clone, Debug, Default)]
pub struct Keywords {
    names: Vec<String>,
}

impl Keywords {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Find-or-append; keyword names are never removed.
    pub fn register(&mut self, name: &str) -> usize {
        if let Some(idx) = self.index_of(name) {
            return idx;
        }
        self.names.push(name.to_string());
        self.names.len() - 1
    }

    pub fn mask_size(&self) -> u32 {
        ((self.names.len() + 7) / 8) as u32
    }

    pub fn bit_is_set(bitmap: &[u8], idx: usize) -> bool {
        let byte = idx / 8;
        let bit = idx % 8;
        bitmap.get(byte).map(|b| b & (1 << bit) != 0).unwrap_or(false)
    }

    pub fn set_bit(bitmap: &mut Vec<u8>, idx: usize) {
        let byte = idx / 8;
        if bitmap.len() <= byte {
            bitmap.resize(byte + 1, 0);
        }
        bitmap[byte] |= 1 << (idx % 8);
    }

    pub fn clear_bit(bitmap: &mut [u8], idx: usize) {
        let byte = idx / 8;
        if let Some(b) = bitmap.get_mut(byte) {
            *b &= !(1 << (idx % 8));
        }
    }
}

/// A resolved, read-only view of a set of keyword names against the
/// registry current when it was created (`keywords_create`/`keywords_free`
/// in the exported API).
pub struct KeywordsHandle {
    pub indices: Vec<usize>,
}

impl KeywordsHandle {
    /// `keywords_create(view, names) -> keywords_handle` (§6): resolve
    /// `names` against `view`'s registry as it stood when the view was
    /// opened. This is read-only — a name the registry hasn't seen yet is
    /// simply absent from `indices` rather than being registered on the
    /// spot, since keyword names only ever enter the registry through a
    /// committed `KeywordUpdate` log record (`sync::apply_record`), never
    /// through a read-side call.
    pub fn create(view: &View, names: &[String]) -> Self {
        let registry = &view.snapshot().keywords;
        let indices = names.iter().filter_map(|n| registry.index_of(n)).collect();
        KeywordsHandle { indices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_find_or_append() {
        let mut kw = Keywords::default();
        assert_eq!(kw.register("\\Important"), 0);
        assert_eq!(kw.register("Work"), 1);
        assert_eq!(kw.register("\\Important"), 0);
        assert_eq!(kw.names(), &["\\Important".to_string(), "Work".to_string()]);
    }

    #[test]
    fn bitmap_round_trip() {
        let mut bitmap = Vec::new();
        Keywords::set_bit(&mut bitmap, 3);
        Keywords::set_bit(&mut bitmap, 9);
        assert!(Keywords::bit_is_set(&bitmap, 3));
        assert!(Keywords::bit_is_set(&bitmap, 9));
        assert!(!Keywords::bit_is_set(&bitmap, 4));
        Keywords::clear_bit(&mut bitmap, 3);
        assert!(!Keywords::bit_is_set(&bitmap, 3));
    }

    #[test]
    fn mask_size_rounds_up_to_bytes() {
        let mut kw = Keywords::default();
        for i in 0..9 {
            kw.register(&format!("kw{i}"));
        }
        assert_eq!(kw.mask_size(), 2);
    }
}
