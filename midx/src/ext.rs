//! Extension registry: the name -> id binding taught to readers by
//! `EXT_INTRO` log records, plus the `reset_id` that `EXT_RESET` bumps to
//! invalidate old content.
//!
//! Extension intro/reset ordering under concurrent writers is "first writer
//! wins": the fcntl write lock held across `sync_begin`/`commit` (see
//! `crate::sync`) is the only thing serialising two processes that try to
//! register the same name at once, so whichever commits its `EXT_INTRO`
//! first assigns the id.

pub type ExtId = u32;

/// One registered extension. `record_size == 0` means this extension has no
/// per-record payload (header-only); `hdr_size == 0` means no header
/// payload (record-only). Both may be nonzero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtEntry {
    pub name: String,
    pub reset_id: u32,
    pub hdr_size: u32,
    pub record_size: u32,
    pub record_align: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtRegistry {
    entries: Vec<ExtEntry>,
}

impl ExtRegistry {
    pub fn find(&self, name: &str) -> Option<ExtId> {
        self.entries.iter().position(|e| e.name == name).map(|i| i as ExtId)
    }

    pub fn get(&self, id: ExtId) -> Option<&ExtEntry> {
        self.entries.get(id as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ExtId, &ExtEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (i as ExtId, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Intro a (possibly already-known) extension. Find-or-append, mirroring
    /// the log's `EXT_INTRO` semantics: re-introducing an existing name is a
    /// no-op on the registry (only `reset` bumps `reset_id`).
    pub fn intro(&mut self, name: &str, hdr_size: u32, record_size: u32, record_align: u8) -> ExtId {
        if let Some(id) = self.find(name) {
            return id;
        }
        self.entries.push(ExtEntry {
            name: name.to_string(),
            reset_id: 0,
            hdr_size,
            record_size,
            record_align,
        });
        (self.entries.len() - 1) as ExtId
    }

    /// `EXT_RESET`: bump the reset id. Callers must treat any record/header
    /// data tagged with an older reset id as invalid once this returns.
    pub fn reset(&mut self, id: ExtId, new_reset_id: u32) {
        if let Some(e) = self.entries.get_mut(id as usize) {
            e.reset_id = new_reset_id;
        }
    }

    /// Per-record extensions only (`record_size > 0`), in registration
    /// order — the order their bytes are laid out in a record's extension
    /// trailer (see `crate::layout`).
    pub fn per_record(&self) -> impl Iterator<Item = (ExtId, &ExtEntry)> {
        self.iter().filter(|(_, e)| e.record_size > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intro_is_find_or_append() {
        let mut reg = ExtRegistry::default();
        let a = reg.intro("cache-offset", 0, 4, 4);
        let b = reg.intro("cache-offset", 0, 4, 4);
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reset_bumps_id_in_place() {
        let mut reg = ExtRegistry::default();
        let id = reg.intro("cache-offset", 0, 4, 4);
        reg.reset(id, 7);
        assert_eq!(reg.get(id).unwrap().reset_id, 7);
    }
}
