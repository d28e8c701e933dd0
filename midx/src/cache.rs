//! The public cache read/write API (§6): `cache_lookup_field`/`cache_add`,
//! layered over `midx_cache`'s file and transaction machinery.
//!
//! Each UID's cache-chain head offset is itself stored in the main index,
//! as a 4-byte payload of a well-known extension (`cache-offset`) — exactly
//! the "cache offset uint64" example the specification's extension section
//! gives for a per-record fixed-size payload (narrowed to `u32` here since
//! this crate's cache file offsets are `u32`, matching `midx_cache`). A
//! lookup is therefore two steps: resolve `uid -> offset` through that
//! extension, then walk the chunk chain at `offset`.
//!
//! §9 Open Question ("cache file with `hdr == None`"): a missing or
//! unusable cache file is not an error here. Lookups report "not cached"
//! and `CacheTransaction`s opened against it simply have nothing to flush
//! into; the file is only recreated by the next compression pass, not
//! eagerly by a writer that notices it's gone.

pub use midx_cache::{CacheTransaction, FieldEntry, FieldMeta};

use crate::error::Result;
use crate::ext::ExtId;
use crate::index::Index;
use crate::sync::SyncCtx;
use crate::view::View;

pub const CACHE_OFFSET_EXT_NAME: &str = "cache-offset";

impl Index {
    /// Resolve (registering on first use) the well-known extension that
    /// carries each UID's cache-chain head offset.
    pub fn cache_offset_ext(&self) -> Result<ExtId> {
        self.register_ext(CACHE_OFFSET_EXT_NAME, 0, 4, 4)
    }

    /// `register_fields(new_fields)`: find-or-append fields in the cache
    /// file's field header chain. A no-op returning no ids if the cache is
    /// currently unusable.
    pub fn register_cache_fields(&self, fields: &[FieldMeta]) -> Result<Vec<u32>> {
        let mut state = self.state.lock().expect("index mutex poisoned");
        match state.cache.as_mut() {
            Some(cache) => Ok(cache.register_fields(fields)?),
            None => Ok(Vec::new()),
        }
    }

    /// Open a buffered cache-add transaction against the current cache
    /// file, or `None` if the cache is unusable — callers should treat a
    /// `None` the same as an empty transaction whose `cache_add` calls are
    /// silently dropped.
    pub fn open_cache_transaction(&self) -> Option<CacheTransaction> {
        let state = self.state.lock().expect("index mutex poisoned");
        state.cache.as_ref().map(|cache| CacheTransaction::with_buffer_size(cache, self.config().cache.write_buffer_size))
    }
}

/// `cache_lookup_field(view, seq, field_id) -> bytes | not-cached | error`.
/// Returns `Ok(None)` both when the message has never been cached and when
/// the cache file itself is unusable.
pub fn cache_lookup_field(index: &Index, view: &View, seq: u32, field_id: u32) -> Result<Option<Vec<u8>>> {
    let Some(uid) = view.lookup_uid(seq) else {
        return Ok(None);
    };
    let Some(ext_id) = view.snapshot().ext_registry.find(CACHE_OFFSET_EXT_NAME) else {
        return Ok(None);
    };
    let Some(offset_bytes) = view.ext_record(ext_id, uid) else {
        return Ok(None);
    };
    let offset = u32::from_le_bytes(offset_bytes.try_into().unwrap_or([0; 4]));
    if offset == 0 {
        return Ok(None);
    }

    let mut state = index.state.lock().expect("index mutex poisoned");
    match state.cache.as_mut() {
        Some(cache) => Ok(cache.lookup_field(offset, field_id)?),
        None => Ok(None),
    }
}

/// `cache_add(cache_txn, seq, field_id, bytes)`: buffer a field value for
/// the message at `seq` in `view`. `midx_cache::CacheTransaction` itself is
/// keyed by UID, not seq — it sits below `midx` in the dependency order and
/// has no notion of a view to resolve one against — so this free function is
/// where the seq→UID translation documented for the public API actually
/// happens, the same boundary `cache_lookup_field` already draws two lines
/// below. A `seq` outside `view`'s current record count, or an unusable
/// cache (`txn` is `None`), is silently dropped: cache data is
/// non-authoritative by design, so losing a write here costs a future
/// re-read, not correctness.
pub fn cache_add(view: &View, txn: &mut Option<CacheTransaction>, seq: u32, field_id: u32, payload: Vec<u8>) {
    let (Some(txn), Some(uid)) = (txn.as_mut(), view.lookup_uid(seq)) else {
        return;
    };
    txn.add(uid, vec![FieldEntry { file_field_id: field_id, payload }]);
}

impl<'i> SyncCtx<'i> {
    /// Flush a cache transaction's buffered adds into the live cache file,
    /// and fold each UID's new chunk offset into this sync pass's
    /// ext_trans via the `cache-offset` extension — the backend-derived
    /// write §4.4 step 1 describes.
    pub fn flush_cache_transaction(&mut self, cache_ext_id: ExtId, txn: &mut CacheTransaction) -> Result<()> {
        let results = {
            let state = self.state_mut();
            match state.cache.as_mut() {
                Some(cache) => txn.flush(cache)?,
                None => return Ok(()),
            }
        };
        for (uid, offset) in results {
            self.record_ext_update(cache_ext_id, uid, offset.to_le_bytes().to_vec());
        }
        Ok(())
    }
}
