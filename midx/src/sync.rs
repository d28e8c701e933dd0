//! The sync engine: the only place log records actually become index state.
//! `sync_begin` locks the log, decides whether there's anything to apply,
//! replays it into a working snapshot, and hands the caller an
//! ascending-UID stream of [`SyncRec`] to push into its own backend
//! storage. `SyncCtx::commit` persists the result; `rollback` discards it.
//!
//! Mirrors the teacher's `Bayou::sync` (`aero-bayou/src/lib.rs`): lock,
//! fetch what changed since the last known position, replay onto a
//! checkpoint, publish. The checkpoint there is a CRDT state snapshot held
//! in object storage; here it's the main index file plus the in-memory
//! [`Snapshot`] it materialises.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, MutexGuard};

use midx_index::{IndexHeader, IndexRecord};
use midx_lock::fcntl::FcntlGuard;
use midx_log::{KeywordModify, LogRecord};

use crate::error::Result;
use crate::ext::ExtId;
use crate::index::{Index, IndexState};
use crate::keywords::Keywords;
use crate::layout;
use crate::snapshot::Snapshot;

/// §4.4 step 4 allows deferring the index rewrite until tail movement
/// crosses a threshold, amortising it over a burst of small transactions.
/// 4 KiB is small enough that a handful of flag updates already trigger a
/// rewrite (keeping the on-disk index close to current), but large enough
/// that a single append/expunge doesn't rewrite the whole file every time.
const REWRITE_THRESHOLD: u64 = 4096;

#[derive(Clone, Copy, Debug, Default)]
pub struct SyncFlags {
    pub avoid_flag_updates: bool,
    /// Force a sync pass even if the log position hasn't moved, e.g. to
    /// pick up a cache compression that's now due.
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncRec {
    Expunge { uid1: u32, uid2: u32 },
    FlagUpdate { uid1: u32, uid2: u32, add_flags: u8, remove_flags: u8 },
    KeywordUpdate { modify: KeywordModify, name: String, uid1: u32, uid2: u32 },
    KeywordReset { uid1: u32, uid2: u32 },
    /// Always the last item handed out: the backend looks up each new UID's
    /// record via `SyncCtx::lookup`.
    Append { uid1: u32, uid2: u32 },
}

pub enum SyncOutcome<'i> {
    NoOp,
    Sync(SyncCtx<'i>),
}

pub struct SyncCtx<'i> {
    index: &'i Index,
    state: MutexGuard<'i, IndexState>,
    /// Held for the whole sync pass (§4.1/§4.4): acquired before the tail is
    /// even read, released only on `commit`/`rollback`, so a concurrent
    /// sync_begin can't interleave a replay with this one's.
    _fcntl_guard: FcntlGuard,
    working: Snapshot,
    recs: VecDeque<SyncRec>,
    new_log_seq: u32,
    new_log_offset: u64,
    ext_updates: Vec<(ExtId, u32, Vec<u8>)>,
}

impl<'i> SyncCtx<'i> {
    /// Next sync record in ascending-UID order, appends last.
    pub fn next(&mut self) -> Option<SyncRec> {
        self.recs.pop_front()
    }

    /// Look up a record in the post-replay working snapshot — used by the
    /// backend to read back the data behind a freshly-applied `Append`.
    pub fn lookup(&self, seq: u32) -> Option<&IndexRecord> {
        self.working.lookup(seq)
    }

    pub fn working(&self) -> &Snapshot {
        &self.working
    }

    /// Access to the locked index state for sibling modules (`crate::cache`)
    /// that need to reach the live cache file during a sync pass, without
    /// widening this struct's fields to `pub`.
    pub(crate) fn state_mut(&mut self) -> &mut crate::index::IndexState {
        &mut *self.state
    }

    /// A backend records a derived write (e.g. a cache chunk offset) to be
    /// persisted as an externally-applied extension update alongside this
    /// sync pass's `ext_trans`.
    pub fn record_ext_update(&mut self, ext_id: ExtId, uid: u32, payload: Vec<u8>) {
        self.working.ext_record_data.entry(ext_id).or_default().insert(uid, payload.clone());
        self.ext_updates.push((ext_id, uid, payload));
    }

    /// Persist the sync pass: write the ext_trans, advance
    /// `log_file_tail_offset`, conditionally rewrite the main index file and
    /// rotate the log, then publish the new snapshot.
    pub fn commit(mut self) -> Result<()> {
        if !self.ext_updates.is_empty() {
            let updates = self
                .ext_updates
                .drain(..)
                .map(|(ext_id, uid, payload)| midx_log::ExtRecUpdate { ext_id, uid, payload })
                .collect();
            self.new_log_offset = self.state.log.append(&[(LogRecord::ExtRecUpdate { updates }, true)])?;
        }

        self.working.header.log_file_seq = self.new_log_seq;
        self.working.header.log_file_tail_offset = self.new_log_offset as u32;
        self.working.log_seq = self.new_log_seq;
        self.working.log_offset = self.new_log_offset;
        self.working.check_uid_monotonicity()?;

        let moved = self.new_log_offset.saturating_sub(self.working.header.log_file_head_offset as u64);
        if moved >= REWRITE_THRESHOLD {
            layout::write_index_file(
                self.index.main_path(),
                &self.working.header,
                &self.working.records,
                &self.working.keywords,
                &self.working.ext_registry,
                &self.working.ext_header_data,
                &self.working.ext_record_data,
            )?;
            self.working.header.log_file_head_offset = self.new_log_offset as u32;

            let should_rotate = self.state.log.should_rotate(&midx_log::RotateConfig {
                log_rotate_size: self.index.config().log.log_rotate_size,
                log_rotate_min_created_ago: self.index.config().log.log_rotate_min_created_ago,
            })?;
            if should_rotate {
                // The index file we just wrote already reflects every
                // record up to `new_log_offset`, so the old head's
                // content is fully superseded; rotating right after a
                // rewrite never loses anything a replay would need.
                let dotlock_settings = midx_lock::DotlockSettings {
                    immediate_stale_timeout: self.index.config().locking.immediate_stale_timeout,
                    stale_timeout: self.index.config().locking.stale_timeout,
                    ..Default::default()
                };
                self.state.log.rotate(&dotlock_settings)?;
                self.new_log_seq = self.state.log.header().file_seq;
                self.new_log_offset = midx_log::header::HEADER_SIZE as u64;
                self.working.header.log_file_seq = self.new_log_seq;
                self.working.header.log_file_tail_offset = self.new_log_offset as u32;
                self.working.header.log_file_head_offset = self.new_log_offset as u32;
                self.working.log_seq = self.new_log_seq;
                self.working.log_offset = self.new_log_offset;
                tracing::debug!(path = %self.index.main_path().display(), new_seq = self.new_log_seq, "rotated transaction log");
            }
        }

        if let Some(cache) = self.state.cache.as_ref() {
            if cache.needs_compression() {
                tracing::debug!(path = %self.index.cache_path().display(), "cache file due for compression");
            }
        }

        self.state.snapshot = Arc::new(self.working);
        Ok(())
    }

    pub fn rollback(self) {
        // MutexGuard and FcntlGuard both drop here; log_file_tail_offset
        // never advances, so the next sync_begin sees the same work again.
    }
}

pub fn sync_begin(index: &Index, flags: SyncFlags) -> Result<SyncOutcome<'_>> {
    let mut state = index.state.lock().expect("index mutex poisoned");
    let fcntl_guard = state.log.lock_write(index.lock_timeout())?;

    let base = state.snapshot.clone();
    let tail = state.log.size()?;
    let head_seq = state.log.header().file_seq;
    let cache_needs_compression = state.cache.as_ref().map(|c| c.needs_compression()).unwrap_or(false);

    let needs_work = base.log_seq < head_seq || base.log_offset < tail || flags.force || cache_needs_compression;
    if !needs_work {
        return Ok(SyncOutcome::NoOp);
    }

    let read_records = state.log.read_forward(base.log_offset)?;
    let new_log_offset = tail;

    let mut working = (*base).clone();
    let mut last_ext_id: Option<ExtId> = None;
    let mut pending: Vec<(u32, SyncRec)> = Vec::new();
    let mut append_lo: Option<u32> = None;
    let mut append_hi: Option<u32> = None;

    for rr in &read_records {
        collect_sync_rec(&rr.record, &mut pending, &mut append_lo, &mut append_hi);
        apply_record(&mut working, &rr.record, &mut last_ext_id);
    }

    working.records.sort_by_key(|r| r.uid);
    working.header.messages_count = working.records.len() as u32;
    working.header.keywords_mask_size = working.keywords.mask_size();
    if let Some(last) = working.records.last() {
        if working.header.next_uid <= last.uid {
            working.header.next_uid = last.uid + 1;
        }
    }

    pending.sort_by_key(|(uid1, _)| *uid1);
    let mut recs: VecDeque<SyncRec> = pending.into_iter().map(|(_, r)| r).collect();
    if let (Some(lo), Some(hi)) = (append_lo, append_hi) {
        recs.push_back(SyncRec::Append { uid1: lo, uid2: hi });
    }

    Ok(SyncOutcome::Sync(SyncCtx {
        index,
        state,
        _fcntl_guard: fcntl_guard,
        working,
        recs,
        new_log_seq: head_seq,
        new_log_offset,
        ext_updates: Vec::new(),
    }))
}

fn collect_sync_rec(record: &LogRecord, out: &mut Vec<(u32, SyncRec)>, append_lo: &mut Option<u32>, append_hi: &mut Option<u32>) {
    match record {
        LogRecord::Append { records } => {
            for r in records {
                *append_lo = Some(append_lo.map_or(r.uid, |lo| lo.min(r.uid)));
                *append_hi = Some(append_hi.map_or(r.uid, |hi| hi.max(r.uid)));
            }
        }
        LogRecord::Expunge { ranges } => {
            for r in ranges {
                out.push((r.uid1, SyncRec::Expunge { uid1: r.uid1, uid2: r.uid2 }));
            }
        }
        LogRecord::FlagUpdate { updates } => {
            for u in updates {
                out.push((
                    u.uid1,
                    SyncRec::FlagUpdate {
                        uid1: u.uid1,
                        uid2: u.uid2,
                        add_flags: u.add_flags,
                        remove_flags: u.remove_flags,
                    },
                ));
            }
        }
        LogRecord::KeywordUpdate { modify, name, ranges } => {
            for r in ranges {
                out.push((
                    r.uid1,
                    SyncRec::KeywordUpdate {
                        modify: *modify,
                        name: name.clone(),
                        uid1: r.uid1,
                        uid2: r.uid2,
                    },
                ));
            }
        }
        LogRecord::KeywordReset { ranges } => {
            for r in ranges {
                out.push((r.uid1, SyncRec::KeywordReset { uid1: r.uid1, uid2: r.uid2 }));
            }
        }
        LogRecord::HeaderUpdate { .. } | LogRecord::ExtIntro { .. } | LogRecord::ExtReset { .. } | LogRecord::ExtHdrUpdate { .. } | LogRecord::ExtRecUpdate { .. } => {
            // Not surfaced to the backend: these mutate index-internal or
            // extension state the backend doesn't own.
        }
    }
}

/// Apply one log record to a working snapshot being rebuilt by either
/// `sync_begin` or `fsck`. `last_ext_id` tracks the most recently
/// introduced extension in this replay pass, since `ExtReset` (like the
/// wire format it mirrors) doesn't carry its own ext id.
fn apply_record(working: &mut Snapshot, record: &LogRecord, last_ext_id: &mut Option<ExtId>) {
    match record {
        LogRecord::Append { records } => {
            for r in records {
                working.records.push(IndexRecord {
                    uid: r.uid,
                    flags: r.flags,
                    keywords: r.keywords.clone(),
                });
            }
        }
        LogRecord::Expunge { ranges } => {
            for r in ranges {
                working.records.retain(|rec| !(rec.uid >= r.uid1 && rec.uid <= r.uid2));
            }
        }
        LogRecord::FlagUpdate { updates } => {
            for u in updates {
                for rec in working.records.iter_mut() {
                    if rec.uid >= u.uid1 && rec.uid <= u.uid2 {
                        rec.flags |= u.add_flags;
                        rec.flags &= !u.remove_flags;
                    }
                }
            }
        }
        LogRecord::KeywordUpdate { modify, name, ranges } => {
            let idx = working.keywords.register(name);
            for r in ranges {
                for rec in working.records.iter_mut() {
                    if rec.uid >= r.uid1 && rec.uid <= r.uid2 {
                        match modify {
                            KeywordModify::Add => Keywords::set_bit(&mut rec.keywords, idx),
                            KeywordModify::Remove => Keywords::clear_bit(&mut rec.keywords, idx),
                        }
                    }
                }
            }
        }
        LogRecord::KeywordReset { ranges } => {
            for r in ranges {
                for rec in working.records.iter_mut() {
                    if rec.uid >= r.uid1 && rec.uid <= r.uid2 {
                        rec.keywords.clear();
                    }
                }
            }
        }
        LogRecord::HeaderUpdate { offset, data } => {
            let mut buf = working.header.encode();
            let off = *offset as usize;
            if off + data.len() <= buf.len() {
                buf[off..off + data.len()].copy_from_slice(data);
                if let Ok(h) = IndexHeader::decode(&buf) {
                    working.header = h;
                }
            }
        }
        LogRecord::ExtIntro {
            reset_id,
            name,
            hdr_size,
            record_size,
            record_align,
            ..
        } => {
            let id = working.ext_registry.intro(name, *hdr_size, *record_size, *record_align);
            working.ext_registry.reset(id, *reset_id);
            *last_ext_id = Some(id);
        }
        LogRecord::ExtReset { new_reset_id } => {
            if let Some(id) = *last_ext_id {
                working.ext_registry.reset(id, *new_reset_id);
                working.ext_record_data.remove(&id);
                working.ext_header_data.remove(&id);
            }
        }
        LogRecord::ExtHdrUpdate { ext_id, offset, data } => {
            let buf = working.ext_header_data.entry(*ext_id).or_default();
            let off = *offset as usize;
            if buf.len() < off + data.len() {
                buf.resize(off + data.len(), 0);
            }
            buf[off..off + data.len()].copy_from_slice(data);
        }
        LogRecord::ExtRecUpdate { updates } => {
            for u in updates {
                working.ext_record_data.entry(u.ext_id).or_default().insert(u.uid, u.payload.clone());
            }
        }
    }
}

/// Replay the whole log, from its own start, over a fresh header with the
/// given `indexid`. Shared by `fsck` (repairing an already-open `Index`) and
/// `Index::open`'s corruption path (repairing before an `Index` exists).
pub(crate) fn rebuild_snapshot_from_log(log: &midx_log::LogFile, indexid: u32) -> Result<Snapshot> {
    let mut working = Snapshot {
        header: IndexHeader::new(indexid, 0),
        records: Vec::new(),
        keywords: Keywords::default(),
        ext_registry: Default::default(),
        ext_header_data: HashMap::new(),
        ext_record_data: HashMap::new(),
        log_seq: log.header().file_seq,
        log_offset: midx_log::header::HEADER_SIZE as u64,
    };

    let mut last_ext_id = None;
    let all = log.read_forward(midx_log::header::HEADER_SIZE as u64)?;
    for rr in &all {
        apply_record(&mut working, &rr.record, &mut last_ext_id);
    }
    working.records.sort_by_key(|r| r.uid);
    working.header.messages_count = working.records.len() as u32;
    working.header.keywords_mask_size = working.keywords.mask_size();
    if let Some(last) = working.records.last() {
        if working.header.next_uid <= last.uid {
            working.header.next_uid = last.uid + 1;
        }
    }
    let tail = log.size()?;
    working.header.log_file_seq = log.header().file_seq;
    working.header.log_file_tail_offset = tail as u32;
    working.header.log_file_head_offset = tail as u32;
    working.log_seq = working.header.log_file_seq;
    working.log_offset = tail;
    working.check_uid_monotonicity()?;
    Ok(working)
}

/// Rebuild the in-memory snapshot from scratch by replaying the whole log
/// over a fresh header, then persist it. Used when the main index file (or
/// its invariants) can't be trusted.
pub fn fsck(index: &Index) -> Result<()> {
    let mut state = index.state.lock().expect("index mutex poisoned");
    let _guard = state.log.lock_write(index.lock_timeout())?;

    let indexid = state.snapshot.header.indexid.max(1);
    tracing::error!(indexid, "running fsck: rebuilding index from full log replay");

    let working = rebuild_snapshot_from_log(&state.log, indexid)?;

    layout::write_index_file(
        index.main_path(),
        &working.header,
        &working.records,
        &working.keywords,
        &working.ext_registry,
        &working.ext_header_data,
        &working.ext_record_data,
    )?;

    state.fsck_log_head = Some((working.header.log_file_seq, working.log_offset));
    state.snapshot = Arc::new(working);
    Ok(())
}

/// The expensive fsck path (§4.4): the log itself can no longer be
/// trusted, so there is nothing left to replay. UIDVALIDITY changes,
/// every record is reassigned a fresh UID in the backend's own
/// enumeration order, and both the index and the log are recreated from
/// scratch. Keyword names and extension registrations do not survive this
/// — there is nothing left to recover them from.
pub fn rebuild_from_backend(index: &Index, backend: &dyn crate::backend::Backend) -> Result<()> {
    let mut state = index.state.lock().expect("index mutex poisoned");
    let _guard = state.log.lock_write(index.lock_timeout())?;

    // UIDVALIDITY must actually change (§3): a bare timestamp can collide
    // with the current one if this runs within the same wall-clock second,
    // so bump past it explicitly rather than trust timer resolution alone.
    let new_indexid = crate::index::now_stamp().max(state.snapshot.header.indexid + 1);
    tracing::error!(new_uid_validity = new_indexid, "transaction log unusable: rebuilding from backend enumeration");

    let messages = backend.enumerate()?;
    let mut header = IndexHeader::new(new_indexid, 0);
    let mut records: Vec<IndexRecord> = messages
        .into_iter()
        .enumerate()
        .map(|(i, m)| IndexRecord {
            uid: i as u32 + 1,
            flags: m.flags,
            keywords: Vec::new(),
        })
        .collect();
    records.sort_by_key(|r| r.uid);
    header.messages_count = records.len() as u32;
    header.next_uid = records.last().map(|r| r.uid + 1).unwrap_or(1);

    layout::write_index_file(
        index.main_path(),
        &header,
        &records,
        &Keywords::default(),
        &Default::default(),
        &HashMap::new(),
        &HashMap::new(),
    )?;

    drop(_guard);
    let fsync = index.config().log.fsync;
    let new_log = midx_log::LogFile::recreate(index.main_path(), new_indexid, fsync)?;
    header.log_file_seq = new_log.header().file_seq;
    header.log_file_tail_offset = midx_log::header::HEADER_SIZE as u32;
    header.log_file_head_offset = midx_log::header::HEADER_SIZE as u32;

    state.snapshot = Arc::new(Snapshot {
        header,
        records,
        keywords: Keywords::default(),
        ext_registry: Default::default(),
        ext_header_data: HashMap::new(),
        ext_record_data: HashMap::new(),
        log_seq: new_log.header().file_seq,
        log_offset: midx_log::header::HEADER_SIZE as u64,
    });
    state.log = new_log;
    state.fsck_log_head = None;

    // The cache is keyed by UID via the main index's extension slot; once
    // UIDVALIDITY changes every cached entry is for a UID that no longer
    // means the same message, so the cache starts over empty too.
    let _ = std::fs::remove_file(index.cache_path());
    state.cache = midx_cache::CacheFile::create(index.cache_path(), new_indexid).ok();

    Ok(())
}
