//! `Index`: the open handle to one mailbox's four files (`<prefix>`,
//! `<prefix>.log`, `<prefix>.log.2`, `<prefix>.cache`), holding the
//! authoritative [`Snapshot`] plus the log and cache file handles behind a
//! single mutex. Mirrors the teacher's `Mailbox` / `MailboxInternal` split
//! (`aero-collections`/`src/mail/mailbox.rs`): a small public facade over
//! an internal struct guarded by one lock, generalised here from an async
//! `tokio::sync::RwLock` over a cloud-backed `Bayou<UidIndex>` to a
//! blocking `std::sync::Mutex` over local files (§5: this core is
//! single-threaded cooperative per process; the mutex only serialises
//! multiple in-process callers, cross-process exclusion is the file lock).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use midx_cache::CacheFile;
use midx_index::IndexHeader;
use midx_log::{LogFile, LogRecord};

use crate::config::MailboxConfig;
use crate::error::Result;
use crate::ext::ExtRegistry;
use crate::keywords::Keywords;
use crate::layout;
use crate::snapshot::Snapshot;

pub(crate) struct IndexState {
    pub(crate) snapshot: Arc<Snapshot>,
    pub(crate) log: LogFile,
    pub(crate) cache: Option<CacheFile>,
    /// Suppresses duplicate "corruption at X" warnings raised by repeated
    /// fsck passes triggered by the same underlying corruption.
    pub(crate) fsck_log_head: Option<(u32, u64)>,
}

pub struct Index {
    pub(crate) config: MailboxConfig,
    pub(crate) main_path: PathBuf,
    pub(crate) cache_path: PathBuf,
    pub(crate) state: Mutex<IndexState>,
}

impl Index {
    fn paths(config: &MailboxConfig) -> (PathBuf, PathBuf) {
        let stem = config.stem();
        let mut cache = stem.as_os_str().to_owned();
        cache.push(".cache");
        (stem, PathBuf::from(cache))
    }

    /// Create a brand-new mailbox's four files. `indexid` doubles as the
    /// initial `uid_validity`, matching the source's convention of deriving
    /// both from the creation timestamp.
    pub fn create(config: MailboxConfig) -> Result<Self> {
        let (main_path, cache_path) = Self::paths(&config);
        let indexid = now_stamp();

        let header = IndexHeader::new(indexid, 0);
        layout::write_index_file(
            &main_path,
            &header,
            &[],
            &Keywords::default(),
            &ExtRegistry::default(),
            &HashMap::new(),
            &HashMap::new(),
        )?;

        let log = LogFile::create(&main_path, indexid, config.log.fsync)?;
        let cache = CacheFile::create(&cache_path, indexid)?;

        let snapshot = Arc::new(Snapshot {
            header,
            records: Vec::new(),
            keywords: Keywords::default(),
            ext_registry: ExtRegistry::default(),
            ext_header_data: HashMap::new(),
            ext_record_data: HashMap::new(),
            log_seq: log.header().file_seq,
            log_offset: midx_log::header::HEADER_SIZE as u64,
        });

        tracing::debug!(path = %main_path.display(), indexid, "created mailbox index");

        Ok(Index {
            config,
            main_path,
            cache_path,
            state: Mutex::new(IndexState {
                snapshot,
                log,
                cache: Some(cache),
                fsck_log_head: None,
            }),
        })
    }

    /// Open an existing mailbox. If the main index is corrupted (fails its
    /// own invariant checks — §4.2), this does not surface an error to the
    /// caller the way a plain read failure would: the log is still the
    /// authoritative record of every committed mutation, so §4.4's fsck path
    /// replays it from scratch into a fresh index file and opens that
    /// instead. Only a log that's *also* unusable forces the caller's hand
    /// (`LogFile::open`'s error propagates unchanged) — that's the expensive
    /// path `sync::rebuild_from_backend` exists for, and it needs a
    /// `Backend` to enumerate from, which this constructor doesn't have.
    pub fn open(config: MailboxConfig) -> Result<Self> {
        let (main_path, cache_path) = Self::paths(&config);

        match layout::read_index_file(&main_path) {
            Ok((header, records, keywords, ext_registry, ext_header_data, ext_record_data)) => {
                let log = LogFile::open(&main_path, config.log.fsync)?;
                let cache = CacheFile::open(&cache_path).ok();

                let snapshot = Arc::new(Snapshot {
                    header,
                    records,
                    keywords,
                    ext_registry,
                    ext_header_data,
                    ext_record_data,
                    log_seq: log.header().file_seq,
                    log_offset: header.log_file_tail_offset as u64,
                });

                Ok(Index {
                    config,
                    main_path,
                    cache_path,
                    state: Mutex::new(IndexState {
                        snapshot,
                        log,
                        cache,
                        fsck_log_head: None,
                    }),
                })
            }
            Err(e) => {
                tracing::error!(path = %main_path.display(), error = %e, "main index corrupted on open, rebuilding from transaction log");

                let log = LogFile::open(&main_path, config.log.fsync)?;
                let indexid = log.header().indexid.max(1);
                let snapshot = crate::sync::rebuild_snapshot_from_log(&log, indexid)?;

                layout::write_index_file(
                    &main_path,
                    &snapshot.header,
                    &snapshot.records,
                    &snapshot.keywords,
                    &snapshot.ext_registry,
                    &snapshot.ext_header_data,
                    &snapshot.ext_record_data,
                )?;

                let fsck_log_head = Some((snapshot.header.log_file_seq, snapshot.log_offset));
                let cache = CacheFile::open(&cache_path).ok();

                Ok(Index {
                    config,
                    main_path,
                    cache_path,
                    state: Mutex::new(IndexState {
                        snapshot: Arc::new(snapshot),
                        log,
                        cache,
                        fsck_log_head,
                    }),
                })
            }
        }
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.state.lock().expect("index mutex poisoned").snapshot.clone()
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    pub fn main_path(&self) -> &std::path::Path {
        &self.main_path
    }

    pub fn cache_path(&self) -> &std::path::Path {
        &self.cache_path
    }

    /// `ext_register(index, name, hdr_size, record_size) -> ext_id`: commits
    /// an `EXT_INTRO` record immediately (outside of any caller transaction)
    /// and applies it to the in-memory registry right away, since extension
    /// declarations are rare, process-wide, and other state doesn't depend
    /// on their ordering beyond "first writer wins" (§9).
    pub fn register_ext(&self, name: &str, hdr_size: u32, record_size: u32, record_align: u8) -> Result<crate::ext::ExtId> {
        let mut state = self.state.lock().expect("index mutex poisoned");
        if let Some(id) = state.snapshot.ext_registry.find(name) {
            return Ok(id);
        }

        let record = LogRecord::ExtIntro {
            ext_id_in_file: state.snapshot.ext_registry.len() as u32,
            reset_id: 0,
            name: name.to_string(),
            hdr_size,
            record_size,
            record_align,
        };
        state.log.append(&[(record, false)])?;

        let mut snapshot = (*state.snapshot).clone();
        let id = snapshot.ext_registry.intro(name, hdr_size, record_size, record_align);
        state.snapshot = Arc::new(snapshot);
        Ok(id)
    }

    /// Append already-serialised log records, returning the log's new
    /// `(file_seq, tail_offset)` for the caller (e.g. a committed
    /// transaction) to report back.
    pub(crate) fn append_log(state: &mut IndexState, records: &[(LogRecord, bool)]) -> Result<(u32, u64)> {
        let offset = state.log.append(records)?;
        Ok((state.log.header().file_seq, offset))
    }

    pub fn lock_timeout(&self) -> Duration {
        self.config.locking.fcntl_timeout
    }

    /// Reopen the main index file, e.g. after a replacing rewrite by
    /// another process that this one hasn't noticed yet. Cheap escape
    /// hatch used by `fsck`.
    pub(crate) fn reload_main_file(&self) -> Result<File> {
        Ok(OpenOptions::new().read(true).write(true).open(&self.main_path)?)
    }
}

pub(crate) fn now_stamp() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(1)
}
