//! End-to-end scenarios S1-S6, driven entirely through the public
//! `View`/`Transaction`/`sync` API the way a mailbox backend would.

use midx::backend::{Backend, EnumeratedMessage};
use midx::sync::{sync_begin, SyncFlags, SyncOutcome};
use midx::{FlagModify, Index, KeywordsHandle, MailboxConfig, Transaction, TransactionFlags, View};
use midx_index::flags::Flag;
use midx_log::KeywordModify;

fn open(dir: &tempfile::TempDir) -> Index {
    let config = MailboxConfig::new(dir.path());
    Index::create(config).unwrap()
}

fn sync_all(index: &Index) {
    loop {
        match sync_begin(index, SyncFlags::default()).unwrap() {
            SyncOutcome::NoOp => break,
            SyncOutcome::Sync(mut ctx) => {
                while ctx.next().is_some() {}
                ctx.commit().unwrap();
            }
        }
    }
}

#[test]
fn s1_append_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let index = open(&dir);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    for _ in 0..3 {
        txn.append(0);
    }
    txn.commit(&index).unwrap();
    sync_all(&index);

    let view = View::open(&index).unwrap();
    assert_eq!(view.messages_count(), 3);
    assert_eq!(view.next_uid(), 4);
    let uids: Vec<u32> = (1..=3).map(|seq| view.lookup_uid(seq).unwrap()).collect();
    assert_eq!(uids, vec![1, 2, 3]);
}

#[test]
fn s2_flag_replay_visible_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let index = open(&dir);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    for _ in 0..3 {
        txn.append(0);
    }
    txn.commit(&index).unwrap();
    sync_all(&index);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags { external: true, ..Default::default() });
    txn.update_flags(2, 2, FlagModify::Add, Flag::Seen as u8);
    txn.commit(&index).unwrap();
    sync_all(&index);

    // A second process opening the same files sees the durable result.
    let config = MailboxConfig::new(dir.path());
    let reopened = Index::open(config).unwrap();
    let view = View::open(&reopened).unwrap();
    let rec = view.lookup(2).unwrap();
    assert_eq!(rec.uid, 2);
    assert_eq!(rec.flags & Flag::Seen as u8, Flag::Seen as u8);
}

#[test]
fn s3_expunge_mid_range() {
    let dir = tempfile::tempdir().unwrap();
    let index = open(&dir);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    for _ in 0..3 {
        txn.append(0);
    }
    txn.commit(&index).unwrap();
    sync_all(&index);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    txn.expunge(2, 2);
    txn.commit(&index).unwrap();
    sync_all(&index);

    let view = View::open(&index).unwrap();
    assert_eq!(view.messages_count(), 2);
    let uids: Vec<u32> = (1..=2).map(|seq| view.lookup_uid(seq).unwrap()).collect();
    assert_eq!(uids, vec![1, 3]);
    assert_eq!(view.next_uid(), 4);
}

#[test]
fn s4_cache_round_trip_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let index = open(&dir);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    for _ in 0..3 {
        txn.append(0);
    }
    txn.commit(&index).unwrap();
    sync_all(&index);

    let field_ids = index
        .register_cache_fields(&[midx::FieldMeta::new("hdr.date", 4, 0)])
        .unwrap();
    let field_id = field_ids[0];
    let cache_ext = index.cache_offset_ext().unwrap();

    let view = View::open(&index).unwrap();
    let mut cache_txn = index.open_cache_transaction();
    midx::cache_add(&view, &mut cache_txn, 3, field_id, 0x44332211u32.to_le_bytes().to_vec());

    match sync_begin(&index, SyncFlags { force: true, ..Default::default() }).unwrap() {
        SyncOutcome::Sync(mut ctx) => {
            while ctx.next().is_some() {}
            if let Some(txn) = cache_txn.as_mut() {
                ctx.flush_cache_transaction(cache_ext, txn).unwrap();
            }
            ctx.commit().unwrap();
        }
        SyncOutcome::NoOp => panic!("expected cache flush to require a sync pass"),
    }

    let config = MailboxConfig::new(dir.path());
    let reopened = Index::open(config).unwrap();
    let view = View::open(&reopened).unwrap();
    let value = midx::cache_lookup_field(&reopened, &view, 3, field_id).unwrap();
    assert_eq!(value, Some(0x44332211u32.to_le_bytes().to_vec()));
}

#[test]
fn s5_log_rotation_chains_and_replays() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MailboxConfig::new(dir.path());
    config.log.log_rotate_size = 256;
    config.log.log_rotate_min_created_ago = std::time::Duration::from_secs(0);
    let index = Index::create(config).unwrap();

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    txn.append(0);
    txn.commit(&index).unwrap();
    sync_all(&index);

    for _ in 0..200 {
        let view = View::open(&index).unwrap();
        let mut txn = Transaction::new(&view, TransactionFlags::default());
        txn.update_flags(1, 1, FlagModify::Replace, Flag::Seen as u8);
        txn.commit(&index).unwrap();
    }
    sync_all(&index);

    let view = View::open(&index).unwrap();
    assert_eq!(view.messages_count(), 1);
    assert_eq!(view.lookup_uid(1), Some(1));
}

struct FixedEnumeration(Vec<EnumeratedMessage>);

impl Backend for FixedEnumeration {
    fn enumerate(&self) -> midx::Result<Vec<EnumeratedMessage>> {
        Ok(self
            .0
            .iter()
            .map(|m| EnumeratedMessage {
                backend_key: m.backend_key.clone(),
                flags: m.flags,
            })
            .collect())
    }
    fn read(&self, _backend_key: &str) -> midx::Result<Vec<u8>> {
        Ok(Vec::new())
    }
    fn write(&self, _uid: u32, _data: &[u8]) -> midx::Result<String> {
        Ok(String::new())
    }
    fn update_flags(&self, _backend_key: &str, _add: u8, _remove: u8) -> midx::Result<()> {
        Ok(())
    }
    fn expunge(&self, _backend_key: &str) -> midx::Result<()> {
        Ok(())
    }
}

#[test]
fn s6_corrupted_header_recovers_from_log_replay() {
    let dir = tempfile::tempdir().unwrap();
    let index = open(&dir);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    for _ in 0..3 {
        txn.append(0);
    }
    txn.commit(&index).unwrap();
    sync_all(&index);
    drop(index);

    // Corrupt the main index header's messages_count in place. The
    // transaction log on disk is untouched, so reopening should transparently
    // rebuild the correct count from it rather than surface an error.
    let main_path = dir.path().join("dovecot.index");
    let mut bytes = std::fs::read(&main_path).unwrap();
    bytes[36..40].copy_from_slice(&0xFFFFFFFFu32.to_le_bytes());
    std::fs::write(&main_path, bytes).unwrap();

    let config = MailboxConfig::new(dir.path());
    let reopened = Index::open(config).expect("corruption in the main index alone must be repaired from the log, not surfaced as an error");
    let view = View::open(&reopened).unwrap();
    assert_eq!(view.messages_count(), 3);
    let uids: Vec<u32> = (1..=3).map(|seq| view.lookup_uid(seq).unwrap()).collect();
    assert_eq!(uids, vec![1, 2, 3]);
}

#[test]
fn s6b_unusable_log_falls_back_to_backend_enumeration() {
    let dir = tempfile::tempdir().unwrap();
    let config = MailboxConfig::new(dir.path());
    let index = Index::create(config).unwrap();

    // The expensive path (§4.4): when the log itself can't be trusted, a
    // backend enumeration is the only remaining source of truth, and
    // UIDVALIDITY must change since UIDs are reassigned from scratch.
    let old_uid_validity = View::open(&index).unwrap().uid_validity();
    let backend = FixedEnumeration(vec![
        EnumeratedMessage { backend_key: "a".into(), flags: 0 },
        EnumeratedMessage { backend_key: "b".into(), flags: Flag::Seen as u8 },
    ]);
    midx::sync::rebuild_from_backend(&index, &backend).unwrap();

    let view = View::open(&index).unwrap();
    assert_eq!(view.messages_count(), 2);
    assert_ne!(view.uid_validity(), old_uid_validity);
}

#[test]
fn s8_keyword_bitmap_sizing_by_seq() {
    let dir = tempfile::tempdir().unwrap();
    let index = open(&dir);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    for _ in 0..3 {
        txn.append(0);
    }
    txn.commit(&index).unwrap();
    sync_all(&index);

    // Expunge seq 2 (uid 2) first, so the remaining records' seq numbers no
    // longer line up with their UIDs: this is the case the documented
    // seq-based API must translate correctly rather than silently treating
    // seq as if it were uid.
    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    txn.expunge(2, 2);
    txn.commit(&index).unwrap();
    sync_all(&index);

    let view = View::open(&index).unwrap();
    assert_eq!(view.lookup_uid(1), Some(1));
    assert_eq!(view.lookup_uid(2), Some(3));

    // seq 2 here is uid 3; add keyword "a" then "c", leaving "b" unset.
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    txn.update_keywords(KeywordModify::Add, "a", 2, 2);
    txn.update_keywords(KeywordModify::Add, "b", 2, 2);
    txn.update_keywords(KeywordModify::Add, "c", 2, 2);
    txn.update_keywords(KeywordModify::Remove, "b", 2, 2);
    txn.commit(&index).unwrap();
    sync_all(&index);

    let view = View::open(&index).unwrap();
    let mut names = view.keywords_of(2);
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "c".to_string()]);

    // A concurrent registration of a brand new keyword name doesn't disturb
    // the resolved set above.
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    txn.update_keywords(KeywordModify::Add, "z", 1, 1);
    txn.commit(&index).unwrap();
    sync_all(&index);

    let view = View::open(&index).unwrap();
    let mut names = view.keywords_of(2);
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "c".to_string()]);

    // `KeywordsHandle::create` resolves only names the registry already
    // knows, read-only: "c" and "z" exist, "nope" doesn't.
    let handle = KeywordsHandle::create(&view, &["c".to_string(), "nope".to_string(), "z".to_string()]);
    assert_eq!(handle.indices.len(), 2);
}

#[test]
fn flag_modify_replace_sets_exact_bits() {
    let dir = tempfile::tempdir().unwrap();
    let index = open(&dir);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    txn.append(Flag::Answered as u8 | Flag::Draft as u8);
    txn.commit(&index).unwrap();
    sync_all(&index);

    let view = View::open(&index).unwrap();
    let mut txn = Transaction::new(&view, TransactionFlags::default());
    txn.update_flags(1, 1, FlagModify::Replace, Flag::Seen as u8);
    txn.commit(&index).unwrap();
    sync_all(&index);

    let view = View::open(&index).unwrap();
    let rec = view.lookup(1).unwrap();
    assert_eq!(rec.flags, Flag::Seen as u8);
}
