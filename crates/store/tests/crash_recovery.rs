//! Crash recovery tests for the dual-slot commit protocol.
//!
//! Each test builds a database file, simulates a crash at some point of the
//! commit sequence by skipping the clean close and/or editing the header, then
//! reopens the file and checks what survived.
//!
//! # Crash Points in Dual-Slot Commit
//!
//! ```text
//! WriteTransaction::commit():
//!   1. Write dirty pages                  ─┐
//!   2. SYNC                                │ Pre-header writes
//!   3. Write secondary slot + header      ─┘
//!   4. SYNC (first)                       ← slot torn: checksum fails
//!   5. Flip god byte                      ← flip lost: old slot stays primary
//!   6. Write header with flipped god byte
//!   7. SYNC (second)                      ← full commit, recovery bit set
//! ```
//!
//! A crash is simulated with `std::mem::forget`, which skips the clean close
//! and leaves the recovery bit set exactly as a killed process would.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    io::{Read as IoRead, Seek, SeekFrom, Write as IoWrite},
    path::{Path, PathBuf},
};

use bucketdb_store::{
    Error, FileBackend, HEADER_SIZE, IntegrityScrubber,
    backend::{CommitSlot, DatabaseHeader},
    db::Database,
};

const BUCKET: &[u8] = b"log";

fn key(n: u32) -> Vec<u8> {
    format!("entry-{n:06}").into_bytes()
}

/// Commits `key(n)` with a recognizable value.
fn put(db: &Database<FileBackend>, n: u32, fill: u8) {
    let mut txn = db.write().unwrap();
    txn.create_bucket_if_not_exists(BUCKET).unwrap();
    txn.insert(BUCKET, &key(n), &[fill; 64]).unwrap();
    txn.commit().unwrap();
}

fn get(db: &Database<FileBackend>, n: u32) -> Option<Vec<u8>> {
    db.read().unwrap().get(BUCKET, &key(n)).unwrap()
}

/// Drops the handle without the clean-close path, as a crash would.
fn crash(db: Database<FileBackend>) {
    std::mem::forget(db);
}

fn assert_clean(db: &Database<FileBackend>) {
    let result = IntegrityScrubber::new(db).scrub();
    assert!(result.is_clean(), "integrity errors: {:?}", result.errors);
}

/// Creates a database holding keys 1 and 2 (two commits), closed cleanly.
fn setup_two_commits(dir: &Path) -> PathBuf {
    let db_path = dir.join("crash_test.db");
    let db = Database::<FileBackend>::create(&db_path).unwrap();
    put(&db, 1, 0xAA);
    put(&db, 2, 0xBB);
    db.close().unwrap();
    db_path
}

fn read_header(path: &Path) -> (Vec<u8>, DatabaseHeader) {
    let mut file = std::fs::File::open(path).unwrap();
    let mut header_bytes = vec![0u8; HEADER_SIZE];
    file.read_exact(&mut header_bytes).unwrap();
    let header = DatabaseHeader::from_bytes(&header_bytes).unwrap();
    (header_bytes, header)
}

fn write_raw_header(path: &Path, header_bytes: &[u8]) {
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.write_all(header_bytes).unwrap();
    file.sync_all().unwrap();
}

fn write_header(path: &Path, header: &DatabaseHeader) {
    write_raw_header(path, &header.to_bytes());
}

/// Flips a byte of a slot's checksum to simulate a torn slot write.
fn corrupt_slot_checksum(header_bytes: &mut [u8], slot_index: usize) {
    // Slot 0 starts at byte 16, slot 1 at byte 80; checksum at 48..56.
    let slot_base = 16 + slot_index * CommitSlot::SIZE;
    header_bytes[slot_base + 48] ^= 0xFF;
}

// ============================================================================
// Dual-Slot Commit Protocol
// ============================================================================

/// Torn write of the inactive slot: the primary is untouched and wins.
#[test]
fn test_torn_secondary_slot_uses_primary() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = setup_two_commits(temp_dir.path());

    let (mut header_bytes, header) = read_header(&db_path);
    corrupt_slot_checksum(&mut header_bytes, header.secondary_slot_index());
    write_raw_header(&db_path, &header_bytes);

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    assert_eq!(get(&db, 1), Some(vec![0xAA; 64]));
    assert_eq!(get(&db, 2), Some(vec![0xBB; 64]));
    assert_clean(&db);
}

/// Crash after the first sync but before the god byte flip reached disk.
#[test]
fn test_lost_flip_keeps_previous_commit() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = setup_two_commits(temp_dir.path());

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    put(&db, 3, 0xCC);
    crash(db);

    // Undo the last flip: the new slot is valid but never became primary.
    let (_, mut header) = read_header(&db_path);
    header.flip_primary_slot();
    write_header(&db_path, &header);

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    assert!(get(&db, 1).is_some());
    assert!(get(&db, 2).is_some());
    assert_eq!(get(&db, 3), None, "commit 3 never became primary");
    assert_clean(&db);
}

/// Both slots valid: either god byte value opens a consistent database.
#[test]
fn test_both_slots_valid_either_selection_opens() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = setup_two_commits(temp_dir.path());

    let (_, header) = read_header(&db_path);
    assert!(header.slot(0).is_some(), "Slot 0 should verify");
    assert!(header.slot(1).is_some(), "Slot 1 should verify");

    for slot in 0..2u8 {
        let mut h = header.clone();
        h.god_byte = (h.god_byte & !DatabaseHeader::GOD_BYTE_SLOT_MASK) | slot;
        // A flip that never landed leaves the recovery bit of the commit set.
        h.set_recovery_required(true);
        write_header(&db_path, &h);

        let db = Database::<FileBackend>::open(&db_path).unwrap();
        assert!(get(&db, 1).is_some(), "key 1 missing with slot {slot} primary");
        assert_clean(&db);
    }
}

/// Torn primary slot: the previous commit in the other slot takes over.
#[test]
fn test_torn_primary_falls_back_to_secondary() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = setup_two_commits(temp_dir.path());

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    put(&db, 3, 0xCC);
    crash(db);

    let (mut header_bytes, header) = read_header(&db_path);
    corrupt_slot_checksum(&mut header_bytes, header.primary_slot_index());
    write_raw_header(&db_path, &header_bytes);

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    assert!(get(&db, 2).is_some());
    assert_eq!(get(&db, 3), None);
    assert_clean(&db);

    // New commits overwrite the torn slot and survive a reopen.
    put(&db, 4, 0xDD);
    db.close().unwrap();

    let (_, header) = read_header(&db_path);
    assert!(header.slot(0).is_some() && header.slot(1).is_some());

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    assert_eq!(get(&db, 4), Some(vec![0xDD; 64]));
    assert_eq!(get(&db, 3), None);
    assert_clean(&db);
}

#[test]
fn test_both_slots_corrupt_returns_error() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = setup_two_commits(temp_dir.path());

    let (mut header_bytes, _) = read_header(&db_path);
    corrupt_slot_checksum(&mut header_bytes, 0);
    corrupt_slot_checksum(&mut header_bytes, 1);
    write_raw_header(&db_path, &header_bytes);

    let result = Database::<FileBackend>::open(&db_path);
    assert!(matches!(result, Err(Error::HeaderChecksumMismatch)));
}

#[test]
fn test_invalid_magic_is_rejected() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("not_a_db");
    std::fs::write(&db_path, vec![0x5A; HEADER_SIZE + 4096]).unwrap();

    let result = Database::<FileBackend>::open(&db_path);
    assert!(matches!(result, Err(Error::InvalidMagic)));
}

#[test]
fn test_commits_alternate_primary_slot() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("alternate.db");
    let db = Database::<FileBackend>::create(&db_path).unwrap();

    let mut primaries = Vec::new();
    for n in 0..4 {
        put(&db, n, n as u8);
        let (_, header) = read_header(&db_path);
        primaries.push(header.primary_slot_index());

        let slot = header.slot(header.primary_slot_index()).unwrap();
        assert_eq!(slot.txn_id, db.snapshot_id().raw());
    }
    assert_eq!(primaries, vec![1, 0, 1, 0]);
}

// ============================================================================
// Recovery Flag and Free List
// ============================================================================

#[test]
fn test_recovery_flag_set_by_commit_and_cleared_by_close() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("flag.db");

    let db = Database::<FileBackend>::create(&db_path).unwrap();
    assert!(!read_header(&db_path).1.recovery_required());

    put(&db, 1, 1);
    assert!(read_header(&db_path).1.recovery_required(), "commit must set the recovery bit");

    db.close().unwrap();
    let (_, header) = read_header(&db_path);
    assert!(!header.recovery_required(), "clean close must clear the recovery bit");
}

#[test]
fn test_free_list_rebuild_after_crash_allows_reuse() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("rebuild.db");

    let db = Database::<FileBackend>::create(&db_path).unwrap();
    {
        let mut txn = db.write().unwrap();
        txn.create_bucket(BUCKET).unwrap();
        txn.create_bucket(b"scratch").unwrap();
        for n in 0..500 {
            txn.insert(BUCKET, &key(n), &[1; 32]).unwrap();
            txn.insert(b"scratch", &key(n), &[2; 32]).unwrap();
        }
        txn.commit().unwrap();
    }
    {
        let mut txn = db.write().unwrap();
        txn.delete_bucket(b"scratch").unwrap();
        txn.commit().unwrap();
    }
    let total_pages = db.total_page_count();
    crash(db);

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    let stats = db.stats();
    assert!(stats.free_pages > 0, "scratch bucket pages should be free after rebuild");
    assert_eq!(stats.total_pages, total_pages);
    assert_clean(&db);

    // Writes reuse the rebuilt free list before growing the file.
    {
        let mut txn = db.write().unwrap();
        txn.create_bucket(b"scratch").unwrap();
        for n in 0..100 {
            txn.insert(b"scratch", &key(n), &[3; 32]).unwrap();
        }
        txn.commit().unwrap();
    }
    assert_eq!(db.total_page_count(), total_pages);
    assert_eq!(db.read().unwrap().iter(BUCKET).unwrap().count(), 500);
    assert_clean(&db);
}

#[test]
fn test_reopen_after_close_reuses_persisted_free_list() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("reuse.db");

    let db = Database::<FileBackend>::create(&db_path).unwrap();
    for n in 0..300 {
        put(&db, n, 9);
    }
    {
        let mut txn = db.write().unwrap();
        for n in 0..300 {
            txn.delete(BUCKET, &key(n)).unwrap();
        }
        txn.commit().unwrap();
    }
    db.close().unwrap();

    let (_, header) = read_header(&db_path);
    let slot = header.slot(header.primary_slot_index()).unwrap();
    assert_ne!(slot.freelist_page, 0);
    assert!(slot.freelist_pages >= 1);

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    let total_pages = db.total_page_count();
    assert!(db.stats().free_pages > 0);
    assert_clean(&db);

    for n in 0..50 {
        put(&db, n, 7);
    }
    assert_eq!(db.total_page_count(), total_pages, "writes should come from the free list");
    assert_clean(&db);
}

#[test]
fn test_repeated_crash_recovery() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("repeated.db");
    drop(Database::<FileBackend>::create(&db_path).unwrap());

    for round in 0..5u32 {
        let db = Database::<FileBackend>::open(&db_path).unwrap();
        for n in 0..round {
            assert_eq!(get(&db, n), Some(vec![n as u8; 64]), "round {round}, key {n}");
        }
        put(&db, round, round as u8);
        crash(db);
    }

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    assert_eq!(db.read().unwrap().iter(BUCKET).unwrap().count(), 5);
    assert_clean(&db);
}

#[test]
fn test_recovery_with_large_values() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("large.db");

    // Largest entry a 4 KiB page accepts: key + value = half the payload.
    let max_value = (4096 - 16) / 2 - key(0).len();
    {
        let db = Database::<FileBackend>::create(&db_path).unwrap();
        let mut txn = db.write().unwrap();
        txn.create_bucket(BUCKET).unwrap();
        for n in 0..20 {
            txn.insert(BUCKET, &key(n), &vec![n as u8; max_value]).unwrap();
        }
        assert!(matches!(
            txn.insert(BUCKET, &key(99), &vec![0; max_value + 1]),
            Err(Error::ValueTooLarge { .. })
        ));
        txn.commit().unwrap();
        crash(db);
    }

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    for n in 0..20 {
        assert_eq!(get(&db, n), Some(vec![n as u8; max_value]));
    }
    assert_clean(&db);
}

#[test]
fn test_page_corruption_is_detected_on_read() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("bitrot.db");
    {
        let db = Database::<FileBackend>::create(&db_path).unwrap();
        put(&db, 1, 0xAA);
        db.close().unwrap();
    }

    // Flip one content byte in every page after the header.
    let page_size = 4096u64;
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&db_path).unwrap();
    let pages = (file.metadata().unwrap().len() - HEADER_SIZE as u64) / page_size;
    assert!(pages >= 2);
    for page_id in 1..pages {
        let offset = HEADER_SIZE as u64 + page_id * page_size + 100;
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xFF;
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&byte).unwrap();
    }
    file.sync_all().unwrap();
    drop(file);

    let db = Database::<FileBackend>::open(&db_path).unwrap();
    let txn = db.read().unwrap();
    assert!(matches!(txn.get(BUCKET, &key(1)), Err(Error::PageChecksumMismatch { .. })));
    drop(txn);

    let scrub = IntegrityScrubber::new(&db).scrub();
    assert!(scrub.checksum_errors >= 1, "scrub result: {scrub:?}");
}
