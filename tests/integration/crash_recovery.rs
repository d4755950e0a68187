//! Crash and corruption recovery.
//!
//! Each test builds a database of several commits, damages the newest one on
//! disk, and checks how open, check and repair respond.

#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::Path;

use immustore::admin::{self, AdminOpenOptions};
use immustore::db::{Database, DbOptions, IndexSpec, Transaction};
use immustore::storage::btree::BtreeOptions;
use immustore::storage::chunked::MIN_CHUNK_SIZE;
use immustore::storage::{RecordBuilder, StorageOptions};
use immustore::StoreError;
use tempfile::tempdir;

const COMMITS: i64 = 12;

fn options() -> DbOptions {
    DbOptions::default()
        .storage(StorageOptions::default().chunk_size(MIN_CHUNK_SIZE))
        .btree(BtreeOptions::default().max_node_size(8))
        .sync_on_commit(false)
}

fn admin_options() -> AdminOpenOptions {
    AdminOpenOptions {
        storage: StorageOptions::default().chunk_size(MIN_CHUNK_SIZE),
        btree: BtreeOptions::default().max_node_size(8),
    }
}

/// Creates a table and makes `COMMITS` commits of ten rows each. Returns the
/// storage size after every commit, schema commit first.
fn build(path: &Path) -> Vec<u64> {
    let db = Database::open(path, options()).expect("open");
    let mut ex = db.exclusive_transaction().expect("exclusive");
    ex.create_table("events", &[IndexSpec::new([0], true)])
        .expect("create");
    ex.complete().expect("schema commit");
    let mut sizes = vec![db.storage().size()];
    for c in 0..COMMITS {
        let mut txn = db.update_transaction().expect("update");
        for i in 0..10 {
            let rec = RecordBuilder::new()
                .add_int(c * 10 + i)
                .add_str(&format!("event {c}/{i}"))
                .build();
            txn.add_record("events", rec).expect("add");
        }
        assert!(txn.complete().expect("complete").is_none());
        sizes.push(db.storage().size());
    }
    sizes
}

fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("open file");
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).expect("seek");
    std::io::Read::read_exact(&mut file, &mut byte).expect("read");
    byte[0] ^= 0xFF;
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(&byte).expect("write");
    file.sync_all().expect("sync");
}

fn row_count(db: &Database) -> usize {
    let txn = db.read_transaction();
    txn.iter("events", &[0], Bound::Unbounded, Bound::Unbounded)
        .expect("iter")
        .map(|item| item.expect("item"))
        .count()
}

#[test]
fn flipped_checksum_is_detected_and_truncated() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("events.db");
    let sizes = build(&path);
    let end = *sizes.last().expect("sizes");
    let good = sizes[sizes.len() - 2];

    // Trailer is [crc u32][size u32].
    flip_byte(&path, end - 8);

    let err = Database::open(&path, options()).err().expect("open must fail");
    assert!(matches!(err, StoreError::Corruption(_)), "{err}");

    let report = admin::check(&path, &admin_options(), true, false).expect("check");
    assert!(!report.success);
    assert!(!report.fast.ok);
    let full = report.full.expect("full report");
    assert!(!full.ok);
    assert_eq!(full.ok_size, good);
    assert_eq!(full.commits, sizes.len() as u64);

    let repaired = admin::repair(&path, &admin_options()).expect("repair");
    assert!(repaired.truncated);
    assert_eq!(repaired.new_size, good);

    let db = Database::open(&path, options()).expect("reopen");
    assert!(db.full_check().expect("full").ok);
    assert_eq!(row_count(&db), (COMMITS as usize - 1) * 10);
    assert_eq!(db.snapshot().commit_seq(), COMMITS as u64);
}

#[test]
fn repair_on_open_recovers_last_good_commit() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("events.db");
    let sizes = build(&path);
    let end = *sizes.last().expect("sizes");
    // A byte in the middle of the newest block's body.
    flip_byte(&path, (sizes[sizes.len() - 2] + end) / 2);

    let db = Database::open(&path, options().repair_on_open(true)).expect("open with repair");
    assert_eq!(db.storage().size(), sizes[sizes.len() - 2]);
    assert_eq!(row_count(&db), (COMMITS as usize - 1) * 10);

    // The repaired database accepts new commits.
    let mut txn = db.update_transaction().expect("update");
    txn.add_record("events", RecordBuilder::new().add_int(10_000).build())
        .expect("add");
    assert!(txn.complete().expect("complete").is_none());
    drop(db);

    let db = Database::open(&path, options()).expect("reopen");
    assert_eq!(row_count(&db), (COMMITS as usize - 1) * 10 + 1);
}

#[test]
fn torn_tail_is_cut_back() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("events.db");
    let sizes = build(&path);
    let end = *sizes.last().expect("sizes");
    let file = OpenOptions::new().write(true).open(&path).expect("open file");
    file.set_len(end - 16).expect("set_len");
    drop(file);

    let report = admin::check(&path, &admin_options(), true, false).expect("check");
    assert!(!report.fast.ok);
    assert_eq!(report.full.expect("full").ok_size, sizes[sizes.len() - 2]);

    admin::repair(&path, &admin_options()).expect("repair");
    let db = Database::open(&path, options()).expect("reopen");
    assert!(db.fast_check().expect("fast").ok);
    assert_eq!(row_count(&db), (COMMITS as usize - 1) * 10);
}

#[test]
fn intact_file_needs_no_repair() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("events.db");
    let sizes = build(&path);

    let report = admin::check(&path, &admin_options(), true, true).expect("check");
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.indexes.len(), 1);
    assert_eq!(report.indexes[0].keys, COMMITS as usize * 10);

    let repaired = admin::repair(&path, &admin_options()).expect("repair");
    assert!(!repaired.truncated);
    assert_eq!(repaired.new_size, *sizes.last().expect("sizes"));
    // Bootstrap commit plus the schema commit plus the data commits.
    assert_eq!(repaired.commits, sizes.len() as u64 + 1);
}

#[test]
fn admin_uses_the_chunk_size_recorded_in_the_file() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("events.db");
    let sizes = build(&path);

    // Default options name a much larger chunk than the file was built with.
    let defaults = AdminOpenOptions::default();
    assert_ne!(defaults.storage.chunk_size, MIN_CHUNK_SIZE);
    let report = admin::check(&path, &defaults, true, true).expect("check");
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.indexes[0].keys, COMMITS as usize * 10);

    let summary = admin::info(&path, &defaults).expect("info");
    assert_eq!(summary.size, *sizes.last().expect("sizes"));
    assert_eq!(summary.redirects, 0);
}
