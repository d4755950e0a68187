//! Update transactions racing on several threads while readers watch.
//!
//! Transfers between accounts keep the total balance constant, so any
//! snapshot a reader sees must add up to the same total.

#![allow(missing_docs)]

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;

use immustore::db::{Database, DbOptions, IndexSpec, Transaction};
use immustore::storage::btree::BtreeOptions;
use immustore::storage::chunked::MIN_CHUNK_SIZE;
use immustore::storage::{Record, RecordBuilder, StorageOptions};
use immustore::StoreError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

const ACCOUNTS: i64 = 40;
const INITIAL: i64 = 1_000;
const WRITERS: usize = 4;
const TRANSFERS: usize = 60;

fn options() -> DbOptions {
    DbOptions::default()
        .storage(StorageOptions::default().chunk_size(MIN_CHUNK_SIZE * 16))
        .btree(BtreeOptions::default().max_node_size(8))
        .sync_on_commit(false)
}

fn account(id: i64, balance: i64) -> Record {
    RecordBuilder::new().add_int(id).add_int(balance).build()
}

fn id(v: i64) -> Record {
    RecordBuilder::new().add_int(v).build()
}

fn setup(db: &Database) {
    let mut ex = db.exclusive_transaction().expect("exclusive");
    ex.create_table("accounts", &[IndexSpec::new([0], true)])
        .expect("create");
    for i in 0..ACCOUNTS {
        ex.add_record("accounts", account(i, INITIAL)).expect("add");
    }
    ex.complete().expect("complete");
}

fn total<T: Transaction>(txn: &T) -> i64 {
    txn.iter("accounts", &[0], Bound::Unbounded, Bound::Unbounded)
        .expect("iter")
        .map(|item| {
            let (_, adr) = item.expect("item");
            txn.get_record(adr).expect("record").get_int(1).expect("balance")
        })
        .sum()
}

/// Moves `amount` from `from` to `to`. Returns false on a conflict.
fn transfer(db: &Database, from: i64, to: i64, amount: i64) -> bool {
    let mut txn = db.update_transaction().expect("update");
    let (a, ra) = txn.lookup("accounts", &[0], &id(from)).expect("lookup").expect("from");
    let (b, rb) = txn.lookup("accounts", &[0], &id(to)).expect("lookup").expect("to");
    let ba = ra.get_int(1).expect("balance");
    let bb = rb.get_int(1).expect("balance");
    txn.update_record("accounts", a, account(from, ba - amount))
        .expect("debit");
    txn.update_record("accounts", b, account(to, bb + amount))
        .expect("credit");
    txn.complete().expect("complete").is_none()
}

#[test]
fn transfers_preserve_total_under_contention() {
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path().join("bank.db"), options()).expect("open");
    setup(&db);

    let barrier = Arc::new(Barrier::new(WRITERS + 1));
    let done = Arc::new(AtomicBool::new(false));
    let conflicts = Arc::new(AtomicU64::new(0));

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            let conflicts = Arc::clone(&conflicts);
            thread::spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(w as u64);
                barrier.wait();
                let mut committed = 0;
                while committed < TRANSFERS {
                    let from = rng.gen_range(0..ACCOUNTS);
                    let to = (from + rng.gen_range(1..ACCOUNTS)) % ACCOUNTS;
                    if transfer(&db, from, to, rng.gen_range(1..50)) {
                        committed += 1;
                    } else {
                        conflicts.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    let reader = {
        let db = db.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut snapshots = 0u64;
            while !done.load(Ordering::Acquire) {
                let txn = db.read_transaction();
                assert_eq!(total(&txn), ACCOUNTS * INITIAL, "at commit {}", txn.commit_seq());
                snapshots += 1;
            }
            snapshots
        })
    };

    barrier.wait();
    for writer in writers {
        writer.join().expect("writer");
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().expect("reader") > 0);

    let txn = db.read_transaction();
    assert_eq!(total(&txn), ACCOUNTS * INITIAL);
    // The schema commit is number 1; every successful transfer adds one.
    assert_eq!(txn.commit_seq(), 1 + (WRITERS * TRANSFERS) as u64);
    assert!(db.full_check().expect("full").ok);
}

#[test]
fn stale_snapshot_loses_to_committed_writer() {
    let db = Database::open_in_memory(options()).expect("open");
    setup(&db);

    let mut slow = db.update_transaction().expect("slow");
    let (adr, rec) = slow.lookup("accounts", &[0], &id(3)).expect("lookup").expect("row");
    let balance = rec.get_int(1).expect("balance");

    assert!(transfer(&db, 3, 4, 100));

    slow.update_record("accounts", adr, account(3, balance + 1))
        .expect("update");
    let conflict = slow.complete().expect("complete").expect("conflict");
    assert_eq!(conflict.table, "accounts");
    assert_eq!(total(&db.read_transaction()), ACCOUNTS * INITIAL);
}

#[test]
fn exclusive_fails_fast_while_another_thread_updates() {
    let db = Database::open_in_memory(options()).expect("open");
    setup(&db);
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = {
        let db = db.clone();
        thread::spawn(move || {
            let txn = db.update_transaction().expect("update");
            started_tx.send(()).expect("send");
            release_rx.recv().expect("recv");
            drop(txn);
        })
    };
    started_rx.recv().expect("started");
    assert!(matches!(
        db.exclusive_transaction(),
        Err(StoreError::Locked(_))
    ));
    release_tx.send(()).expect("release");
    handle.join().expect("thread");
    db.exclusive_transaction().expect("free after the update ends");
}
