//! Data written through every transaction kind survives reopening.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

use immustore::db::{Database, DbOptions, IndexSpec, Transaction};
use immustore::storage::btree::BtreeOptions;
use immustore::storage::chunked::MIN_CHUNK_SIZE;
use immustore::storage::{Record, RecordBuilder, StorageOptions};
use immustore::{Address, StoreError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::tempdir;

fn options() -> DbOptions {
    DbOptions::default()
        .storage(StorageOptions::default().chunk_size(MIN_CHUNK_SIZE * 4))
        .btree(BtreeOptions::default().max_node_size(6))
        .sync_on_commit(false)
}

fn row(k: i64, v: i64) -> Record {
    RecordBuilder::new().add_int(k).add_int(v).build()
}

fn int(v: i64) -> Record {
    RecordBuilder::new().add_int(v).build()
}

fn create(path: &Path) -> Database {
    let db = Database::open(path, options()).expect("open");
    let mut ex = db.exclusive_transaction().expect("exclusive");
    ex.create_table(
        "kv",
        &[IndexSpec::new([0], true), IndexSpec::new([1, 0], false)],
    )
    .expect("create");
    ex.complete().expect("complete");
    db
}

/// Every `(key, value)` pair in primary-index order.
fn contents(db: &Database) -> Vec<(i64, i64)> {
    let txn = db.read_transaction();
    txn.iter("kv", &[0], Bound::Unbounded, Bound::Unbounded)
        .expect("iter")
        .map(|item| {
            let (_, adr) = item.expect("item");
            let rec = txn.get_record(adr).expect("record");
            (rec.get_int(0).expect("k"), rec.get_int(1).expect("v"))
        })
        .collect()
}

#[test]
fn random_workload_matches_model_across_reopens() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("kv.db");
    let mut model: BTreeMap<i64, i64> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED_CAFE);
    drop(create(&path));

    for round in 0..6 {
        let db = Database::open(&path, options()).expect("reopen");
        assert_eq!(contents(&db), model.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>());
        for _ in 0..8 {
            let mut txn = db.update_transaction().expect("update");
            for _ in 0..20 {
                let k = rng.gen_range(0..300);
                let v = rng.gen_range(0..1_000);
                match txn.lookup("kv", &[0], &int(k)).expect("lookup") {
                    Some((adr, _)) if rng.gen_bool(0.4) => {
                        txn.remove_record("kv", adr).expect("remove");
                        model.remove(&k);
                    }
                    Some((adr, _)) => {
                        txn.update_record("kv", adr, row(k, v)).expect("update");
                        model.insert(k, v);
                    }
                    None => {
                        txn.add_record("kv", row(k, v)).expect("add");
                        model.insert(k, v);
                    }
                }
            }
            assert!(txn.complete().expect("complete").is_none(), "round {round}");
        }
        let info = db.read_transaction().table_info("kv").expect("info");
        assert_eq!(info.nrows, model.len() as u64);
    }

    let db = Database::open(&path, options()).expect("final reopen");
    assert_eq!(contents(&db), model.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>());
    assert!(db.full_check().expect("full").ok);

    // The secondary index orders by value, then key.
    let txn = db.read_transaction();
    let by_value: Vec<(i64, i64)> = txn
        .iter("kv", &[1, 0], Bound::Unbounded, Bound::Unbounded)
        .expect("iter")
        .map(|item| {
            let (k, _) = item.expect("item");
            (k.get_int(1).expect("k"), k.get_int(0).expect("v"))
        })
        .collect();
    let mut expected: Vec<(i64, i64)> = model.iter().map(|(k, v)| (*k, *v)).collect();
    expected.sort_by_key(|(k, v)| (*v, *k));
    assert_eq!(by_value, expected);
}

#[test]
fn bulk_load_and_schema_survive_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("bulk.db");
    {
        let db = create(&path);
        let mut ex = db.exclusive_transaction().expect("exclusive");
        for k in 0..2_000 {
            ex.add_record("kv", row(k, k % 17)).expect("add");
        }
        ex.create_table("empty", &[IndexSpec::new([0], false)])
            .expect("create");
        ex.complete().expect("complete");
    }
    let db = Database::open(&path, options()).expect("reopen");
    let state = db.snapshot();
    let names: Vec<&str> = state.schema().tables().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["empty", "kv"]);
    let txn = db.read_transaction();
    assert_eq!(txn.table_info("kv").expect("info").nrows, 2_000);
    let sevens = txn
        .iter("kv", &[1, 0], Bound::Included(int(7)), Bound::Included(int(7)))
        .expect("iter")
        .count();
    assert_eq!(sevens, (0..2_000).filter(|k| k % 17 == 7).count());
    let (adr, rec) = txn.lookup("kv", &[0], &int(1_234)).expect("lookup").expect("row");
    assert!(!adr.is_intref());
    assert_ne!(adr, Address::NULL);
    assert_eq!(rec.get_int(1).expect("v"), 1_234 % 17);
    assert!(txn
        .iter("empty", &[0], Bound::Unbounded, Bound::Unbounded)
        .expect("iter")
        .next()
        .is_none());
}

#[test]
fn missing_file_is_not_created_when_asked() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("absent.db");
    let err = Database::open(&path, options().create_if_missing(false))
        .err()
        .expect("must fail");
    assert!(matches!(err, StoreError::NotFound(_)));
    assert!(!path.exists());
}

#[test]
fn reopening_with_another_chunk_size_is_refused() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("chunks.db");
    {
        let db = create(&path);
        let mut txn = db.update_transaction().expect("update");
        txn.add_record("kv", row(1, 2)).expect("add");
        assert!(txn.complete().expect("complete").is_none());
    }
    let other = options().storage(StorageOptions::default().chunk_size(MIN_CHUNK_SIZE * 8));
    let err = Database::open(&path, other.clone()).err().expect("must fail");
    assert!(
        matches!(
            err,
            StoreError::ChunkSize { recorded, requested }
                if recorded == MIN_CHUNK_SIZE * 4 && requested == MIN_CHUNK_SIZE * 8
        ),
        "{err}"
    );

    let db = Database::open(&path, other.adopt_chunk_size(true)).expect("adopt");
    assert_eq!(db.storage().chunk_size(), MIN_CHUNK_SIZE * 4);
    assert_eq!(contents(&db), vec![(1, 2)]);
    assert!(db.full_check().expect("full").ok);
}
