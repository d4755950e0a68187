use super::*;
use crate::storage::btree::BtreeOptions;
use crate::storage::chunked::MIN_CHUNK_SIZE;
use crate::storage::record::{Record, RecordBuilder};
use crate::storage::tran::Tran;
use crate::types::Address;
use std::io;
use std::ops::Bound;
use std::sync::atomic::AtomicBool;

fn options() -> DbOptions {
    DbOptions::default()
        .storage(StorageOptions::default().chunk_size(MIN_CHUNK_SIZE * 4))
        .btree(BtreeOptions::default().max_node_size(4))
        .sync_on_commit(false)
}

fn row(id: i64, name: &str) -> Record {
    RecordBuilder::new().add_int(id).add_str(name).build()
}

fn id(v: i64) -> Record {
    RecordBuilder::new().add_int(v).build()
}

fn name(v: &str) -> Record {
    RecordBuilder::new().add_str(v).build()
}

/// A database with table `people(id unique, name)`.
fn people_db(io: Arc<dyn FileIo>) -> Database {
    let db = Database::open_with_io(io, options()).expect("open");
    let mut ex = db.exclusive_transaction().expect("exclusive");
    ex.create_table(
        "people",
        &[IndexSpec::new([0], true), IndexSpec::new([1], false)],
    )
    .expect("create table");
    ex.complete().expect("complete");
    db
}

fn ids<T: Transaction>(txn: &T) -> Vec<i64> {
    txn.iter("people", &[0], Bound::Unbounded, Bound::Unbounded)
        .expect("iter")
        .map(|item| {
            let (_, adr) = item.expect("item");
            txn.get_record(adr).expect("record").get_int(0).expect("id")
        })
        .collect()
}

#[test]
fn committed_rows_are_visible_to_later_snapshots_only() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let before = db.read_transaction();

    let mut up = db.update_transaction().expect("update");
    for i in 0..30 {
        up.add_record("people", row(i, &format!("p{i}"))).expect("add");
    }
    assert_eq!(ids(&up).len(), 30);
    assert!(up.complete().expect("complete").is_none());

    assert!(ids(&before).is_empty());
    let after = db.read_transaction();
    assert_eq!(ids(&after), (0..30).collect::<Vec<_>>());
    let info = after.table_info("people").expect("info");
    assert_eq!(info.nrows, 30);
    assert!(info.total_size > 0);
    assert!(info.indexes[0].levels >= 1);
    assert_eq!(after.commit_seq(), before.commit_seq() + 1);
}

#[test]
fn lookup_finds_rows_by_secondary_index() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut up = db.update_transaction().expect("update");
    up.add_record("people", row(1, "ann")).expect("add");
    up.add_record("people", row(2, "bob")).expect("add");
    let (_, rec) = up.lookup("people", &[1], &name("bob")).expect("lookup").expect("found");
    assert_eq!(rec.get_int(0).expect("id"), 2);
    up.complete().expect("complete");

    let rd = db.read_transaction();
    let (_, rec) = rd.lookup("people", &[0], &id(1)).expect("lookup").expect("found");
    assert_eq!(rec.get_str(1).expect("name"), "ann");
    assert!(rd.lookup("people", &[0], &id(3)).expect("lookup").is_none());
    assert!(matches!(
        rd.iter("people", &[2], Bound::Unbounded, Bound::Unbounded),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn unique_violation_rolls_back_every_index() {
    let db = Database::open_in_memory(options()).expect("open");
    let mut ex = db.exclusive_transaction().expect("exclusive");
    // The non-unique index comes first so it is already updated when the
    // unique one rejects the row.
    ex.create_table("people", &[IndexSpec::new([1], false), IndexSpec::new([0], true)])
        .expect("create");
    ex.complete().expect("complete");

    let mut up = db.update_transaction().expect("update");
    up.add_record("people", row(1, "ann")).expect("add");
    let err = up.add_record("people", row(1, "dup")).unwrap_err();
    assert!(matches!(err, StoreError::Constraint { .. }));
    let names: Vec<String> = up
        .iter("people", &[1], Bound::Unbounded, Bound::Unbounded)
        .expect("iter")
        .map(|item| {
            let (k, _) = item.expect("item");
            k.get_str(0).expect("name").to_owned()
        })
        .collect();
    assert_eq!(names, vec!["ann".to_string()]);
    // The transaction is still usable.
    up.add_record("people", row(2, "bea")).expect("add after violation");
    assert!(up.complete().expect("complete").is_none());
    assert_eq!(db.read_transaction().table_info("people").expect("info").nrows, 2);
}

#[test]
fn update_record_keeps_old_row_on_violation() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut up = db.update_transaction().expect("update");
    let a = up.add_record("people", row(1, "ann")).expect("add");
    up.add_record("people", row(2, "bob")).expect("add");
    let err = up.update_record("people", a, row(2, "ann2")).unwrap_err();
    assert!(matches!(err, StoreError::Constraint { .. }));
    let (adr, _) = up.lookup("people", &[0], &id(1)).expect("lookup").expect("old row");
    assert_eq!(adr, a);
    let b = up.update_record("people", a, row(3, "ann3")).expect("update");
    assert_ne!(a, b);
    assert_eq!(ids(&up), vec![2, 3]);
    up.complete().expect("complete");
    assert_eq!(ids(&db.read_transaction()), vec![2, 3]);
}

#[test]
fn removing_unknown_record_aborts_transaction() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut up = db.update_transaction().expect("update");
    let a = up.add_record("people", row(1, "ann")).expect("add");
    up.remove_record("people", a).expect("remove");
    let err = up.remove_record("people", a).unwrap_err();
    assert!(matches!(err, StoreError::Invariant(_)));
    assert!(matches!(
        up.add_record("people", row(5, "x")),
        Err(StoreError::TransactionEnded)
    ));
    assert!(matches!(up.complete(), Err(StoreError::TransactionEnded)));
}

#[test]
fn read_write_overlap_is_a_conflict() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut seed = db.update_transaction().expect("seed");
    for i in [10, 20, 30] {
        seed.add_record("people", row(i, "x")).expect("add");
    }
    seed.complete().expect("complete");

    let mut t1 = db.update_transaction().expect("t1");
    let seen = t1
        .iter("people", &[0], Bound::Included(id(10)), Bound::Included(id(20)))
        .expect("iter")
        .count();
    assert_eq!(seen, 2);
    t1.add_record("people", row(100, "t1")).expect("add");

    let mut t2 = db.update_transaction().expect("t2");
    t2.add_record("people", row(15, "t2")).expect("add");
    assert!(t2.complete().expect("complete").is_none());

    let conflict = t1.complete().expect("complete").expect("conflict");
    assert_eq!(conflict.kind, ConflictKind::ReadWrite);
    assert_eq!(conflict.table, "people");
    assert_eq!(ids(&db.read_transaction()), vec![10, 15, 20, 30]);
}

#[test]
fn disjoint_transactions_both_commit() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut t1 = db.update_transaction().expect("t1");
    let mut t2 = db.update_transaction().expect("t2");
    t1.iter("people", &[0], Bound::Included(id(0)), Bound::Included(id(9)))
        .expect("iter")
        .count();
    t1.add_record("people", row(1, "a")).expect("add");
    t2.add_record("people", row(50, "b")).expect("add");
    assert!(t2.complete().expect("t2").is_none());
    assert!(t1.complete().expect("t1").is_none());
    assert_eq!(ids(&db.read_transaction()), vec![1, 50]);
}

#[test]
fn concurrent_unique_adds_conflict() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut t1 = db.update_transaction().expect("t1");
    let mut t2 = db.update_transaction().expect("t2");
    t1.add_record("people", row(7, "a")).expect("add");
    t2.add_record("people", row(7, "b")).expect("add");
    assert!(t1.complete().expect("t1").is_none());
    let conflict = t2.complete().expect("t2").expect("conflict");
    assert_eq!(conflict.kind, ConflictKind::WriteWrite);
}

#[test]
fn concurrent_deletes_conflict() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut seed = db.update_transaction().expect("seed");
    seed.add_record("people", row(1, "a")).expect("add");
    seed.complete().expect("complete");

    let mut t1 = db.update_transaction().expect("t1");
    let mut t2 = db.update_transaction().expect("t2");
    let (a1, _) = t1.lookup("people", &[0], &id(1)).expect("lookup").expect("row");
    let (a2, _) = t2.lookup("people", &[0], &id(1)).expect("lookup").expect("row");
    t1.remove_record("people", a1).expect("remove");
    t2.remove_record("people", a2).expect("remove");
    assert!(t1.complete().expect("t1").is_none());
    let conflict = t2.complete().expect("t2").expect("conflict");
    assert!(matches!(
        conflict.kind,
        ConflictKind::ReadWrite | ConflictKind::WriteWrite
    ));
    assert!(ids(&db.read_transaction()).is_empty());
}

#[test]
fn exclusive_lock_fails_fast() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let up = db.update_transaction().expect("update");
    assert!(matches!(db.exclusive_transaction(), Err(StoreError::Locked(_))));
    drop(up);
    let ex = db.exclusive_transaction().expect("exclusive");
    assert!(matches!(db.update_transaction(), Err(StoreError::Locked(_))));
    assert!(matches!(db.exclusive_transaction(), Err(StoreError::Locked(_))));
    // Reads never wait.
    assert!(ids(&db.read_transaction()).is_empty());
    drop(ex);
    db.update_transaction().expect("update after exclusive");
}

#[test]
fn exclusive_bulk_load_and_drop() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut ex = db.exclusive_transaction().expect("exclusive");
    let mut addrs = Vec::new();
    for i in 0..200 {
        addrs.push(ex.add_record("people", row(i, "bulk")).expect("add"));
    }
    assert!(matches!(
        ex.add_record("people", row(5, "dup")),
        Err(StoreError::Constraint { .. })
    ));
    for adr in addrs.iter().step_by(2) {
        ex.remove_record("people", *adr).expect("remove");
    }
    ex.create_table("tmp", &[IndexSpec::new([0], false)]).expect("create");
    assert!(matches!(
        ex.create_table("tmp", &[IndexSpec::new([0], false)]),
        Err(StoreError::Invalid(_))
    ));
    ex.complete().expect("complete");

    let rd = db.read_transaction();
    let got = ids(&rd);
    assert_eq!(got, (0..200).filter(|i| i % 2 == 1).collect::<Vec<_>>());
    assert_eq!(rd.table_info("people").expect("info").nrows, 100);
    assert_eq!(rd.state().schema().len(), 2);

    let mut ex = db.exclusive_transaction().expect("exclusive");
    ex.drop_table("tmp").expect("drop");
    assert!(matches!(ex.drop_table("tmp"), Err(StoreError::NotFound(_))));
    ex.complete().expect("complete");
    assert!(db.snapshot().schema().table("tmp").is_none());
}

#[test]
fn reopen_restores_schema_and_rows() {
    let io = Arc::new(MemFileIo::new());
    {
        let db = people_db(io.clone());
        let mut up = db.update_transaction().expect("update");
        for i in 0..50 {
            up.add_record("people", row(i, "r")).expect("add");
        }
        up.complete().expect("complete");
        let mut up = db.update_transaction().expect("update");
        let (adr, _) = up.lookup("people", &[0], &id(25)).expect("lookup").expect("row");
        up.remove_record("people", adr).expect("remove");
        up.complete().expect("complete");
    }
    let db = Database::open_with_io(io, options()).expect("reopen");
    let rd = db.read_transaction();
    let got = ids(&rd);
    assert_eq!(got.len(), 49);
    assert!(!got.contains(&25));
    assert_eq!(rd.commit_seq(), 3);
    assert!(db.fast_check().expect("fast").ok);
    assert!(db.full_check().expect("full").ok);
}

#[test]
fn rangefrac_is_reported_per_index() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut ex = db.exclusive_transaction().expect("exclusive");
    for i in 0..400 {
        ex.add_record("people", row(i, "x")).expect("add");
    }
    ex.complete().expect("complete");
    let rd = db.read_transaction();
    let frac = rd
        .rangefrac("people", &[0], &Bound::Included(id(0)), &Bound::Excluded(id(100)))
        .expect("rangefrac");
    assert!((0.1..=0.4).contains(&frac), "estimated {frac}");
}

#[test]
fn intref_addresses_do_not_leak_into_storage() {
    let db = people_db(Arc::new(MemFileIo::new()));
    let mut up = db.update_transaction().expect("update");
    let adr = up.add_record("people", row(1, "a")).expect("add");
    assert!(adr.is_intref());
    up.complete().expect("complete");
    let rd = db.read_transaction();
    let (stored, _) = rd.lookup("people", &[0], &id(1)).expect("lookup").expect("row");
    assert!(!stored.is_intref());
    assert_ne!(stored, Address::NULL);
    assert!(db.snapshot().redirects().pending().is_empty());
}

#[test]
fn commits_leave_no_redirects_behind() {
    let io = MemFileIo::new();
    let db = people_db(Arc::new(io.clone()));
    for c in 0..20 {
        let mut up = db.update_transaction().expect("update");
        for i in 0..5 {
            let n = c * 5 + i;
            up.add_record("people", row(n, &format!("p{n}"))).expect("add");
        }
        assert!(up.complete().expect("complete").is_none());
        assert_eq!(db.snapshot().redirects().count().expect("count"), 0, "commit {c}");
    }
    let state = db.snapshot();
    let info = state.table_by_name("people").expect("info");
    let tran = Tran::new(Arc::clone(db.storage()));
    for i in 0..info.indexes.len() {
        let tree = transaction::open_index(&state, &info, i, &db.options().btree);
        assert_eq!(tree.check(&tran).expect("check").keys, 100);
    }

    let mut ex = db.exclusive_transaction().expect("exclusive");
    for n in 100..140 {
        ex.add_record("people", row(n, "late")).expect("add");
    }
    ex.drop_table("people").expect("drop");
    ex.complete().expect("complete");
    drop(db);

    let db = Database::open_with_io(Arc::new(io), options()).expect("reopen");
    let state = db.snapshot();
    assert_eq!(state.redirects().count().expect("count"), 0);
    assert!(state.schema().is_empty());
    assert!(db.full_check().expect("full").ok);
}

/// File provider whose reads fail while `broken` is set.
#[derive(Clone)]
struct FlakyIo {
    inner: MemFileIo,
    broken: Arc<AtomicBool>,
}

impl FileIo for FlakyIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected read failure",
            )));
        }
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
}

const WIDE_ROWS: i64 = 2_000;

fn wide_row(v: i64) -> Record {
    RecordBuilder::new().add_int(v).add_int(10_000 + v).build()
}

/// Table `wide(a unique, b unique)` of even values, reopened so that only the
/// chunks on the path to `a = 2001` are cached.
fn wide_db() -> (Database, Arc<AtomicBool>) {
    let wide_options = || {
        DbOptions::default()
            .storage(StorageOptions::default().chunk_size(MIN_CHUNK_SIZE))
            .btree(BtreeOptions::default().max_node_size(4))
            .sync_on_commit(false)
    };
    let io = FlakyIo {
        inner: MemFileIo::new(),
        broken: Arc::new(AtomicBool::new(false)),
    };
    {
        let db = Database::open_with_io(Arc::new(io.clone()), wide_options()).expect("open");
        let mut ex = db.exclusive_transaction().expect("exclusive");
        ex.create_table("wide", &[IndexSpec::new([0], true), IndexSpec::new([1], true)])
            .expect("create");
        for i in 0..WIDE_ROWS {
            ex.add_record("wide", wide_row(2 * i)).expect("add");
        }
        ex.complete().expect("complete");
        // A small newest commit keeps the open-time check away from the bulk one.
        let mut ex = db.exclusive_transaction().expect("exclusive");
        ex.create_table("other", &[IndexSpec::new([0], false)])
            .expect("create");
        ex.complete().expect("complete");
    }
    let broken = Arc::clone(&io.broken);
    let db = Database::open_with_io(Arc::new(io), wide_options()).expect("reopen");
    {
        let rd = db.read_transaction();
        for v in 2_000..=2_002 {
            rd.lookup("wide", &[0], &id(v)).expect("warm up");
        }
    }
    (db, broken)
}

fn injected(err: &StoreError) -> bool {
    matches!(err, StoreError::Io(e) if e.to_string().contains("injected"))
}

fn assert_wide_consistent(db: &Database) {
    let rd = db.read_transaction();
    let nrows = rd.table_info("wide").expect("info").nrows;
    assert_eq!(nrows, WIDE_ROWS as u64 + 1);
    for columns in [&[0u16][..], &[1u16][..]] {
        let keys = rd
            .iter("wide", columns, Bound::Unbounded, Bound::Unbounded)
            .expect("iter")
            .count();
        assert_eq!(keys as u64, nrows, "index {columns:?}");
    }
    assert!(rd.lookup("wide", &[0], &id(2_003)).expect("lookup").is_some());
    assert!(rd.lookup("wide", &[1], &id(12_003)).expect("lookup").is_some());
    assert!(rd.lookup("wide", &[0], &id(2_001)).expect("lookup").is_none());
    assert!(rd.lookup("wide", &[1], &id(12_001)).expect("lookup").is_none());
    assert!(db.full_check().expect("full").ok);
}

#[test]
fn exclusive_add_is_undone_when_a_later_index_fails_to_read() {
    let (db, broken) = wide_db();
    let mut ex = db.exclusive_transaction().expect("exclusive");
    broken.store(true, Ordering::SeqCst);
    let err = ex.add_record("wide", wide_row(2_001)).err().expect("must fail");
    broken.store(false, Ordering::SeqCst);
    assert!(injected(&err), "{err}");

    assert!(ex.lookup("wide", &[0], &id(2_001)).expect("lookup").is_none());
    ex.add_record("wide", wide_row(2_003)).expect("still usable");
    ex.complete().expect("complete");
    assert_wide_consistent(&db);
}

#[test]
fn update_add_is_undone_when_a_later_index_fails_to_read() {
    let (db, broken) = wide_db();
    let mut up = db.update_transaction().expect("update");
    broken.store(true, Ordering::SeqCst);
    let err = up.add_record("wide", wide_row(2_001)).err().expect("must fail");
    broken.store(false, Ordering::SeqCst);
    assert!(injected(&err), "{err}");

    assert!(up.lookup("wide", &[0], &id(2_001)).expect("lookup").is_none());
    up.add_record("wide", wide_row(2_003)).expect("still usable");
    assert!(up.complete().expect("complete").is_none());
    assert_wide_consistent(&db);
}
