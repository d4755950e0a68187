#![forbid(unsafe_code)]

//! Optimistic update transactions.
//!
//! Writes go to per-index overlays and never touch shared state. At commit the
//! transaction is validated against everything committed since it started,
//! then its overlays are replayed onto the newest trees under the commit lock.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::primitives::concurrency::SharedDbGuard;
use crate::storage::btree::{key, persist_trees, Btree};
use crate::storage::chunked::StorageWriter;
use crate::storage::dbinfo::{TableInfo, TableInfoRef};
use crate::storage::hash_trie::DbHashTrie;
use crate::storage::record::Record;
use crate::storage::tran::{Redirects, Tran};
use crate::types::{Address, Result, StoreError, TableNum};

use super::commit::CommitBlock;
use super::conflict::{Conflict, ConflictKind, ReadRange, WriteKey};
use super::overlay::Overlay;
use super::transaction::{open_index, IndexIter, Transaction};
use super::{Database, DbState};

/// Transaction that buffers writes privately and validates them at commit.
///
/// Any number of update transactions may run at once; only
/// [`UpdateTransaction::complete`] is serialized. Dropping the transaction
/// discards its writes.
pub struct UpdateTransaction {
    db: Database,
    id: u64,
    state: Arc<DbState>,
    tran: Tran,
    overlays: BTreeMap<(TableNum, usize), Overlay>,
    deltas: BTreeMap<TableNum, (i64, i64)>,
    reads: RefCell<Vec<ReadRange>>,
    ended: bool,
    _guard: SharedDbGuard,
}

/// New directory, redirects and the persisted write set of a successful merge.
type Merged = (DbHashTrie<TableInfoRef>, Redirects, Vec<WriteKey>);

fn overlay_for<'o>(
    overlays: &'o mut BTreeMap<(TableNum, usize), Overlay>,
    db: &Database,
    state: &DbState,
    info: &TableInfo,
    index: usize,
) -> &'o mut Overlay {
    overlays.entry((info.num, index)).or_insert_with(|| {
        let base = open_index(state, info, index, &db.options().btree);
        Overlay::new(info.num, index, info.indexes[index].unique, base)
    })
}

impl UpdateTransaction {
    pub(crate) fn new(db: Database, id: u64, state: Arc<DbState>, guard: SharedDbGuard) -> Self {
        let tran = Tran::new(Arc::clone(db.storage()));
        debug!(txn = id, commit_seq = state.commit_seq, "update.begin");
        Self {
            db,
            id,
            state,
            tran,
            overlays: BTreeMap::new(),
            deltas: BTreeMap::new(),
            reads: RefCell::new(Vec::new()),
            ended: false,
            _guard: guard,
        }
    }

    fn check_active(&self) -> Result<()> {
        if self.ended {
            return Err(StoreError::TransactionEnded);
        }
        Ok(())
    }

    /// Ends the transaction if `err` is an invariant violation.
    fn fail(&mut self, err: StoreError) -> StoreError {
        if matches!(err, StoreError::Invariant(_)) {
            error!(txn = self.id, error = %err, "update.aborted");
            self.ended = true;
        }
        err
    }

    fn adjust(&mut self, table: TableNum, rows: i64, bytes: i64) {
        let delta = self.deltas.entry(table).or_default();
        delta.0 += rows;
        delta.1 += bytes;
    }

    /// Adds `rec` to every index of `info`. All or nothing: on any failure the
    /// indexes already updated are restored.
    fn insert_keys(&mut self, info: &TableInfo, rec: &Record, adr: Address) -> Result<()> {
        for (i, ix) in info.indexes.iter().enumerate() {
            let k = key::leaf_key(rec, &ix.columns, adr);
            let overlay = overlay_for(&mut self.overlays, &self.db, &self.state, info, i);
            let err = match overlay.add(&self.tran, &k) {
                Ok(true) => continue,
                Ok(false) if ix.unique => StoreError::Constraint {
                    table: info.name.clone(),
                    index: ix.describe(),
                },
                Ok(false) => StoreError::Invariant(format!(
                    "key for {adr} already in index {} of {}",
                    ix.describe(),
                    info.name
                )),
                Err(err) => err,
            };
            self.unwind(info, rec, adr, i, true);
            return Err(err);
        }
        Ok(())
    }

    /// Removes `rec` from every index of `info`, all or nothing.
    fn remove_keys(&mut self, info: &TableInfo, rec: &Record, adr: Address) -> Result<()> {
        for (i, ix) in info.indexes.iter().enumerate() {
            let k = key::leaf_key(rec, &ix.columns, adr);
            let overlay = overlay_for(&mut self.overlays, &self.db, &self.state, info, i);
            let err = match overlay.remove(&self.tran, &k) {
                Ok(true) => continue,
                Ok(false) => StoreError::Invariant(format!(
                    "record {adr} missing from index {} of {}",
                    ix.describe(),
                    info.name
                )),
                Err(err) => err,
            };
            self.unwind(info, rec, adr, i, false);
            return Err(err);
        }
        Ok(())
    }

    /// Reverts the adds (or removes) of `rec` made in the first `done` indexes.
    fn unwind(&mut self, info: &TableInfo, rec: &Record, adr: Address, done: usize, added: bool) {
        for (i, ix) in info.indexes[..done].iter().enumerate() {
            let k = key::leaf_key(rec, &ix.columns, adr);
            if let Some(overlay) = self.overlays.get_mut(&(info.num, i)) {
                if added {
                    overlay.undo_add(&k);
                } else {
                    overlay.undo_remove(&k);
                }
            }
        }
    }

    /// Adds a row to `table` and returns its address, valid within this
    /// transaction until commit.
    pub fn add_record(&mut self, table: &str, rec: Record) -> Result<Address> {
        self.check_active()?;
        let info = self.state.table_by_name(table)?;
        let adr = self.tran.add_record(rec.clone());
        if let Err(err) = self.insert_keys(&info, &rec, adr) {
            return Err(self.fail(err));
        }
        self.adjust(info.num, 1, rec.byte_len() as i64);
        Ok(adr)
    }

    /// Removes the row at `adr` from `table`.
    pub fn remove_record(&mut self, table: &str, adr: Address) -> Result<()> {
        self.check_active()?;
        let info = self.state.table_by_name(table)?;
        let rec = self.tran.record(adr)?;
        if let Err(err) = self.remove_keys(&info, &rec, adr) {
            return Err(self.fail(err));
        }
        self.adjust(info.num, -1, -(rec.byte_len() as i64));
        Ok(())
    }

    /// Replaces the row at `old` with `rec` and returns the new address. If
    /// the new row cannot be added the old one stays in place.
    pub fn update_record(&mut self, table: &str, old: Address, rec: Record) -> Result<Address> {
        self.check_active()?;
        let info = self.state.table_by_name(table)?;
        let old_rec = self.tran.record(old)?;
        if let Err(err) = self.remove_keys(&info, &old_rec, old) {
            return Err(self.fail(err));
        }
        let adr = self.tran.add_record(rec.clone());
        if let Err(err) = self.insert_keys(&info, &rec, adr) {
            let count = info.indexes.len();
            self.unwind(&info, &old_rec, old, count, false);
            return Err(self.fail(err));
        }
        self.adjust(info.num, 0, rec.byte_len() as i64 - old_rec.byte_len() as i64);
        Ok(adr)
    }

    fn write_set(&self) -> Vec<WriteKey> {
        let mut out = Vec::new();
        for ov in self.overlays.values() {
            for k in ov.adds().iter().chain(ov.tombstones()) {
                out.push(WriteKey {
                    table: ov.table,
                    index: ov.index,
                    unique: ov.unique,
                    key: k.clone(),
                });
            }
        }
        out
    }

    fn conflict(&self, kind: ConflictKind, table: TableNum, index: usize, other: Option<u64>) -> Result<Conflict> {
        let info = self.state.table_info(table)?;
        Ok(Conflict {
            kind,
            table: info.name.clone(),
            index: info.indexes[index].describe(),
            other_commit: other,
        })
    }

    /// Validates and commits. Returns the conflict that prevented the commit,
    /// if any; the transaction is over either way.
    pub fn complete(mut self) -> Result<Option<Conflict>> {
        self.check_active()?;
        self.ended = true;
        let writes = self.write_set();
        let db = self.db.clone();
        let _commit = db.locks().commit();

        let overlap = {
            let reads = self.reads.borrow();
            db.conflicts().lock().validate(self.state.commit_seq, &reads, &writes)
        };
        if let Some(o) = overlap {
            let conflict = self.conflict(o.kind, o.table, o.index, Some(o.commit_seq))?;
            warn!(txn = self.id, %conflict, "update.conflict");
            return Ok(Some(conflict));
        }
        if writes.is_empty() {
            debug!(txn = self.id, "update.complete_read_only");
            return Ok(None);
        }

        let latest = db.snapshot();
        let mut writer = db.storage().writer();
        let block = CommitBlock::begin(&mut writer)?;
        let merged = match self.merge(&latest, &mut writer)? {
            Ok(merged) => merged,
            Err(conflict) => {
                warn!(txn = self.id, %conflict, "update.conflict");
                return Ok(Some(conflict));
            }
        };
        let (dbinfo, redirs, persisted) = merged;
        let state = db.publish(
            writer,
            block,
            dbinfo,
            redirs,
            Arc::clone(&latest.schema),
            latest.next_table,
        )?;
        db.conflicts().lock().record(state.commit_seq, persisted);
        debug!(
            txn = self.id,
            commit_seq = state.commit_seq,
            keys = writes.len(),
            "update.committed"
        );
        Ok(None)
    }

    /// Writes live records and replays every overlay onto the newest trees.
    fn merge(
        &mut self,
        latest: &DbState,
        writer: &mut StorageWriter<'_>,
    ) -> Result<std::result::Result<Merged, Conflict>> {
        // Records go out in intref order so translated keys keep their order.
        let mut live = BTreeSet::new();
        for ov in self.overlays.values() {
            for k in ov.adds() {
                let adr = key::data_address(k)?;
                if adr.is_intref() {
                    live.insert(adr);
                }
            }
        }
        for adr in &live {
            self.tran.persist_record(writer, *adr)?;
        }

        let opts = self.db.options().btree.clone();
        let mut infos: BTreeMap<TableNum, TableInfo> = BTreeMap::new();
        let mut redirs = latest.redirs.clone();
        let mut trees: Vec<((TableNum, usize), Btree)> = Vec::new();
        let mut persisted = Vec::new();
        for (&(num, index), ov) in &self.overlays {
            if ov.is_empty() {
                continue;
            }
            if !infos.contains_key(&num) {
                infos.insert(num, (*latest.table_info(num)?).clone());
            }
            let ix = &infos[&num].indexes[index];
            let mut tree = Btree::open(ix.root, ix.levels, redirs.clone(), opts.clone());
            for k in ov.tombstones() {
                if !tree.remove(&mut self.tran, k)? {
                    return Ok(Err(self.conflict(ConflictKind::ConcurrentDelete, num, index, None)?));
                }
                persisted.push(WriteKey {
                    table: num,
                    index,
                    unique: ov.unique,
                    key: k.clone(),
                });
            }
            for k in ov.adds() {
                let data = key::data_address(k)?;
                let stored = self.tran.persisted(data).unwrap_or(data);
                let k = key::with_address(k, k.field_count() - 1, stored);
                if !tree.add(&mut self.tran, &k, ov.unique)? {
                    return Ok(Err(self.conflict(ConflictKind::UniqueViolation, num, index, None)?));
                }
                persisted.push(WriteKey {
                    table: num,
                    index,
                    unique: ov.unique,
                    key: k,
                });
            }
            redirs = tree.redirects().clone();
            trees.push(((num, index), tree));
        }

        let mut roots: Vec<Address> = trees.iter().map(|(_, tree)| tree.root()).collect();
        persist_trees(&mut self.tran, writer, &mut redirs, &mut roots)?;
        for (((num, index), tree), root) in trees.iter().zip(roots) {
            if let Some(info) = infos.get_mut(num) {
                info.indexes[*index].root = root;
                info.indexes[*index].levels = tree.tree_levels();
            }
        }
        let mut dbinfo = latest.dbinfo.clone();
        for (num, mut info) in infos {
            if let Some((rows, bytes)) = self.deltas.get(&num) {
                info.adjust(*rows, *bytes);
            }
            dbinfo = dbinfo.with(num.0, TableInfoRef::Mem(Arc::new(info)))?;
        }
        Ok(Ok((dbinfo, redirs, persisted)))
    }
}

impl Transaction for UpdateTransaction {
    fn state(&self) -> &DbState {
        &self.state
    }

    fn table_info(&self, table: &str) -> Result<Arc<TableInfo>> {
        self.state.table_by_name(table)
    }

    fn get_record(&self, adr: Address) -> Result<Record> {
        self.tran.record(adr)
    }

    fn iter(
        &self,
        table: &str,
        columns: &[u16],
        lo: Bound<Record>,
        hi: Bound<Record>,
    ) -> Result<IndexIter<'_>> {
        self.check_active()?;
        let info = self.table_info(table)?;
        let (index, _) = info.index(columns)?;
        self.reads.borrow_mut().push(ReadRange {
            table: info.num,
            index,
            lo: lo.clone(),
            hi: hi.clone(),
        });
        if let Some(ov) = self.overlays.get(&(info.num, index)) {
            return Ok(IndexIter::Overlay(ov.iter(&self.tran, lo, hi)));
        }
        let tree = open_index(&self.state, &info, index, &self.db.options().btree);
        Ok(IndexIter::Btree(tree.cursor(&self.tran, lo, hi)))
    }
}

impl Drop for UpdateTransaction {
    fn drop(&mut self) {
        self.db.conflicts().lock().unregister(self.id);
    }
}
