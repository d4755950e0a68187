#![forbid(unsafe_code)]

//! Whole-database transactions for schema changes and bulk loads.
//!
//! An exclusive transaction works on the trees directly. Since every tree
//! handle is a value, undoing a failed multi-index add is just restoring the
//! handles taken before it.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::primitives::concurrency::ExclusiveDbGuard;
use crate::storage::btree::{key, persist_trees, Btree};
use crate::storage::dbinfo::{IndexInfo, TableInfo, TableInfoRef};
use crate::storage::hash_trie::DbHashTrie;
use crate::storage::record::Record;
use crate::storage::tran::{IntRef, Redirects, Tran};
use crate::types::{Address, Result, StoreError, TableNum};

use super::commit::CommitBlock;
use super::transaction::{IndexIter, Transaction};
use super::{Database, DbState, Schema};

/// Definition of one index for [`ExclusiveTransaction::create_table`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexSpec {
    /// Row fields the index is keyed on.
    pub columns: Vec<u16>,
    /// Rejects rows with equal index fields.
    pub unique: bool,
}

impl IndexSpec {
    /// Index on `columns`.
    pub fn new(columns: impl Into<Vec<u16>>, unique: bool) -> Self {
        Self {
            columns: columns.into(),
            unique,
        }
    }
}

/// Transaction holding the whole-database lock.
///
/// No update transaction runs alongside it, so it needs neither overlays nor
/// validation. Dropping it discards every change.
pub struct ExclusiveTransaction {
    db: Database,
    base: Arc<DbState>,
    tran: Tran,
    dbinfo: DbHashTrie<TableInfoRef>,
    redirs: Redirects,
    schema: Schema,
    next_table: u32,
    /// Tables changed by this transaction, with their current roots.
    tables: BTreeMap<TableNum, TableInfo>,
    /// Records added and removed again; never written.
    dead: BTreeSet<Address>,
    dirty: bool,
    ended: bool,
    _guard: ExclusiveDbGuard,
}

impl ExclusiveTransaction {
    pub(crate) fn new(db: Database, base: Arc<DbState>, guard: ExclusiveDbGuard) -> Self {
        let tran = Tran::new(Arc::clone(db.storage()));
        debug!(commit_seq = base.commit_seq, "exclusive.begin");
        Self {
            dbinfo: base.dbinfo.clone(),
            redirs: base.redirs.clone(),
            schema: (*base.schema).clone(),
            next_table: base.next_table,
            db,
            base,
            tran,
            tables: BTreeMap::new(),
            dead: BTreeSet::new(),
            dirty: false,
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

    fn table_num(&self, name: &str) -> Result<TableNum> {
        self.schema
            .table(name)
            .ok_or_else(|| StoreError::NotFound(format!("table {name}")))
    }

    fn current(&self, num: TableNum) -> Result<TableInfo> {
        if let Some(info) = self.tables.get(&num) {
            return Ok(info.clone());
        }
        match self.dbinfo.get(num.0)? {
            Some(value) => Ok((*value.load(self.db.storage())?).clone()),
            None => Err(StoreError::NotFound(format!("table number {num}"))),
        }
    }

    fn tree(&self, ix: &IndexInfo) -> Btree {
        Btree::open(ix.root, ix.levels, self.redirs.clone(), self.db.options().btree.clone())
    }

    /// Creates a table. The first index is its primary index.
    pub fn create_table(&mut self, name: &str, indexes: &[IndexSpec]) -> Result<TableNum> {
        self.check_active()?;
        if self.schema.table(name).is_some() {
            return Err(StoreError::Invalid("table already exists"));
        }
        if indexes.is_empty() {
            return Err(StoreError::Invalid("a table needs at least one index"));
        }
        let num = TableNum(self.next_table);
        self.next_table += 1;
        let opts = self.db.options().btree.clone();
        let indexes = indexes
            .iter()
            .map(|spec| {
                let tree = Btree::create(&mut self.tran, self.redirs.clone(), opts.clone());
                IndexInfo {
                    columns: spec.columns.clone(),
                    unique: spec.unique,
                    root: tree.root(),
                    levels: 0,
                }
            })
            .collect();
        self.tables.insert(
            num,
            TableInfo {
                num,
                name: name.to_owned(),
                nrows: 0,
                total_size: 0,
                indexes,
            },
        );
        self.schema.insert(name, num);
        self.dirty = true;
        info!(table = name, num = num.0, "exclusive.create_table");
        Ok(num)
    }

    /// Drops a table and all its indexes.
    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        self.check_active()?;
        let num = self.table_num(name)?;
        let info = self.current(num)?;
        let mut redirs = self.redirs.clone();
        for ix in &info.indexes {
            let mut tree = self.tree(ix);
            tree.set_redirects(redirs);
            redirs = tree.release_redirects(&self.tran)?;
        }
        self.dbinfo = self.dbinfo.without(num.0)?;
        self.redirs = redirs;
        self.schema.remove(name);
        self.tables.remove(&num);
        self.dirty = true;
        info!(table = name, num = num.0, "exclusive.drop_table");
        Ok(())
    }

    /// Adds or removes the row `rec` at `adr` in every index of the table and
    /// returns the updated info. On any failure the trees are left as they were.
    fn apply(
        &mut self,
        num: TableNum,
        rec: &Record,
        adr: Address,
        add: bool,
    ) -> Result<TableInfo> {
        let saved = self.redirs.clone();
        let result = self.apply_indexes(num, rec, adr, add);
        if result.is_err() {
            self.redirs = saved;
        }
        result
    }

    fn apply_indexes(
        &mut self,
        num: TableNum,
        rec: &Record,
        adr: Address,
        add: bool,
    ) -> Result<TableInfo> {
        let mut info = self.current(num)?;
        for ix in info.indexes.iter_mut() {
            let k = key::leaf_key(rec, &ix.columns, adr);
            let mut tree = self.tree(ix);
            let done = if add {
                tree.add(&mut self.tran, &k, ix.unique)?
            } else {
                tree.remove(&mut self.tran, &k)?
            };
            if !done {
                let err = if add && ix.unique {
                    StoreError::Constraint {
                        table: info.name.clone(),
                        index: ix.describe(),
                    }
                } else {
                    StoreError::Invariant(format!(
                        "record {adr} {} index {} of {}",
                        if add { "already in" } else { "missing from" },
                        ix.describe(),
                        info.name
                    ))
                };
                return Err(err);
            }
            ix.root = tree.root();
            ix.levels = tree.tree_levels();
            self.redirs = tree.redirects().clone();
        }
        Ok(info)
    }

    fn fail(&mut self, err: StoreError) -> StoreError {
        if matches!(err, StoreError::Invariant(_)) {
            error!(error = %err, "exclusive.aborted");
            self.ended = true;
        }
        err
    }

    /// Adds a row and returns its address.
    pub fn add_record(&mut self, table: &str, rec: Record) -> Result<Address> {
        self.check_active()?;
        let num = self.table_num(table)?;
        let adr = self.tran.add_record(rec.clone());
        match self.apply(num, &rec, adr, true) {
            Ok(mut info) => {
                info.adjust(1, rec.byte_len() as i64);
                self.tables.insert(num, info);
                self.dirty = true;
                Ok(adr)
            }
            Err(err) => {
                self.dead.insert(adr);
                Err(self.fail(err))
            }
        }
    }

    /// Removes the row at `adr`.
    pub fn remove_record(&mut self, table: &str, adr: Address) -> Result<()> {
        self.check_active()?;
        let num = self.table_num(table)?;
        let rec = self.tran.record(adr)?;
        match self.apply(num, &rec, adr, false) {
            Ok(mut info) => {
                info.adjust(-1, -(rec.byte_len() as i64));
                self.tables.insert(num, info);
                if adr.is_intref() {
                    self.dead.insert(adr);
                }
                self.dirty = true;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Replaces the row at `old` with `rec` and returns the new address.
    pub fn update_record(&mut self, table: &str, old: Address, rec: Record) -> Result<Address> {
        self.check_active()?;
        let num = self.table_num(table)?;
        let saved_redirs = self.redirs.clone();
        let saved_info = self.tables.get(&num).cloned();
        self.remove_record(table, old)?;
        match self.add_record(table, rec) {
            Ok(adr) => Ok(adr),
            Err(err) => {
                self.redirs = saved_redirs;
                match saved_info {
                    Some(info) => self.tables.insert(num, info),
                    None => self.tables.remove(&num),
                };
                self.dead.remove(&old);
                Err(err)
            }
        }
    }

    /// Writes everything and publishes the new state.
    pub fn complete(mut self) -> Result<()> {
        self.check_active()?;
        self.ended = true;
        if !self.dirty {
            return Ok(());
        }
        let db = self.db.clone();
        let _commit = db.locks().commit();
        let mut writer = db.storage().writer();
        let block = CommitBlock::begin(&mut writer)?;

        // Records go out in intref order so translated keys keep their order.
        for i in 0..self.tran.intrefs().len() {
            let adr = Address::intref(i as u32);
            if self.dead.contains(&adr) {
                continue;
            }
            if matches!(self.tran.intrefs().get(adr), Some(IntRef::Record(_))) {
                self.tran.persist_record(&mut writer, adr)?;
            }
        }

        let slots: Vec<(TableNum, usize)> = self
            .tables
            .iter()
            .flat_map(|(num, info)| (0..info.indexes.len()).map(move |i| (*num, i)))
            .collect();
        let mut roots: Vec<Address> = slots
            .iter()
            .map(|(num, i)| self.tables[num].indexes[*i].root)
            .collect();
        let mut redirs = self.redirs.clone();
        persist_trees(&mut self.tran, &mut writer, &mut redirs, &mut roots)?;
        for ((num, i), root) in slots.into_iter().zip(roots) {
            if let Some(info) = self.tables.get_mut(&num) {
                info.indexes[i].root = root;
            }
        }
        let mut dbinfo = self.dbinfo.clone();
        for (num, info) in std::mem::take(&mut self.tables) {
            dbinfo = dbinfo.with(num.0, TableInfoRef::Mem(Arc::new(info)))?;
        }
        let schema = Arc::new(std::mem::take(&mut self.schema));
        let state = db.publish(writer, block, dbinfo, redirs, schema, self.next_table)?;
        debug!(commit_seq = state.commit_seq, "exclusive.committed");
        Ok(())
    }
}

impl Transaction for ExclusiveTransaction {
    fn state(&self) -> &DbState {
        &self.base
    }

    fn table_info(&self, table: &str) -> Result<Arc<TableInfo>> {
        Ok(Arc::new(self.current(self.table_num(table)?)?))
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
        let info = self.current(self.table_num(table)?)?;
        let (_, ix) = info.index(columns)?;
        Ok(IndexIter::Btree(self.tree(ix).cursor(&self.tran, lo, hi)))
    }
}
