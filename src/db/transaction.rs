#![forbid(unsafe_code)]

use std::ops::Bound;
use std::sync::Arc;

use crate::storage::btree::{Btree, BtreeCursor, BtreeOptions};
use crate::storage::dbinfo::TableInfo;
use crate::storage::record::Record;
use crate::storage::tran::Tran;
use crate::types::{Address, Result};

use super::overlay::OverlayIter;
use super::{Database, DbState};

/// Reads shared by every transaction kind.
pub trait Transaction {
    /// State the transaction started from.
    fn state(&self) -> &DbState;

    /// Table info as this transaction sees it.
    fn table_info(&self, table: &str) -> Result<Arc<TableInfo>>;

    /// Record at `adr`, including records added by this transaction.
    fn get_record(&self, adr: Address) -> Result<Record>;

    /// Cursor of `(leaf key, record address)` over the index of `table` keyed
    /// on `columns`. Bounds are search keys over the index fields and compare
    /// as prefixes.
    fn iter(
        &self,
        table: &str,
        columns: &[u16],
        lo: Bound<Record>,
        hi: Bound<Record>,
    ) -> Result<IndexIter<'_>>;

    /// First record whose index fields start with `key`.
    fn lookup(&self, table: &str, columns: &[u16], key: &Record) -> Result<Option<(Address, Record)>> {
        let mut cursor = self.iter(
            table,
            columns,
            Bound::Included(key.clone()),
            Bound::Included(key.clone()),
        )?;
        match cursor.next() {
            Some(item) => {
                let (_, adr) = item?;
                Ok(Some((adr, self.get_record(adr)?)))
            }
            None => Ok(None),
        }
    }

    /// Commit sequence of the starting state.
    fn commit_seq(&self) -> u64 {
        self.state().commit_seq()
    }
}

/// Cursor returned by [`Transaction::iter`].
pub enum IndexIter<'a> {
    /// Straight over a shared tree.
    Btree(BtreeCursor<'a>),
    /// Over a tree merged with this transaction's pending changes.
    Overlay(OverlayIter<'a>),
}

impl Iterator for IndexIter<'_> {
    type Item = Result<(Record, Address)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            IndexIter::Btree(cursor) => cursor.next(),
            IndexIter::Overlay(cursor) => cursor.next(),
        }
    }
}

impl DoubleEndedIterator for IndexIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        match self {
            IndexIter::Btree(cursor) => cursor.next_back(),
            IndexIter::Overlay(cursor) => cursor.next_back(),
        }
    }
}

/// Handle on index `index` of `info` as of `state`.
pub(crate) fn open_index(state: &DbState, info: &TableInfo, index: usize, opts: &BtreeOptions) -> Btree {
    let ix = &info.indexes[index];
    Btree::open(ix.root, ix.levels, state.redirs.clone(), opts.clone())
}

/// Snapshot of one committed state. Holds no locks.
pub struct ReadTransaction {
    db: Database,
    state: Arc<DbState>,
    tran: Tran,
}

impl ReadTransaction {
    pub(crate) fn new(db: Database, state: Arc<DbState>) -> Self {
        let tran = Tran::new(Arc::clone(db.storage()));
        Self { db, state, tran }
    }

    /// Fraction of the index's keys within the bounds, estimated without a scan.
    pub fn rangefrac(
        &self,
        table: &str,
        columns: &[u16],
        lo: &Bound<Record>,
        hi: &Bound<Record>,
    ) -> Result<f64> {
        let info = self.table_info(table)?;
        let (index, _) = info.index(columns)?;
        open_index(&self.state, &info, index, &self.db.options().btree).rangefrac(&self.tran, lo, hi)
    }
}

impl Transaction for ReadTransaction {
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
        let info = self.table_info(table)?;
        let (index, _) = info.index(columns)?;
        let tree = open_index(&self.state, &info, index, &self.db.options().btree);
        Ok(IndexIter::Btree(tree.cursor(&self.tran, lo, hi)))
    }
}
