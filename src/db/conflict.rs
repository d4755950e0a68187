#![forbid(unsafe_code)]

//! Optimistic validation of update transactions.
//!
//! Every committed update transaction leaves its write set in the log, tagged
//! with its commit sequence number. A committing transaction is checked against
//! every entry newer than its own snapshot. Entries are dropped once no running
//! transaction started before them.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use crate::storage::btree::{in_range, key};
use crate::storage::record::Record;
use crate::types::TableNum;

/// Why a transaction could not commit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// A range this transaction read was written by a newer commit.
    ReadWrite,
    /// A key this transaction wrote was also written by a newer commit.
    WriteWrite,
    /// A record this transaction removed is already gone.
    ConcurrentDelete,
    /// A unique key this transaction added now exists.
    UniqueViolation,
}

/// Description of a failed validation, returned by
/// [`UpdateTransaction::complete`](crate::db::UpdateTransaction::complete).
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Conflict {
    /// Kind of overlap.
    pub kind: ConflictKind,
    /// Table name.
    pub table: String,
    /// Index column list.
    pub index: String,
    /// Commit sequence of the transaction that won, when known.
    pub other_commit: Option<u64>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ConflictKind::ReadWrite => "read-write conflict",
            ConflictKind::WriteWrite => "write-write conflict",
            ConflictKind::ConcurrentDelete => "record deleted concurrently",
            ConflictKind::UniqueViolation => "unique key added concurrently",
        };
        write!(f, "{kind} on table {} index {}", self.table, self.index)?;
        if let Some(seq) = self.other_commit {
            write!(f, " (commit {seq})")?;
        }
        Ok(())
    }
}

/// Range of one index a transaction iterated.
#[derive(Clone, Debug)]
pub(crate) struct ReadRange {
    pub table: TableNum,
    pub index: usize,
    pub lo: Bound<Record>,
    pub hi: Bound<Record>,
}

/// Leaf key a transaction added or removed.
#[derive(Clone, Debug)]
pub(crate) struct WriteKey {
    pub table: TableNum,
    pub index: usize,
    pub unique: bool,
    pub key: Record,
}

impl WriteKey {
    fn collides(&self, other: &WriteKey) -> bool {
        if self.table != other.table || self.index != other.index {
            return false;
        }
        if self.unique {
            key::index_fields(&self.key) == key::index_fields(&other.key)
        } else {
            self.key == other.key
        }
    }
}

/// Overlap found by [`ConflictLog::validate`], before names are resolved.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Overlap {
    pub kind: ConflictKind,
    pub table: TableNum,
    pub index: usize,
    pub commit_seq: u64,
}

/// Write sets of recent commits and the start points of running transactions.
#[derive(Default)]
pub(crate) struct ConflictLog {
    /// Running update transactions by id, with the commit sequence they started at.
    active: BTreeMap<u64, u64>,
    /// Committed write sets by commit sequence.
    writes: BTreeMap<u64, Arc<Vec<WriteKey>>>,
}

impl ConflictLog {
    pub fn register(&mut self, txn: u64, start_seq: u64) {
        self.active.insert(txn, start_seq);
    }

    pub fn unregister(&mut self, txn: u64) {
        self.active.remove(&txn);
        self.prune();
    }

    /// First overlap between this transaction and a commit newer than `start_seq`.
    pub fn validate(&self, start_seq: u64, reads: &[ReadRange], writes: &[WriteKey]) -> Option<Overlap> {
        for (&seq, theirs) in self.writes.range(start_seq + 1..) {
            for w in theirs.iter() {
                let read = reads.iter().find(|r| {
                    r.table == w.table && r.index == w.index && in_range(&w.key, &r.lo, &r.hi)
                });
                if let Some(r) = read {
                    return Some(Overlap {
                        kind: ConflictKind::ReadWrite,
                        table: r.table,
                        index: r.index,
                        commit_seq: seq,
                    });
                }
                if let Some(mine) = writes.iter().find(|mine| mine.collides(w)) {
                    return Some(Overlap {
                        kind: ConflictKind::WriteWrite,
                        table: mine.table,
                        index: mine.index,
                        commit_seq: seq,
                    });
                }
            }
        }
        None
    }

    /// Records a commit's write set, keeping it only while someone may need it.
    pub fn record(&mut self, commit_seq: u64, writes: Vec<WriteKey>) {
        if !writes.is_empty() {
            self.writes.insert(commit_seq, Arc::new(writes));
        }
        self.prune();
    }

    /// Number of retained write sets.
    pub fn retained(&self) -> usize {
        self.writes.len()
    }

    fn prune(&mut self) {
        match self.active.values().min().copied() {
            None => self.writes.clear(),
            Some(oldest) => {
                let keep = self.writes.split_off(&(oldest + 1));
                self.writes = keep;
            }
        }
        trace!(retained = self.writes.len(), "conflict.prune");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::RecordBuilder;
    use crate::types::Address;

    fn write(table: u32, v: &str, data: u32, unique: bool) -> WriteKey {
        WriteKey {
            table: TableNum(table),
            index: 0,
            unique,
            key: RecordBuilder::new().add_str(v).add_address(Address(data)).build(),
        }
    }

    fn read(table: u32, lo: &str, hi: &str) -> ReadRange {
        ReadRange {
            table: TableNum(table),
            index: 0,
            lo: Bound::Included(RecordBuilder::new().add_str(lo).build()),
            hi: Bound::Included(RecordBuilder::new().add_str(hi).build()),
        }
    }

    #[test]
    fn newer_write_inside_read_range_conflicts() {
        let mut log = ConflictLog::default();
        log.register(1, 5);
        log.register(2, 5);
        log.record(6, vec![write(1, "m", 8, false)]);
        let overlap = log.validate(5, &[read(1, "a", "z")], &[]).unwrap();
        assert_eq!(overlap.kind, ConflictKind::ReadWrite);
        assert_eq!(overlap.commit_seq, 6);
        assert!(log.validate(5, &[read(2, "a", "z")], &[]).is_none());
        assert!(log.validate(6, &[read(1, "a", "z")], &[]).is_none());
    }

    #[test]
    fn unique_writes_collide_on_index_fields() {
        let mut log = ConflictLog::default();
        log.register(1, 0);
        log.register(2, 0);
        log.record(1, vec![write(1, "k", 8, true)]);
        let overlap = log.validate(0, &[], &[write(1, "k", 16, true)]).unwrap();
        assert_eq!(overlap.kind, ConflictKind::WriteWrite);
        log.record(2, vec![write(2, "k", 8, false)]);
        assert!(log.validate(1, &[], &[write(2, "k", 16, false)]).is_none());
        assert!(log.validate(1, &[], &[write(2, "k", 8, false)]).is_some());
    }

    #[test]
    fn write_sets_are_dropped_when_nobody_needs_them() {
        let mut log = ConflictLog::default();
        log.register(1, 3);
        log.record(4, vec![write(1, "a", 8, false)]);
        log.record(5, vec![write(1, "b", 8, false)]);
        assert_eq!(log.retained(), 2);
        log.register(2, 4);
        log.unregister(1);
        assert_eq!(log.retained(), 1);
        log.unregister(2);
        assert_eq!(log.retained(), 0);
    }
}
