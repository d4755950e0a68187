#![forbid(unsafe_code)]

//! Transaction-private view of one index: the shared tree, plus keys this
//! transaction added, minus keys it removed.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Bound;

use crate::storage::btree::{in_range, key, Btree, BtreeCursor};
use crate::storage::record::Record;
use crate::storage::tran::Tran;
use crate::types::{Address, Result, TableNum};

pub(crate) struct Overlay {
    pub table: TableNum,
    pub index: usize,
    pub unique: bool,
    base: Btree,
    adds: BTreeSet<Record>,
    tombstones: BTreeSet<Record>,
}

impl Overlay {
    pub fn new(table: TableNum, index: usize, unique: bool, base: Btree) -> Self {
        Self {
            table,
            index,
            unique,
            base,
            adds: BTreeSet::new(),
            tombstones: BTreeSet::new(),
        }
    }

    pub fn adds(&self) -> &BTreeSet<Record> {
        &self.adds
    }

    pub fn tombstones(&self) -> &BTreeSet<Record> {
        &self.tombstones
    }

    fn in_shared(&self, tran: &Tran, k: &Record) -> Result<bool> {
        if self.tombstones.contains(k) {
            return Ok(false);
        }
        let mut cursor = self
            .base
            .cursor(tran, Bound::Included(k.clone()), Bound::Included(k.clone()));
        match cursor.next() {
            Some(item) => Ok(item?.0 == *k),
            None => Ok(false),
        }
    }

    /// Returns true if some visible key starts with `fields`.
    fn has_prefix(&self, tran: &Tran, fields: &Record) -> Result<bool> {
        if self
            .adds
            .range(fields.clone()..)
            .next()
            .is_some_and(|k| k.starts_with(fields))
        {
            return Ok(true);
        }
        let cursor = self
            .base
            .cursor(tran, Bound::Included(fields.clone()), Bound::Included(fields.clone()));
        for item in cursor {
            let (k, _) = item?;
            if !self.tombstones.contains(&k) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Adds `k`. Returns false if it is already visible or, for unique
    /// indexes, if another visible key has the same index fields.
    pub fn add(&mut self, tran: &Tran, k: &Record) -> Result<bool> {
        if self.unique && self.has_prefix(tran, &key::index_fields(k))? {
            return Ok(false);
        }
        if self.tombstones.remove(k) {
            return Ok(true);
        }
        if self.in_shared(tran, k)? {
            return Ok(false);
        }
        Ok(self.adds.insert(k.clone()))
    }

    /// Removes `k`. Returns false if it is not visible.
    pub fn remove(&mut self, tran: &Tran, k: &Record) -> Result<bool> {
        if self.adds.remove(k) {
            return Ok(true);
        }
        if !self.in_shared(tran, k)? {
            return Ok(false);
        }
        self.tombstones.insert(k.clone());
        Ok(true)
    }

    /// Reverts a successful [`Overlay::add`] of `k` without reading the tree.
    pub fn undo_add(&mut self, k: &Record) {
        if !self.adds.remove(k) {
            self.tombstones.insert(k.clone());
        }
    }

    /// Reverts a successful [`Overlay::remove`] of `k` without reading the tree.
    pub fn undo_remove(&mut self, k: &Record) {
        if !self.tombstones.remove(k) {
            self.adds.insert(k.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.tombstones.is_empty()
    }

    pub fn iter<'a>(&'a self, tran: &'a Tran, lo: Bound<Record>, hi: Bound<Record>) -> OverlayIter<'a> {
        let local = self
            .adds
            .iter()
            .filter(|k| in_range(k, &lo, &hi))
            .cloned()
            .collect::<Vec<_>>();
        OverlayIter {
            back_local: local.len(),
            front_local: 0,
            local,
            shared: self.base.cursor(tran, lo, hi),
            tombstones: &self.tombstones,
            front: None,
            back: None,
            failed: false,
        }
    }
}

/// Merge of a shared tree cursor with a transaction's pending adds, skipping
/// keys it removed.
pub struct OverlayIter<'a> {
    shared: BtreeCursor<'a>,
    tombstones: &'a BTreeSet<Record>,
    local: Vec<Record>,
    front_local: usize,
    back_local: usize,
    front: Option<(Record, Address)>,
    back: Option<(Record, Address)>,
    failed: bool,
}

impl OverlayIter<'_> {
    fn fill_front(&mut self) -> Result<()> {
        while self.front.is_none() {
            match self.shared.next() {
                Some(item) => {
                    let item = item?;
                    if !self.tombstones.contains(&item.0) {
                        self.front = Some(item);
                    }
                }
                None => {
                    self.front = self.back.take();
                    break;
                }
            }
        }
        Ok(())
    }

    fn fill_back(&mut self) -> Result<()> {
        while self.back.is_none() {
            match self.shared.next_back() {
                Some(item) => {
                    let item = item?;
                    if !self.tombstones.contains(&item.0) {
                        self.back = Some(item);
                    }
                }
                None => {
                    self.back = self.front.take();
                    break;
                }
            }
        }
        Ok(())
    }

    fn local_item(k: &Record) -> Result<(Record, Address)> {
        Ok((k.clone(), key::data_address(k)?))
    }

    fn step(&mut self, forward: bool) -> Result<Option<(Record, Address)>> {
        if forward {
            self.fill_front()?;
        } else {
            self.fill_back()?;
        }
        let local = (self.front_local < self.back_local).then(|| {
            if forward {
                &self.local[self.front_local]
            } else {
                &self.local[self.back_local - 1]
            }
        });
        let shared = if forward { &self.front } else { &self.back };
        let take_local = match (local, shared) {
            (None, None) => return Ok(None),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(l), Some((s, _))) => {
                let order = l.compare(s);
                if forward {
                    order == Ordering::Less
                } else {
                    order == Ordering::Greater
                }
            }
        };
        if take_local {
            let item = if forward {
                self.front_local += 1;
                Self::local_item(&self.local[self.front_local - 1])?
            } else {
                self.back_local -= 1;
                Self::local_item(&self.local[self.back_local])?
            };
            return Ok(Some(item));
        }
        Ok(if forward { self.front.take() } else { self.back.take() })
    }

    fn finish(&mut self, step: Result<Option<(Record, Address)>>) -> Option<Result<(Record, Address)>> {
        match step {
            Ok(item) => item.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

impl Iterator for OverlayIter<'_> {
    type Item = Result<(Record, Address)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let step = self.step(true);
        self.finish(step)
    }
}

impl DoubleEndedIterator for OverlayIter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let step = self.step(false);
        self.finish(step)
    }
}
