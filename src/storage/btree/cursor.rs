//! Bidirectional range cursor over a [`Btree`].
//!
//! The cursor keeps one root-to-leaf path per direction. Going forward, a
//! leaf frame's position is the next key to return; going backward, it is one
//! past it. The two ends stop when they meet.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use crate::storage::record::Record;
use crate::storage::tran::Tran;
use crate::types::{Address, Result};

use super::{key, Btree, BtreeNode};

/// Returns true when `k` is at or above the lower bound.
///
/// An excluded bound skips every key that starts with it.
pub fn above_lower(k: &Record, lo: &Bound<Record>) -> bool {
    match lo {
        Bound::Unbounded => true,
        Bound::Included(lo) => k.compare(lo) != Ordering::Less,
        Bound::Excluded(lo) => k.compare_fields(lo, lo.field_count()) == Ordering::Greater,
    }
}

/// Returns true when `k` is at or below the upper bound.
///
/// An included bound admits every key that starts with it.
pub fn below_upper(k: &Record, hi: &Bound<Record>) -> bool {
    match hi {
        Bound::Unbounded => true,
        Bound::Included(hi) => k.compare_fields(hi, hi.field_count()) != Ordering::Greater,
        Bound::Excluded(hi) => k.compare_fields(hi, hi.field_count()) == Ordering::Less,
    }
}

/// Returns true when `k` lies within both bounds.
pub fn in_range(k: &Record, lo: &Bound<Record>, hi: &Bound<Record>) -> bool {
    above_lower(k, lo) && below_upper(k, hi)
}

struct Frame {
    node: Arc<BtreeNode>,
    pos: usize,
}

/// Root-to-leaf path; empty once exhausted.
#[derive(Default)]
struct Path {
    frames: Vec<Frame>,
}

impl Path {
    fn seek(
        tree: &Btree,
        tran: &Tran,
        before: impl Fn(&BtreeNode, &Record) -> bool,
    ) -> Result<Self> {
        let mut frames = Vec::with_capacity(tree.tree_levels() + 1);
        let mut adr = tree.root();
        loop {
            let node = tree.node(tran, adr)?;
            let count = node.partition(|k| before(node.as_ref(), k))?;
            if node.is_leaf() {
                frames.push(Frame { node, pos: count });
                return Ok(Self { frames });
            }
            let slot = count.saturating_sub(1);
            adr = node.child(slot)?;
            frames.push(Frame { node, pos: slot });
        }
    }

    /// Moves up and over until the leaf position names a key.
    fn settle_forward(&mut self, tree: &Btree, tran: &Tran) -> Result<()> {
        loop {
            match self.frames.last() {
                None => return Ok(()),
                Some(leaf) if leaf.pos < leaf.node.len() => return Ok(()),
                Some(_) => {}
            }
            self.frames.pop();
            while let Some(top) = self.frames.last_mut() {
                if top.pos + 1 < top.node.len() {
                    top.pos += 1;
                    break;
                }
                self.frames.pop();
            }
            let Some(top) = self.frames.last() else {
                return Ok(());
            };
            let mut adr = top.node.child(top.pos)?;
            loop {
                let node = tree.node(tran, adr)?;
                let leaf = node.is_leaf();
                if !leaf {
                    adr = node.child(0)?;
                }
                self.frames.push(Frame { node, pos: 0 });
                if leaf {
                    break;
                }
            }
        }
    }

    /// Moves up and back until the leaf position is past a key.
    fn settle_backward(&mut self, tree: &Btree, tran: &Tran) -> Result<()> {
        loop {
            match self.frames.last() {
                None => return Ok(()),
                Some(leaf) if leaf.pos > 0 => return Ok(()),
                Some(_) => {}
            }
            self.frames.pop();
            while let Some(top) = self.frames.last_mut() {
                if top.pos > 0 {
                    top.pos -= 1;
                    break;
                }
                self.frames.pop();
            }
            let Some(top) = self.frames.last() else {
                return Ok(());
            };
            let mut adr = top.node.child(top.pos)?;
            loop {
                let node = tree.node(tran, adr)?;
                let n = node.len();
                if node.is_leaf() {
                    self.frames.push(Frame { node, pos: n });
                    break;
                }
                let last = n.saturating_sub(1);
                adr = node.child(last)?;
                self.frames.push(Frame { node, pos: last });
            }
        }
    }

    fn forward_key(&self) -> Result<Option<Record>> {
        match self.frames.last() {
            Some(leaf) => leaf.node.key(leaf.pos).map(Some),
            None => Ok(None),
        }
    }

    fn backward_key(&self) -> Result<Option<Record>> {
        match self.frames.last() {
            Some(leaf) => leaf.node.key(leaf.pos - 1).map(Some),
            None => Ok(None),
        }
    }
}

/// Cursor yielding `(leaf key, data address)` pairs in key order from the front
/// and in reverse from the back.
pub struct BtreeCursor<'a> {
    tree: Btree,
    tran: &'a Tran,
    lo: Bound<Record>,
    hi: Bound<Record>,
    front: Option<Path>,
    back: Option<Path>,
    last_front: Option<Record>,
    last_back: Option<Record>,
    done: bool,
}

impl<'a> BtreeCursor<'a> {
    pub(crate) fn new(tree: Btree, tran: &'a Tran, lo: Bound<Record>, hi: Bound<Record>) -> Self {
        Self {
            tree,
            tran,
            lo,
            hi,
            front: None,
            back: None,
            last_front: None,
            last_back: None,
            done: false,
        }
    }

    /// Lower bound of the cursor.
    pub fn lower(&self) -> &Bound<Record> {
        &self.lo
    }

    /// Upper bound of the cursor.
    pub fn upper(&self) -> &Bound<Record> {
        &self.hi
    }

    fn step_front(&mut self) -> Result<Option<Record>> {
        let (tree, tran) = (&self.tree, self.tran);
        match self.front.as_mut() {
            Some(path) => {
                if let Some(leaf) = path.frames.last_mut() {
                    leaf.pos += 1;
                }
                path.settle_forward(tree, tran)?;
            }
            None => {
                let mut path = match &self.lo {
                    Bound::Unbounded => Path::seek(tree, tran, |_, _| false)?,
                    Bound::Included(lo) => Path::seek(tree, tran, |n, k| {
                        if n.is_leaf() {
                            n.compare_key(k, lo, usize::MAX) == Ordering::Less
                        } else {
                            n.compare_key(k, lo, usize::MAX) != Ordering::Greater
                        }
                    })?,
                    Bound::Excluded(lo) => Path::seek(tree, tran, |n, k| {
                        n.compare_key(k, lo, lo.field_count()) != Ordering::Greater
                    })?,
                };
                path.settle_forward(tree, tran)?;
                self.front = Some(path);
            }
        }
        let Some(k) = self.front.as_ref().map(Path::forward_key).transpose()?.flatten() else {
            return Ok(None);
        };
        if !below_upper(&k, &self.hi) {
            return Ok(None);
        }
        if self.last_back.as_ref().is_some_and(|b| k.compare(b) != Ordering::Less) {
            return Ok(None);
        }
        Ok(Some(k))
    }

    fn step_back(&mut self) -> Result<Option<Record>> {
        let (tree, tran) = (&self.tree, self.tran);
        match self.back.as_mut() {
            Some(path) => {
                if let Some(leaf) = path.frames.last_mut() {
                    leaf.pos -= 1;
                }
                path.settle_backward(tree, tran)?;
            }
            None => {
                let mut path = match &self.hi {
                    Bound::Unbounded => Path::seek(tree, tran, |_, _| true)?,
                    Bound::Included(hi) => Path::seek(tree, tran, |n, k| {
                        n.compare_key(k, hi, hi.field_count()) != Ordering::Greater
                    })?,
                    Bound::Excluded(hi) => Path::seek(tree, tran, |n, k| {
                        n.compare_key(k, hi, hi.field_count()) == Ordering::Less
                    })?,
                };
                path.settle_backward(tree, tran)?;
                self.back = Some(path);
            }
        }
        let Some(k) = self.back.as_ref().map(Path::backward_key).transpose()?.flatten() else {
            return Ok(None);
        };
        if !above_lower(&k, &self.lo) {
            return Ok(None);
        }
        if self.last_front.as_ref().is_some_and(|f| k.compare(f) != Ordering::Greater) {
            return Ok(None);
        }
        Ok(Some(k))
    }

    fn finish(&mut self, step: Result<Option<Record>>, front: bool) -> Option<Result<(Record, Address)>> {
        match step.and_then(|k| k.map(|k| key::data_address(&k).map(|a| (k, a))).transpose()) {
            Ok(Some((k, adr))) => {
                if front {
                    self.last_front = Some(k.clone());
                } else {
                    self.last_back = Some(k.clone());
                }
                Some(Ok((k, adr)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl Iterator for BtreeCursor<'_> {
    type Item = Result<(Record, Address)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self.step_front();
        self.finish(step, true)
    }
}

impl DoubleEndedIterator for BtreeCursor<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self.step_back();
        self.finish(step, false)
    }
}
