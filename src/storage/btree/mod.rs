#![forbid(unsafe_code)]

//! Persistent copy-on-write B+tree over [`Record`] keys.
//!
//! A [`Btree`] is a small value: a root address, the tree height, and the
//! [`Redirects`] its nodes are resolved through. Every change builds new nodes in
//! the transaction's intref table and redirects the modified node's logical
//! address to the new version, so ancestors are never rewritten and any earlier
//! clone of the value keeps seeing the tree as it was.
//!
//! Nodes split once they exceed [`BtreeOptions::max_node_size`] keys and are
//! never merged; a node that becomes empty is dropped from its parent.

mod cursor;
pub mod key;
mod node;
mod persist;

pub use cursor::{above_lower, below_upper, in_range, BtreeCursor};
pub use node::{BtreeNode, NodeKeys, StoredKeys};
pub use persist::persist_trees;

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

use tracing::trace;

use crate::storage::record::Record;
use crate::storage::tran::{Redirects, Tran};
use crate::types::{Address, Result, StoreError};

/// Default split threshold.
pub const DEFAULT_MAX_NODE_SIZE: usize = 100;

/// Tuning for [`Btree`].
#[derive(Clone, Debug)]
pub struct BtreeOptions {
    /// A node holding more keys than this is split.
    pub max_node_size: usize,
}

impl Default for BtreeOptions {
    fn default() -> Self {
        Self {
            max_node_size: DEFAULT_MAX_NODE_SIZE,
        }
    }
}

impl BtreeOptions {
    /// Sets the split threshold.
    pub fn max_node_size(mut self, keys: usize) -> Self {
        self.max_node_size = keys;
        self
    }

    /// Rejects thresholds too small to split.
    pub fn validate(&self) -> Result<()> {
        if self.max_node_size < 2 {
            return Err(StoreError::Invalid("max node size must be at least 2"));
        }
        Ok(())
    }
}

/// Outcome of [`Btree::update`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateResult {
    /// The old key was replaced.
    Ok,
    /// The old key was not in the tree; nothing changed.
    NotFound,
    /// The new key could not be added; nothing changed.
    AddFailed,
}

/// Counts gathered by [`Btree::check`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BtreeCheck {
    /// Leaf keys.
    pub keys: usize,
    /// Nodes visited.
    pub nodes: usize,
}

enum Insert {
    Duplicate,
    Done,
    Split(Record),
}

enum Remove {
    NotFound,
    Done,
    Emptied,
}

/// Handle on one version of a tree.
#[derive(Clone)]
pub struct Btree {
    root: Address,
    levels: usize,
    redirs: Redirects,
    opts: BtreeOptions,
}

impl Btree {
    /// A new empty tree whose root leaf lives in `tran`.
    pub fn create(tran: &mut Tran, redirs: Redirects, opts: BtreeOptions) -> Self {
        let root = tran.add_node(BtreeNode::empty_leaf());
        Self {
            root,
            levels: 0,
            redirs,
            opts,
        }
    }

    /// Handle on an existing tree.
    pub fn open(root: Address, levels: usize, redirs: Redirects, opts: BtreeOptions) -> Self {
        Self {
            root,
            levels,
            redirs,
            opts,
        }
    }

    /// Logical address of the root node.
    pub fn root(&self) -> Address {
        self.root
    }

    /// Height of the tree; 0 when the root is a leaf.
    pub fn tree_levels(&self) -> usize {
        self.levels
    }

    /// Redirects this handle resolves nodes through.
    pub fn redirects(&self) -> &Redirects {
        &self.redirs
    }

    /// Replaces the redirects, for trees that share one map.
    pub fn set_redirects(&mut self, redirs: Redirects) {
        self.redirs = redirs;
    }

    /// Tuning in effect.
    pub fn options(&self) -> &BtreeOptions {
        &self.opts
    }

    pub(crate) fn set_root(&mut self, root: Address) {
        self.root = root;
    }

    /// Current version of the node at logical address `adr`.
    pub fn node(&self, tran: &Tran, adr: Address) -> Result<Arc<BtreeNode>> {
        tran.node(self.redirs.resolve(adr)?)
    }

    /// Data address of the first key starting with `search`.
    ///
    /// `search` may be a full leaf key or just its leading index fields.
    pub fn get(&self, tran: &Tran, search: &Record) -> Result<Option<Address>> {
        let mut cursor = self.cursor(
            tran,
            Bound::Included(search.clone()),
            Bound::Included(search.clone()),
        );
        match cursor.next() {
            Some(Ok((_, adr))) => Ok(Some(adr)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Inserts `key`. Returns false if it is already present or, when `unique`
    /// is set, if another key has the same index fields.
    pub fn add(&mut self, tran: &mut Tran, key: &Record, unique: bool) -> Result<bool> {
        if key.is_empty() {
            return Err(StoreError::Invalid("btree key must carry a data address"));
        }
        if unique && self.get(tran, &key::index_fields(key))?.is_some() {
            return Ok(false);
        }
        let root = self.root;
        match self.insert(tran, root, key)? {
            Insert::Duplicate => return Ok(false),
            Insert::Done => {}
            Insert::Split(sep) => {
                let left = key::sentinel(root);
                self.root = tran.add_node(BtreeNode::built(self.levels + 1, vec![left, sep]));
                self.levels += 1;
                trace!(levels = self.levels, "btree.root_split");
            }
        }
        Ok(true)
    }

    /// Removes `key`. Returns false if it was not present.
    pub fn remove(&mut self, tran: &mut Tran, key: &Record) -> Result<bool> {
        let root = self.root;
        match self.delete(tran, root, key)? {
            Remove::NotFound => Ok(false),
            Remove::Done => Ok(true),
            Remove::Emptied => {
                if self.levels == 0 {
                    self.replace(tran, root, BtreeNode::empty_leaf())?;
                } else {
                    self.redirs = self.redirs.without(root)?;
                    self.root = tran.add_node(BtreeNode::empty_leaf());
                    self.levels = 0;
                    trace!("btree.collapse");
                }
                Ok(true)
            }
        }
    }

    /// Replaces `old` with `new` as a single step; on failure the tree is unchanged.
    pub fn update(
        &mut self,
        tran: &mut Tran,
        old: &Record,
        new: &Record,
        unique: bool,
    ) -> Result<UpdateResult> {
        let mut next = self.clone();
        if !next.remove(tran, old)? {
            return Ok(UpdateResult::NotFound);
        }
        if !next.add(tran, new, unique)? {
            return Ok(UpdateResult::AddFailed);
        }
        *self = next;
        Ok(UpdateResult::Ok)
    }

    /// Cursor over keys within the bounds. Bounds compare as prefixes: an
    /// included upper bound admits every key that starts with it.
    pub fn cursor<'a>(&self, tran: &'a Tran, lo: Bound<Record>, hi: Bound<Record>) -> BtreeCursor<'a> {
        BtreeCursor::new(self.clone(), tran, lo, hi)
    }

    /// Cursor over every key.
    pub fn iter<'a>(&self, tran: &'a Tran) -> BtreeCursor<'a> {
        self.cursor(tran, Bound::Unbounded, Bound::Unbounded)
    }

    /// Estimated fraction of keys within the bounds, from two root-to-leaf
    /// descents. Always within `[0, 1]`.
    pub fn rangefrac(&self, tran: &Tran, lo: &Bound<Record>, hi: &Bound<Record>) -> Result<f64> {
        let root = self.node(tran, self.root)?;
        if root.is_empty() {
            return Ok(0.0);
        }
        let start = match lo {
            Bound::Unbounded => 0.0,
            Bound::Included(k) => self.position(tran, |n, key| {
                n.compare_key(key, k, usize::MAX) == Ordering::Less
            })?,
            Bound::Excluded(k) => self.position(tran, |n, key| {
                n.compare_key(key, k, k.field_count()) != Ordering::Greater
            })?,
        };
        let end = match hi {
            Bound::Unbounded => 1.0,
            Bound::Included(k) => self.position(tran, |n, key| {
                n.compare_key(key, k, k.field_count()) != Ordering::Greater
            })?,
            Bound::Excluded(k) => self.position(tran, |n, key| {
                n.compare_key(key, k, k.field_count()) == Ordering::Less
            })?,
        };
        Ok((end - start).clamp(0.0, 1.0))
    }

    /// Fraction of keys for which `before` holds, interpolated from slot positions.
    fn position(&self, tran: &Tran, before: impl Fn(&BtreeNode, &Record) -> bool) -> Result<f64> {
        let mut node = self.node(tran, self.root)?;
        let mut pos = 0.0;
        let mut width = 1.0;
        loop {
            let n = node.len();
            if n == 0 {
                return Ok(pos);
            }
            let count = node.partition(|k| before(node.as_ref(), k))?;
            if node.is_leaf() {
                return Ok(pos + width * count as f64 / n as f64);
            }
            let slot = count.saturating_sub(1);
            pos += width * slot as f64 / n as f64;
            width /= n as f64;
            node = self.node(tran, node.child(slot)?)?;
        }
    }

    /// Verifies ordering, levels and the first-key sentinel of every tree node.
    pub fn check(&self, tran: &Tran) -> Result<BtreeCheck> {
        let mut counts = BtreeCheck::default();
        self.check_node(tran, self.root, self.levels, None, None, &mut counts)?;
        Ok(counts)
    }

    fn check_node(
        &self,
        tran: &Tran,
        adr: Address,
        level: usize,
        lower: Option<&Record>,
        upper: Option<&Record>,
        counts: &mut BtreeCheck,
    ) -> Result<()> {
        let corrupt = |what: String| StoreError::Corruption(format!("btree node {adr}: {what}"));
        let node = self.node(tran, adr)?;
        counts.nodes += 1;
        if node.level() != level {
            return Err(corrupt(format!("level {} where {level} expected", node.level())));
        }
        if node.is_empty() && adr != self.root {
            return Err(corrupt("empty non-root node".into()));
        }
        let keys = node.to_keys()?;
        for pair in keys.windows(2) {
            if node.compare_key(&pair[0], &pair[1], usize::MAX) != Ordering::Less {
                return Err(corrupt("keys out of order".into()));
            }
        }
        if level == 0 {
            for k in &keys {
                key::data_address(k)?;
                if lower.is_some_and(|lo| k.compare(lo) == Ordering::Less)
                    || upper.is_some_and(|hi| k.compare(hi) != Ordering::Less)
                {
                    return Err(corrupt("leaf key outside its parent's range".into()));
                }
            }
            counts.keys += keys.len();
            return Ok(());
        }
        if !keys.first().is_some_and(key::is_sentinel) {
            return Err(corrupt("first key is not a sentinel".into()));
        }
        if keys.iter().skip(1).any(key::is_sentinel) {
            return Err(corrupt("sentinel after the first key".into()));
        }
        let seps: Vec<Record> = keys
            .iter()
            .map(|k| key::separator(k, false))
            .collect();
        for (i, k) in keys.iter().enumerate() {
            if !key::is_sentinel(k) {
                let sep = &seps[i];
                if lower.is_some_and(|lo| sep.compare(lo) == Ordering::Less)
                    || upper.is_some_and(|hi| sep.compare(hi) != Ordering::Less)
                {
                    return Err(corrupt("tree key outside its parent's range".into()));
                }
            }
            let child_lower = if key::is_sentinel(k) { lower } else { Some(&seps[i]) };
            let child_upper = seps.get(i + 1).or(upper);
            self.check_node(
                tran,
                key::child_address(k)?,
                level - 1,
                child_lower,
                child_upper,
                counts,
            )?;
        }
        Ok(())
    }

    fn replace(&mut self, tran: &mut Tran, logical: Address, node: BtreeNode) -> Result<()> {
        let adr = tran.add_node(node);
        self.redirs = self.redirs.with(logical, adr)?;
        Ok(())
    }

    fn insert(&mut self, tran: &mut Tran, logical: Address, key: &Record) -> Result<Insert> {
        let node = self.node(tran, logical)?;
        let level = node.level();
        let mut keys = node.to_keys()?;
        let pos = if node.is_leaf() {
            let pos = node.lower_bound(key)?;
            if keys.get(pos) == Some(key) {
                return Ok(Insert::Duplicate);
            }
            keys.insert(pos, key.clone());
            pos
        } else {
            let slot = node.child_slot(key)?;
            let child = key::child_address(&keys[slot])?;
            match self.insert(tran, child, key)? {
                Insert::Split(sep) => {
                    keys.insert(slot + 1, sep);
                    slot + 1
                }
                Insert::Done => {
                    tran.mark_dirty(logical);
                    return Ok(Insert::Done);
                }
                Insert::Duplicate => return Ok(Insert::Duplicate),
            }
        };
        self.store_or_split(tran, logical, level, keys, pos)
    }

    fn store_or_split(
        &mut self,
        tran: &mut Tran,
        logical: Address,
        level: usize,
        mut keys: Vec<Record>,
        pos: usize,
    ) -> Result<Insert> {
        if keys.len() <= self.opts.max_node_size {
            self.replace(tran, logical, BtreeNode::built(level, keys))?;
            return Ok(Insert::Done);
        }
        let mut right = if pos == keys.len() - 1 {
            // Appending past the end leaves the original node as it was.
            keys.split_off(pos)
        } else {
            let right = keys.split_off(keys.len() / 2);
            self.replace(tran, logical, BtreeNode::built(level, keys))?;
            right
        };
        let sep = key::separator(&right[0], level == 0);
        if level > 0 {
            // The separator moves up; the right node keeps only the child.
            right[0] = key::sentinel(key::child_address(&right[0])?);
        }
        let right = tran.add_node(BtreeNode::built(level, right));
        trace!(level, "btree.split");
        Ok(Insert::Split(key::tree_key(&sep, right)))
    }

    fn delete(&mut self, tran: &mut Tran, logical: Address, key: &Record) -> Result<Remove> {
        let node = self.node(tran, logical)?;
        let level = node.level();
        let mut keys = node.to_keys()?;
        if node.is_leaf() {
            let pos = node.lower_bound(key)?;
            if keys.get(pos) != Some(key) {
                return Ok(Remove::NotFound);
            }
            keys.remove(pos);
        } else {
            let slot = node.child_slot(key)?;
            let child = key::child_address(&keys[slot])?;
            match self.delete(tran, child, key)? {
                Remove::Emptied => {
                    self.redirs = self.redirs.without(child)?;
                    keys.remove(slot);
                    if slot == 0 && !keys.is_empty() {
                        // The new first child takes over the node's whole lower range.
                        keys[0] = key::sentinel(key::child_address(&keys[0])?);
                    }
                }
                Remove::Done => {
                    tran.mark_dirty(logical);
                    return Ok(Remove::Done);
                }
                Remove::NotFound => return Ok(Remove::NotFound),
            }
        }
        if keys.is_empty() {
            return Ok(Remove::Emptied);
        }
        self.replace(tran, logical, BtreeNode::built(level, keys))?;
        Ok(Remove::Done)
    }
}
