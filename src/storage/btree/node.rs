//! Btree nodes, either read from storage or built by a transaction.
//!
//! A stored node is a record whose first field is the level and whose remaining
//! fields are the packed keys; reads slice keys straight out of storage. A built
//! node holds its keys as a vector. Nodes are never modified once created.

use std::cmp::Ordering;

use crate::storage::chunked::Storage;
use crate::storage::record::{Record, RecordBuilder};
use crate::types::{Address, Result, StoreError};

use super::key;

/// Read access to a node's ordered keys, independent of representation.
pub trait NodeKeys {
    /// Number of keys.
    fn key_count(&self) -> usize;
    /// Key `i`.
    fn key_at(&self, i: usize) -> Result<Record>;
}

/// Keys packed inside a stored node record.
#[derive(Clone, Debug)]
pub struct StoredKeys(Record);

impl NodeKeys for StoredKeys {
    fn key_count(&self) -> usize {
        self.0.field_count() - 1
    }

    fn key_at(&self, i: usize) -> Result<Record> {
        Record::from_bytes(self.0.field(i + 1))
    }
}

impl NodeKeys for Vec<Record> {
    fn key_count(&self) -> usize {
        self.len()
    }

    fn key_at(&self, i: usize) -> Result<Record> {
        self.get(i)
            .cloned()
            .ok_or_else(|| StoreError::Invariant(format!("node key {i} out of range")))
    }
}

/// A Btree node. Level 0 is a leaf.
#[derive(Clone, Debug)]
pub enum BtreeNode {
    /// Zero-copy view of a node in storage.
    Stored {
        /// Height above the leaves.
        level: usize,
        /// Packed keys.
        keys: StoredKeys,
    },
    /// Node created in memory by a transaction.
    Built {
        /// Height above the leaves.
        level: usize,
        /// Keys in order.
        keys: Vec<Record>,
    },
}

impl BtreeNode {
    /// A node holding `keys` at `level`.
    pub fn built(level: usize, keys: Vec<Record>) -> Self {
        BtreeNode::Built { level, keys }
    }

    /// An empty leaf.
    pub fn empty_leaf() -> Self {
        Self::built(0, Vec::new())
    }

    /// Reads the node stored at `adr`.
    pub fn load(storage: &Storage, adr: Address) -> Result<Self> {
        if adr.is_null() {
            return Err(StoreError::Corruption("btree node at null address".into()));
        }
        let rec = Record::from_bytes(storage.buffer(adr.offset())?)?;
        if rec.is_empty() {
            return Err(StoreError::Corruption(format!("btree node at {adr} has no level")));
        }
        let level = rec.get_int(0)?;
        if !(0..=64).contains(&level) {
            return Err(StoreError::Corruption(format!("btree node at {adr} has level {level}")));
        }
        Ok(BtreeNode::Stored {
            level: level as usize,
            keys: StoredKeys(rec),
        })
    }

    /// Height above the leaves.
    pub fn level(&self) -> usize {
        match self {
            BtreeNode::Stored { level, .. } | BtreeNode::Built { level, .. } => *level,
        }
    }

    /// Returns true for leaves.
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    fn keys(&self) -> &dyn NodeKeys {
        match self {
            BtreeNode::Stored { keys, .. } => keys,
            BtreeNode::Built { keys, .. } => keys,
        }
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys().key_count()
    }

    /// Returns true when the node has no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key `i`.
    pub fn key(&self, i: usize) -> Result<Record> {
        self.keys().key_at(i)
    }

    /// All keys, for building a modified copy.
    pub fn to_keys(&self) -> Result<Vec<Record>> {
        match self {
            BtreeNode::Built { keys, .. } => Ok(keys.clone()),
            BtreeNode::Stored { keys, .. } => (0..keys.key_count()).map(|i| keys.key_at(i)).collect(),
        }
    }

    /// Child address of tree key `i`.
    pub fn child(&self, i: usize) -> Result<Address> {
        key::child_address(&self.key(i)?)
    }

    /// Compares a key of this node with `target`, cut to `n` fields. Tree keys
    /// compare without their child address.
    pub fn compare_key(&self, k: &Record, target: &Record, n: usize) -> Ordering {
        let head = if self.is_leaf() {
            usize::MAX
        } else {
            k.field_count().saturating_sub(1)
        };
        k.compare_range(head, target, n)
    }

    /// Number of leading keys for which `before` holds. `before` must be true for
    /// a prefix of the keys and false afterwards.
    pub fn partition(&self, mut before: impl FnMut(&Record) -> bool) -> Result<usize> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if before(&self.key(mid)?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Position of the first key not less than `target`.
    pub fn lower_bound(&self, target: &Record) -> Result<usize> {
        self.partition(|k| self.compare_key(k, target, usize::MAX) == Ordering::Less)
    }

    /// Slot of the child whose range holds `target`.
    ///
    /// Tree keys are copies of leaf keys, not true separators: the correct child
    /// is the last one whose key is not greater than the target.
    pub fn child_slot(&self, target: &Record) -> Result<usize> {
        let after = self.partition(|k| self.compare_key(k, target, usize::MAX) != Ordering::Greater)?;
        Ok(after.saturating_sub(1))
    }

    /// Packs the node into its stored form.
    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut builder = RecordBuilder::new().add_int(self.level() as i64);
        for i in 0..self.len() {
            builder = builder.add(self.key(i)?.as_bytes());
        }
        let mut out = Vec::with_capacity(builder.byte_len());
        builder.pack_into(&mut out);
        Ok(out)
    }
}
