//! Persistent 16-way trie keyed by small integers.
//!
//! Each level consumes four bits of the key, lowest bits first. Keys are table
//! numbers and storage addresses, which are already dense, so there is no hashing
//! step. A node keeps a `present` bitmap of occupied slots and an `is_value`
//! bitmap telling inline entries apart from pointers to deeper nodes. Two keys that
//! land in the same slot are pushed one level down into a new child.
//!
//! Updates copy the path from the root and never touch a node reachable from an
//! earlier trie value. Nodes read from storage, or already written by
//! [`DbHashTrie::store`], are immutable; everything else is a pending change.
//!
//! Stored node layout, big-endian:
//!
//! ```text
//! [present: u16] [is_value: u16] { [key: u32] [value: u32] | [child: u32] } per set bit
//! ```

use std::sync::Arc;

use tracing::trace;

use crate::storage::chunked::{Storage, StorageWriter};
use crate::types::{Address, Result, StoreError};

const BITS_PER_LEVEL: u32 = 4;
const SLOT_MASK: u32 = 0xF;
const MAX_SHIFT: u32 = 28;
const NODE_HEADER: usize = 4;

/// Values a [`DbHashTrie`] can hold. Stored tries keep a 32-bit word per entry.
pub trait TrieValue: Clone + Send + Sync + 'static {
    /// Rebuilds a value from the word written for it by [`DbHashTrie::store`].
    fn from_stored(raw: u32) -> Self;
}

impl TrieValue for Address {
    fn from_stored(raw: u32) -> Self {
        Address(raw)
    }
}

/// Result of a structural update that may leave its input untouched.
pub(crate) enum Change<T> {
    /// Nothing to do; the input is still current.
    Unchanged,
    /// The replacement for the input.
    Changed(T),
}

#[derive(Clone)]
enum Slot<V> {
    Entry(u32, V),
    Child(Child<V>),
}

#[derive(Clone)]
enum Child<V> {
    Stored(Address),
    Mem(Arc<Node<V>>),
}

impl<V: TrieValue> Child<V> {
    fn resolve(&self, storage: &Storage) -> Result<Arc<Node<V>>> {
        match self {
            Child::Mem(node) => Ok(Arc::clone(node)),
            Child::Stored(adr) => Ok(Arc::new(Node::load(storage, *adr)?)),
        }
    }
}

#[derive(Clone)]
struct Node<V> {
    present: u16,
    is_value: u16,
    slots: Vec<Slot<V>>,
    /// Set once the node exists in storage; such nodes are never modified.
    stored_at: Option<Address>,
}

impl<V: TrieValue> Node<V> {
    fn empty() -> Self {
        Self {
            present: 0,
            is_value: 0,
            slots: Vec::new(),
            stored_at: None,
        }
    }

    fn has(&self, bit: u32) -> bool {
        self.present & (1 << bit) != 0
    }

    fn index(&self, bit: u32) -> usize {
        (self.present & ((1u16 << bit) - 1)).count_ones() as usize
    }

    fn load(storage: &Storage, adr: Address) -> Result<Self> {
        let buf = storage.buffer(adr.offset())?;
        if buf.len() < NODE_HEADER {
            return Err(StoreError::Corruption(format!("trie node at {adr} truncated")));
        }
        let present = u16::from_be_bytes([buf[0], buf[1]]);
        let is_value = u16::from_be_bytes([buf[2], buf[3]]);
        if is_value & !present != 0 {
            return Err(StoreError::Corruption(format!("trie node at {adr} has bad bitmaps")));
        }
        let mut slots = Vec::with_capacity(present.count_ones() as usize);
        let mut pos = NODE_HEADER;
        let word = |at: usize| -> Result<u32> {
            buf.get(at..at + 4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| StoreError::Corruption(format!("trie node at {adr} truncated")))
        };
        for bit in 0..16 {
            if present & (1 << bit) == 0 {
                continue;
            }
            if is_value & (1 << bit) != 0 {
                slots.push(Slot::Entry(word(pos)?, V::from_stored(word(pos + 4)?)));
                pos += 8;
            } else {
                slots.push(Slot::Child(Child::Stored(Address(word(pos)?))));
                pos += 4;
            }
        }
        Ok(Self {
            present,
            is_value,
            slots,
            stored_at: Some(adr),
        })
    }

    /// Copy of this node that may be modified.
    fn unstored(&self) -> Self {
        Self {
            stored_at: None,
            ..self.clone()
        }
    }
}

/// Persistent integer-keyed map with structural sharing.
#[derive(Clone)]
pub struct DbHashTrie<V> {
    root: Arc<Node<V>>,
    storage: Arc<Storage>,
}

impl<V: TrieValue> DbHashTrie<V> {
    /// An empty trie whose stored nodes will live in `storage`.
    pub fn empty(storage: Arc<Storage>) -> Self {
        Self {
            root: Arc::new(Node::empty()),
            storage,
        }
    }

    /// Opens the trie rooted at `root`.
    pub fn load(storage: Arc<Storage>, root: Address) -> Result<Self> {
        let node = Node::load(&storage, root)?;
        Ok(Self {
            root: Arc::new(node),
            storage,
        })
    }

    /// Storage the trie reads stored nodes from.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Root address if the whole trie is stored, `None` with pending changes.
    pub fn stored_root(&self) -> Option<Address> {
        self.root.stored_at
    }

    /// Looks up `key`.
    pub fn get(&self, key: u32) -> Result<Option<V>> {
        let mut node = Arc::clone(&self.root);
        let mut shift = 0;
        loop {
            let bit = (key >> shift) & SLOT_MASK;
            if !node.has(bit) {
                return Ok(None);
            }
            let next = match &node.slots[node.index(bit)] {
                Slot::Entry(k, v) => return Ok((*k == key).then(|| v.clone())),
                Slot::Child(child) => child.resolve(&self.storage)?,
            };
            node = next;
            shift += BITS_PER_LEVEL;
        }
    }

    /// Returns a trie that maps `key` to `value`. `self` is unchanged.
    pub fn with(&self, key: u32, value: V) -> Result<Self> {
        let root = with_node(&self.storage, &self.root, key, value, 0)?;
        Ok(Self {
            root: Arc::new(root),
            storage: Arc::clone(&self.storage),
        })
    }

    /// Returns a trie without `key`. `self` is unchanged.
    pub fn without(&self, key: u32) -> Result<Self> {
        match without_node(&self.storage, &self.root, key, 0)? {
            Change::Unchanged => Ok(self.clone()),
            Change::Changed(root) => Ok(Self {
                root: Arc::new(root),
                storage: Arc::clone(&self.storage),
            }),
        }
    }

    /// Writes every pending node bottom-up and returns the root address along with
    /// the equivalent fully stored trie.
    ///
    /// `translate` produces the stored word for each entry of a pending node; it
    /// may write the value's own payload through the writer first.
    pub fn store(
        &self,
        writer: &mut StorageWriter<'_>,
        mut translate: impl FnMut(&mut StorageWriter<'_>, &V) -> Result<u32>,
    ) -> Result<(Address, Self)> {
        let (adr, root) = store_node(writer, &self.root, &mut translate)?;
        trace!(root = %adr, "trie.store");
        Ok((
            adr,
            Self {
                root: Arc::new(root),
                storage: Arc::clone(&self.storage),
            },
        ))
    }

    /// Visits the entries of nodes changed since the trie was loaded or stored.
    ///
    /// Stored subtrees are skipped wholesale; a changed node reports all of its
    /// entries, including ones copied unchanged along an updated path.
    pub fn traverse_changes(&self, mut f: impl FnMut(u32, &V)) {
        fn walk<V>(node: &Node<V>, f: &mut dyn FnMut(u32, &V)) {
            if node.stored_at.is_some() {
                return;
            }
            for slot in &node.slots {
                match slot {
                    Slot::Entry(k, v) => f(*k, v),
                    Slot::Child(Child::Mem(child)) => walk(child, f),
                    Slot::Child(Child::Stored(_)) => {}
                }
            }
        }
        walk(&self.root, &mut f);
    }

    /// Visits every entry, loading stored nodes as needed.
    pub fn for_each(&self, mut f: impl FnMut(u32, &V) -> Result<()>) -> Result<()> {
        fn walk<V: TrieValue>(
            storage: &Storage,
            node: &Node<V>,
            f: &mut dyn FnMut(u32, &V) -> Result<()>,
        ) -> Result<()> {
            for slot in &node.slots {
                match slot {
                    Slot::Entry(k, v) => f(*k, v)?,
                    Slot::Child(child) => {
                        let node = child.resolve(storage)?;
                        walk::<V>(storage, &node, f)?;
                    }
                }
            }
            Ok(())
        }
        walk(&self.storage, &self.root, &mut f)
    }
}

fn with_node<V: TrieValue>(
    storage: &Storage,
    node: &Node<V>,
    key: u32,
    value: V,
    shift: u32,
) -> Result<Node<V>> {
    let bit = (key >> shift) & SLOT_MASK;
    let idx = node.index(bit);
    let mut out = node.unstored();
    if !node.has(bit) {
        out.present |= 1 << bit;
        out.is_value |= 1 << bit;
        out.slots.insert(idx, Slot::Entry(key, value));
        return Ok(out);
    }
    match &node.slots[idx] {
        Slot::Entry(k, _) if *k == key => out.slots[idx] = Slot::Entry(key, value),
        Slot::Entry(k, v) => {
            if shift >= MAX_SHIFT {
                return Err(StoreError::Invariant(format!(
                    "trie keys {k} and {key} collide at every level"
                )));
            }
            let child = with_node(storage, &Node::empty(), *k, v.clone(), shift + BITS_PER_LEVEL)?;
            let child = with_node(storage, &child, key, value, shift + BITS_PER_LEVEL)?;
            out.is_value &= !(1 << bit);
            out.slots[idx] = Slot::Child(Child::Mem(Arc::new(child)));
        }
        Slot::Child(child) => {
            let child = child.resolve(storage)?;
            let updated = with_node(storage, &child, key, value, shift + BITS_PER_LEVEL)?;
            out.slots[idx] = Slot::Child(Child::Mem(Arc::new(updated)));
        }
    }
    Ok(out)
}

fn without_node<V: TrieValue>(
    storage: &Storage,
    node: &Node<V>,
    key: u32,
    shift: u32,
) -> Result<Change<Node<V>>> {
    let bit = (key >> shift) & SLOT_MASK;
    if !node.has(bit) {
        return Ok(Change::Unchanged);
    }
    let idx = node.index(bit);
    let mut out = node.unstored();
    match &node.slots[idx] {
        Slot::Entry(k, _) if *k != key => return Ok(Change::Unchanged),
        Slot::Entry(..) => {
            out.present &= !(1 << bit);
            out.is_value &= !(1 << bit);
            out.slots.remove(idx);
        }
        Slot::Child(child) => {
            let child = child.resolve(storage)?;
            let updated = match without_node(storage, &child, key, shift + BITS_PER_LEVEL)? {
                Change::Unchanged => return Ok(Change::Unchanged),
                Change::Changed(updated) => updated,
            };
            match updated.slots.as_slice() {
                [] => {
                    out.present &= !(1 << bit);
                    out.slots.remove(idx);
                }
                [Slot::Entry(k, v)] => {
                    out.is_value |= 1 << bit;
                    out.slots[idx] = Slot::Entry(*k, v.clone());
                }
                _ => out.slots[idx] = Slot::Child(Child::Mem(Arc::new(updated))),
            }
        }
    }
    Ok(Change::Changed(out))
}

fn store_node<V: TrieValue>(
    writer: &mut StorageWriter<'_>,
    node: &Node<V>,
    translate: &mut dyn FnMut(&mut StorageWriter<'_>, &V) -> Result<u32>,
) -> Result<(Address, Node<V>)> {
    if let Some(adr) = node.stored_at {
        return Ok((adr, node.clone()));
    }
    let mut buf = Vec::with_capacity(NODE_HEADER + node.slots.len() * 8);
    buf.extend_from_slice(&node.present.to_be_bytes());
    buf.extend_from_slice(&node.is_value.to_be_bytes());
    let mut slots = Vec::with_capacity(node.slots.len());
    for slot in &node.slots {
        match slot {
            Slot::Entry(k, v) => {
                let raw = translate(writer, v)?;
                buf.extend_from_slice(&k.to_be_bytes());
                buf.extend_from_slice(&raw.to_be_bytes());
                slots.push(Slot::Entry(*k, V::from_stored(raw)));
            }
            Slot::Child(Child::Stored(adr)) => {
                buf.extend_from_slice(&adr.0.to_be_bytes());
                slots.push(Slot::Child(Child::Stored(*adr)));
            }
            Slot::Child(Child::Mem(child)) => {
                let (adr, _) = store_node(writer, child, translate)?;
                buf.extend_from_slice(&adr.0.to_be_bytes());
                slots.push(Slot::Child(Child::Stored(adr)));
            }
        }
    }
    let adr = Address::from_offset(writer.append(&buf)?)?;
    Ok((
        adr,
        Node {
            present: node.present,
            is_value: node.is_value,
            slots,
            stored_at: Some(adr),
        },
    ))
}
