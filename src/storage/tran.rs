//! Transaction-local object table and the redirect map.
//!
//! Objects created inside a transaction get an intref [`Address`] that is only
//! meaningful through the owning [`Tran`]. They are written to storage lazily at
//! commit and the table remembers where each one landed, so an object referenced
//! from several places is written once.
//!
//! [`Redirects`] maps the logical address of a Btree node to its newest version.
//! Modifying a node adds a redirect instead of rewriting every ancestor. The
//! redirects are folded into the trees when they are persisted.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::storage::btree::BtreeNode;
use crate::storage::chunked::{Storage, StorageWriter};
use crate::storage::hash_trie::DbHashTrie;
use crate::storage::record::Record;
use crate::types::{Address, Result, StoreError};

/// Object owned by a transaction's intref table.
#[derive(Clone, Debug)]
pub enum IntRef {
    /// A data record added by the transaction.
    Record(Record),
    /// A Btree node built by the transaction.
    Node(Arc<BtreeNode>),
}

/// Intref table: objects indexed by the low bits of their intref address.
#[derive(Default, Clone)]
pub struct IntRefs {
    objects: Vec<IntRef>,
    persisted: Vec<Option<Address>>,
}

impl IntRefs {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects created so far.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true when nothing has been created.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn push(&mut self, obj: IntRef) -> Address {
        let adr = Address::intref(self.objects.len() as u32);
        self.objects.push(obj);
        self.persisted.push(None);
        adr
    }

    /// Registers a record and returns its intref.
    pub fn add_record(&mut self, rec: Record) -> Address {
        self.push(IntRef::Record(rec))
    }

    /// Registers a node and returns its intref.
    pub fn add_node(&mut self, node: BtreeNode) -> Address {
        self.push(IntRef::Node(Arc::new(node)))
    }

    /// The object behind an intref.
    pub fn get(&self, adr: Address) -> Option<&IntRef> {
        if !adr.is_intref() {
            return None;
        }
        self.objects.get(adr.intref_index() as usize)
    }

    /// Storage address an intref was written to, if it has been.
    pub fn persisted(&self, adr: Address) -> Option<Address> {
        if !adr.is_intref() {
            return None;
        }
        self.persisted.get(adr.intref_index() as usize).copied().flatten()
    }

    fn set_persisted(&mut self, adr: Address, to: Address) {
        if let Some(slot) = self.persisted.get_mut(adr.intref_index() as usize) {
            *slot = Some(to);
        }
    }
}

/// Explicit transaction context: storage plus the transaction's own intrefs.
pub struct Tran {
    storage: Arc<Storage>,
    intrefs: IntRefs,
    /// Logical node addresses with a changed descendant.
    dirty: BTreeSet<Address>,
}

impl Tran {
    /// A fresh context with an empty intref table.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            intrefs: IntRefs::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Backing storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The intref table.
    pub fn intrefs(&self) -> &IntRefs {
        &self.intrefs
    }

    /// Registers a new record.
    pub fn add_record(&mut self, rec: Record) -> Address {
        self.intrefs.add_record(rec)
    }

    /// Registers a new node.
    pub fn add_node(&mut self, node: BtreeNode) -> Address {
        self.intrefs.add_node(node)
    }

    /// Resolves a record address, local or persistent.
    pub fn record(&self, adr: Address) -> Result<Record> {
        if adr.is_intref() {
            return match self.intrefs.get(adr) {
                Some(IntRef::Record(rec)) => Ok(rec.clone()),
                Some(IntRef::Node(_)) => Err(StoreError::Invariant(format!("{adr} is a node, not a record"))),
                None => Err(StoreError::NotFound(format!("record {adr}"))),
            };
        }
        if adr.is_null() {
            return Err(StoreError::NotFound("record at null address".into()));
        }
        Record::from_bytes(self.storage.buffer(adr.offset())?)
    }

    /// Resolves a node address, local or persistent. Redirects are not applied.
    pub fn node(&self, adr: Address) -> Result<Arc<BtreeNode>> {
        if adr.is_intref() {
            return match self.intrefs.get(adr) {
                Some(IntRef::Node(node)) => Ok(Arc::clone(node)),
                Some(IntRef::Record(_)) => Err(StoreError::Invariant(format!("{adr} is a record, not a node"))),
                None => Err(StoreError::Invariant(format!("dangling node intref {adr}"))),
            };
        }
        Ok(Arc::new(BtreeNode::load(&self.storage, adr)?))
    }

    /// Writes the record behind `adr` if it is an unwritten intref and returns its
    /// storage address. Persistent addresses pass through.
    pub fn persist_record(&mut self, writer: &mut StorageWriter<'_>, adr: Address) -> Result<Address> {
        if !adr.is_intref() {
            return Ok(adr);
        }
        if let Some(done) = self.intrefs.persisted(adr) {
            return Ok(done);
        }
        let rec = match self.intrefs.get(adr) {
            Some(IntRef::Record(rec)) => rec.clone(),
            _ => return Err(StoreError::Invariant(format!("{adr} is not a pending record"))),
        };
        let to = Address::from_offset(writer.append(rec.as_bytes())?)?;
        self.intrefs.set_persisted(adr, to);
        Ok(to)
    }

    /// Writes a packed node on behalf of the Btree persister. Intref nodes are
    /// memoized; a rewritten persistent node is not.
    pub(crate) fn persist_node_bytes(
        &mut self,
        writer: &mut StorageWriter<'_>,
        adr: Address,
        bytes: &[u8],
    ) -> Result<Address> {
        let to = Address::from_offset(writer.append(bytes)?)?;
        if adr.is_intref() {
            self.intrefs.set_persisted(adr, to);
        }
        Ok(to)
    }

    /// Storage address an intref was written to, if it has been.
    pub fn persisted(&self, adr: Address) -> Option<Address> {
        self.intrefs.persisted(adr)
    }

    /// Records that a node below the node at logical address `adr` changed, so
    /// the node must be rewritten when its tree is persisted.
    pub fn mark_dirty(&mut self, adr: Address) {
        self.dirty.insert(adr);
    }

    /// Whether a node below `adr` changed in this transaction.
    pub fn is_dirty(&self, adr: Address) -> bool {
        self.dirty.contains(&adr)
    }
}

/// Persistent map from a node's logical address to its current version.
#[derive(Clone)]
pub struct Redirects {
    trie: DbHashTrie<Address>,
}

impl Redirects {
    /// No redirects.
    pub fn empty(storage: Arc<Storage>) -> Self {
        Self {
            trie: DbHashTrie::empty(storage),
        }
    }

    /// Opens the redirect trie stored at `root`.
    pub fn load(storage: Arc<Storage>, root: Address) -> Result<Self> {
        Ok(Self {
            trie: DbHashTrie::load(storage, root)?,
        })
    }

    /// Target of a redirect from `adr`, if any.
    pub fn get(&self, adr: Address) -> Result<Option<Address>> {
        self.trie.get(adr.0)
    }

    /// Current version of the node at logical address `adr`.
    pub fn resolve(&self, adr: Address) -> Result<Address> {
        Ok(self.get(adr)?.unwrap_or(adr))
    }

    /// Adds or replaces a redirect.
    pub fn with(&self, from: Address, to: Address) -> Result<Self> {
        Ok(Self {
            trie: self.trie.with(from.0, to)?,
        })
    }

    /// Drops the redirect from `from`, if present.
    pub fn without(&self, from: Address) -> Result<Self> {
        Ok(Self {
            trie: self.trie.without(from.0)?,
        })
    }

    /// Redirects added or copied since the trie was last stored.
    pub fn pending(&self) -> Vec<(Address, Address)> {
        let mut out = Vec::new();
        self.trie.traverse_changes(|k, v| out.push((Address(k), *v)));
        out
    }

    /// Total number of redirects.
    pub fn count(&self) -> Result<usize> {
        let mut n = 0;
        self.trie.for_each(|_, _| {
            n += 1;
            Ok(())
        })?;
        Ok(n)
    }

    /// Root address when nothing is pending.
    pub fn stored_root(&self) -> Option<Address> {
        self.trie.stored_root()
    }

    /// Writes pending trie nodes. Every redirect must already be persistent on
    /// both sides.
    pub fn store(&self, writer: &mut StorageWriter<'_>) -> Result<(Address, Self)> {
        if let Some((from, _)) = self.pending().into_iter().find(|(from, _)| from.is_intref()) {
            return Err(StoreError::Invariant(format!("redirect from unpersisted node {from}")));
        }
        let (root, trie) = self.trie.store(writer, |_, to| {
            if to.is_intref() {
                return Err(StoreError::Invariant(format!("redirect to unpersisted node {to}")));
            }
            Ok(to.0)
        })?;
        Ok((root, Self { trie }))
    }
}
