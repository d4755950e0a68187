//! Writing transaction-built nodes to storage at commit.
//!
//! Persisting folds the redirects into the trees. Starting at each root, a
//! node is written again when it was replaced or when something below it
//! changed, and its parent's key is rewritten to the new address. A root that
//! changed gets a new address of its own. Intref data addresses in leaf keys
//! are replaced the same way, writing the record on first use.

use std::collections::BTreeSet;

use tracing::debug;

use crate::storage::chunked::StorageWriter;
use crate::storage::record::Record;
use crate::storage::tran::{Redirects, Tran};
use crate::types::{Address, Result};

use super::{key, Btree, BtreeNode};

struct Persister<'t, 'w, 's> {
    tran: &'t mut Tran,
    writer: &'w mut StorageWriter<'s>,
    redirs: Redirects,
    /// Logical addresses whose redirect is now part of the tree.
    folded: BTreeSet<Address>,
    nodes: usize,
}

impl Persister<'_, '_, '_> {
    /// Storage address a parent should hold for the node at `logical`.
    fn fold(&mut self, logical: Address) -> Result<Address> {
        let current = self.redirs.resolve(logical)?;
        if current != logical {
            self.folded.insert(logical);
        }
        if current.is_intref() {
            if let Some(done) = self.tran.persisted(current) {
                return Ok(done);
            }
            return self.write_node(current);
        }
        if self.tran.is_dirty(logical) || self.tran.is_dirty(current) {
            return self.write_node(current);
        }
        Ok(current)
    }

    fn write_node(&mut self, adr: Address) -> Result<Address> {
        let node = self.tran.node(adr)?;
        let leaf = node.is_leaf();
        let keys = node
            .to_keys()?
            .iter()
            .map(|k| self.translate_key(k, leaf))
            .collect::<Result<Vec<_>>>()?;
        let packed = BtreeNode::built(node.level(), keys).pack()?;
        self.nodes += 1;
        self.tran.persist_node_bytes(self.writer, adr, &packed)
    }

    fn translate_key(&mut self, k: &Record, leaf: bool) -> Result<Record> {
        let n = k.field_count();
        let mut out = k.clone();
        let data_field = if leaf { n.checked_sub(1) } else { n.checked_sub(2) };
        if let Some(i) = data_field {
            let data = out.get_address(i)?;
            if data.is_intref() {
                let stored = self.tran.persist_record(self.writer, data)?;
                out = key::with_address(&out, i, stored);
            }
        }
        if !leaf {
            let child = key::child_address(&out)?;
            let target = self.fold(child)?;
            if target != child {
                out = key::with_address(&out, n - 1, target);
            }
        }
        Ok(out)
    }
}

/// Writes every tree in `roots` that changed since it was last persisted.
///
/// Each entry of `roots` is replaced by the tree's new root address. Redirects
/// reached from the roots are folded into the written nodes and removed from
/// `redirs`, as are redirects made by `tran` that no root reaches any more.
pub fn persist_trees(
    tran: &mut Tran,
    writer: &mut StorageWriter<'_>,
    redirs: &mut Redirects,
    roots: &mut [Address],
) -> Result<()> {
    let mut p = Persister {
        tran,
        writer,
        redirs: redirs.clone(),
        folded: BTreeSet::new(),
        nodes: 0,
    };
    for root in roots.iter_mut() {
        *root = p.fold(*root)?;
    }
    let mut out = p.redirs;
    let unreachable: Vec<Address> = out
        .pending()
        .into_iter()
        .filter(|(from, to)| !p.folded.contains(from) && (from.is_intref() || to.is_intref()))
        .map(|(from, _)| from)
        .collect();
    for from in p.folded.iter().chain(&unreachable) {
        out = out.without(*from)?;
    }
    debug!(
        nodes = p.nodes,
        folded = p.folded.len(),
        discarded = unreachable.len(),
        "btree.persist"
    );
    *redirs = out;
    Ok(())
}

impl Btree {
    /// Writes this tree's new nodes, leaving a handle that no longer refers to
    /// any intref node.
    pub fn persist(&mut self, tran: &mut Tran, writer: &mut StorageWriter<'_>) -> Result<()> {
        let mut roots = [self.root()];
        let mut redirs = self.redirects().clone();
        persist_trees(tran, writer, &mut redirs, &mut roots)?;
        self.set_root(roots[0]);
        self.set_redirects(redirs);
        Ok(())
    }

    /// Redirects without the entries for this tree's nodes, for dropping it.
    ///
    /// Only nodes reached through a redirect or a change are visited; an
    /// unchanged persisted subtree holds no redirects.
    pub fn release_redirects(&self, tran: &Tran) -> Result<Redirects> {
        let mut out = self.redirects().clone();
        let mut stack = vec![self.root()];
        while let Some(logical) = stack.pop() {
            let current = self.redirects().resolve(logical)?;
            if current != logical {
                out = out.without(logical)?;
            } else if !current.is_intref() && !tran.is_dirty(logical) {
                continue;
            }
            let node = tran.node(current)?;
            if node.is_leaf() {
                continue;
            }
            for i in 0..node.len() {
                stack.push(node.child(i)?);
            }
        }
        Ok(out)
    }
}
