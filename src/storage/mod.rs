//! Persistent structures of the engine.
//!
//! Everything here is append-only: objects are written once into [`Storage`]
//! and never modified afterwards. Changes are expressed as new versions that
//! share structure with the old ones.

/// Chunked append-only byte space.
pub mod chunked;

/// Ordered field packing.
pub mod record;

/// Transaction-local objects and node redirects.
pub mod tran;

/// Persistent 16-way trie over small integer keys.
pub mod hash_trie;

/// Copy-on-write B+tree over records.
pub mod btree;

/// Metadata directory values.
pub mod dbinfo;

pub use btree::{Btree, BtreeCursor, BtreeOptions, UpdateResult};
pub use chunked::{Storage, StorageIter, StorageOptions, StorageWriter};
pub use dbinfo::{IndexInfo, TableInfo, TableInfoRef};
pub use hash_trie::DbHashTrie;
pub use record::{Record, RecordBuilder};
pub use tran::{IntRef, IntRefs, Redirects, Tran};
