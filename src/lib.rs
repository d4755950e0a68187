//! Embedded, crash-safe storage and transaction engine.
//!
//! Data lives in an append-only, checksummed file of commit blocks. Indexes
//! are copy-on-write B+trees, table metadata sits in a persistent hash trie,
//! and transactions run against immutable snapshots with optimistic
//! validation at commit.
//!
//! ```no_run
//! use std::ops::Bound;
//! use immustore::db::{Database, DbOptions, IndexSpec, Transaction};
//! use immustore::storage::RecordBuilder;
//!
//! # fn main() -> immustore::types::Result<()> {
//! let db = Database::open("people.db", DbOptions::default())?;
//! let mut ex = db.exclusive_transaction()?;
//! ex.create_table("people", &[IndexSpec::new([0], true)])?;
//! ex.complete()?;
//!
//! let mut txn = db.update_transaction()?;
//! txn.add_record("people", RecordBuilder::new().add_int(1).add_str("ann").build())?;
//! if let Some(conflict) = txn.complete()? {
//!     eprintln!("retry: {conflict}");
//! }
//!
//! let read = db.read_transaction();
//! for item in read.iter("people", &[0], Bound::Unbounded, Bound::Unbounded)? {
//!     let (_, adr) = item?;
//!     println!("{:?}", read.get_record(adr)?);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod admin;
pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{Database, DbOptions};
pub use types::{Address, Result, StoreError};
