#![forbid(unsafe_code)]

//! Database handle and transactions.
//!
//! The live `{metadata directory, redirects, schema}` triple is an immutable
//! [`DbState`] published through an [`ArcSwap`]. Readers load it without taking
//! any lock; a commit builds the next state under the commit lock and swaps it
//! in once the commit block is sealed.

pub mod commit;
mod conflict;
mod exclusive;
mod overlay;
mod transaction;
mod update;

#[cfg(test)]
mod tests;

pub use conflict::{Conflict, ConflictKind};
pub use exclusive::{ExclusiveTransaction, IndexSpec};
pub use overlay::OverlayIter;
pub use transaction::{IndexIter, ReadTransaction, Transaction};
pub use update::UpdateTransaction;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::{DbLocks, FileLock};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::storage::btree::BtreeOptions;
use crate::storage::chunked::{Storage, StorageOptions, StorageWriter};
use crate::storage::dbinfo::{TableInfo, TableInfoRef};
use crate::storage::hash_trie::DbHashTrie;
use crate::storage::tran::Redirects;
use crate::types::{Result, StoreError, TableNum};

use commit::{CommitBlock, Footer};
use conflict::ConflictLog;

/// Options for [`Database::open`].
#[derive(Clone, Debug)]
pub struct DbOptions {
    /// Storage chunking.
    pub storage: StorageOptions,
    /// Btree split threshold.
    pub btree: BtreeOptions,
    /// Sync the file after every commit.
    pub sync_on_commit: bool,
    /// Truncate to the last intact commit when the newest one is damaged.
    pub repair_on_open: bool,
    /// Create the file when it does not exist.
    pub create_if_missing: bool,
    /// Use the chunk size recorded in an existing file instead of failing
    /// when it differs from `storage`.
    pub adopt_chunk_size: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            storage: StorageOptions::default(),
            btree: BtreeOptions::default(),
            sync_on_commit: true,
            repair_on_open: false,
            create_if_missing: true,
            adopt_chunk_size: false,
        }
    }
}

impl DbOptions {
    /// Sets the storage options.
    pub fn storage(mut self, storage: StorageOptions) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the Btree options.
    pub fn btree(mut self, btree: BtreeOptions) -> Self {
        self.btree = btree;
        self
    }

    /// Enables or disables syncing after each commit.
    pub fn sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Enables truncation of a damaged tail on open.
    pub fn repair_on_open(mut self, repair: bool) -> Self {
        self.repair_on_open = repair;
        self
    }

    /// Allows or forbids creating a missing file.
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Opens existing files with the chunk size they were written with.
    pub fn adopt_chunk_size(mut self, adopt: bool) -> Self {
        self.adopt_chunk_size = adopt;
        self
    }
}

/// Table names known to a snapshot.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    tables: BTreeMap<String, TableNum>,
}

impl Schema {
    /// Number of the table called `name`.
    pub fn table(&self, name: &str) -> Option<TableNum> {
        self.tables.get(name).copied()
    }

    /// Tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = (&str, TableNum)> + '_ {
        self.tables.iter().map(|(name, num)| (name.as_str(), *num))
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns true when there are no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub(crate) fn insert(&mut self, name: &str, num: TableNum) {
        self.tables.insert(name.to_owned(), num);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<TableNum> {
        self.tables.remove(name)
    }
}

/// One committed version of the database.
#[derive(Clone)]
pub struct DbState {
    pub(crate) dbinfo: DbHashTrie<TableInfoRef>,
    pub(crate) redirs: Redirects,
    pub(crate) schema: Arc<Schema>,
    pub(crate) commit_seq: u64,
    pub(crate) next_table: u32,
}

impl DbState {
    fn load(storage: &Arc<Storage>, footer: &Footer) -> Result<Self> {
        let dbinfo = DbHashTrie::<TableInfoRef>::load(Arc::clone(storage), footer.dbinfo)?;
        let redirs = Redirects::load(Arc::clone(storage), footer.redirs)?;
        let mut schema = Schema::default();
        dbinfo.for_each(|num, value| {
            let info = value.load(storage)?;
            if info.num.0 != num {
                return Err(StoreError::Corruption(format!(
                    "table {} filed under number {num}",
                    info.name
                )));
            }
            schema.insert(&info.name, info.num);
            Ok(())
        })?;
        Ok(Self {
            dbinfo,
            redirs,
            schema: Arc::new(schema),
            commit_seq: footer.commit_seq,
            next_table: footer.next_table,
        })
    }

    /// Sequence number of the commit that produced this state.
    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }

    /// Tables known to this state.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Redirects the state's trees resolve through.
    pub fn redirects(&self) -> &Redirects {
        &self.redirs
    }

    /// Table info by number.
    pub fn table_info(&self, num: TableNum) -> Result<Arc<TableInfo>> {
        match self.dbinfo.get(num.0)? {
            Some(value) => value.load(self.dbinfo.storage()),
            None => Err(StoreError::NotFound(format!("table number {num}"))),
        }
    }

    /// Table info by name.
    pub fn table_by_name(&self, name: &str) -> Result<Arc<TableInfo>> {
        let num = self
            .schema
            .table(name)
            .ok_or_else(|| StoreError::NotFound(format!("table {name}")))?;
        self.table_info(num)
    }
}

struct Inner {
    storage: Arc<Storage>,
    state: ArcSwap<DbState>,
    locks: DbLocks,
    conflicts: Mutex<ConflictLog>,
    options: DbOptions,
    next_txn: AtomicU64,
    _file_lock: Option<FileLock>,
}

/// Shared handle on an open database. Cloning is cheap.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Opens or creates the database file at `path`.
    ///
    /// The file is locked against other processes for as long as any handle
    /// stays open.
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let path = path.as_ref();
        if !options.create_if_missing && !path.exists() {
            return Err(StoreError::NotFound(format!("database {}", path.display())));
        }
        let io = StdFileIo::open(path, options.create_if_missing)?;
        let lock = FileLock::try_exclusive(Arc::clone(io.file()))?
            .ok_or(StoreError::Locked("database file is open in another process"))?;
        info!(path = %path.display(), "db.open");
        Self::open_inner(Arc::new(io), options, Some(lock))
    }

    /// Opens a database held entirely in memory.
    pub fn open_in_memory(options: DbOptions) -> Result<Self> {
        Self::open_with_io(Arc::new(MemFileIo::new()), options)
    }

    /// Opens a database over any byte-storage provider.
    pub fn open_with_io(io: Arc<dyn FileIo>, options: DbOptions) -> Result<Self> {
        Self::open_inner(io, options, None)
    }

    fn open_inner(io: Arc<dyn FileIo>, mut options: DbOptions, lock: Option<FileLock>) -> Result<Self> {
        options.btree.validate()?;
        if let Some(recorded) = commit::recorded_chunk_size(io.as_ref())? {
            let requested = options.storage.chunk_size;
            if recorded != requested {
                if !options.adopt_chunk_size {
                    return Err(StoreError::ChunkSize { recorded, requested });
                }
                debug!(recorded, requested, "db.chunk_size_adopted");
                options.storage.chunk_size = recorded;
            }
        }
        let storage = Arc::new(Storage::open(io, options.storage.clone())?);
        let state = if storage.size() == 0 {
            bootstrap(&storage, options.sync_on_commit)?
        } else {
            recover(&storage, &options)?;
            DbState::load(&storage, &commit::read_footer(&storage)?)?
        };
        debug!(
            commit_seq = state.commit_seq,
            tables = state.schema.len(),
            size = storage.size(),
            "db.opened"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                state: ArcSwap::from_pointee(state),
                locks: DbLocks::default(),
                conflicts: Mutex::new(ConflictLog::default()),
                options,
                next_txn: AtomicU64::new(1),
                _file_lock: lock,
            }),
        })
    }

    /// Underlying storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.inner.storage
    }

    /// Options the database was opened with.
    pub fn options(&self) -> &DbOptions {
        &self.inner.options
    }

    /// Latest committed state.
    pub fn snapshot(&self) -> Arc<DbState> {
        self.inner.state.load_full()
    }

    /// Starts a read-only transaction on the latest committed state. Never blocks.
    pub fn read_transaction(&self) -> ReadTransaction {
        ReadTransaction::new(self.clone(), self.snapshot())
    }

    /// Starts an update transaction. Fails while an exclusive transaction runs.
    pub fn update_transaction(&self) -> Result<UpdateTransaction> {
        let guard = self.inner.locks.try_shared()?;
        let id = self.inner.next_txn.fetch_add(1, Ordering::Relaxed);
        let state = {
            let mut log = self.inner.conflicts.lock();
            let state = self.snapshot();
            log.register(id, state.commit_seq);
            state
        };
        Ok(UpdateTransaction::new(self.clone(), id, state, guard))
    }

    /// Starts an exclusive transaction. Fails fast while any update or
    /// exclusive transaction is running.
    pub fn exclusive_transaction(&self) -> Result<ExclusiveTransaction> {
        let guard = self.inner.locks.try_exclusive()?;
        Ok(ExclusiveTransaction::new(self.clone(), self.snapshot(), guard))
    }

    /// Verifies the newest commit.
    pub fn fast_check(&self) -> Result<commit::FastCheck> {
        commit::fast_check(&self.inner.storage)
    }

    /// Verifies every commit.
    pub fn full_check(&self) -> Result<commit::FullCheck> {
        commit::full_check(&self.inner.storage)
    }

    pub(crate) fn locks(&self) -> &DbLocks {
        &self.inner.locks
    }

    pub(crate) fn conflicts(&self) -> &Mutex<ConflictLog> {
        &self.inner.conflicts
    }

    /// Stores the tries, seals the block and publishes the new state. Called
    /// with the commit lock held.
    pub(crate) fn publish(
        &self,
        mut writer: StorageWriter<'_>,
        block: CommitBlock,
        dbinfo: DbHashTrie<TableInfoRef>,
        redirs: Redirects,
        schema: Arc<Schema>,
        next_table: u32,
    ) -> Result<Arc<DbState>> {
        let commit_seq = self.inner.state.load().commit_seq + 1;
        let (redirs_root, redirs) = redirs.store(&mut writer)?;
        let (dbinfo_root, dbinfo) = dbinfo.store(&mut writer, |w, value| value.store(w))?;
        let footer = Footer {
            dbinfo: dbinfo_root,
            redirs: redirs_root,
            next_table,
            commit_seq,
        };
        block.finish(writer, &footer, self.inner.options.sync_on_commit)?;
        let state = Arc::new(DbState {
            dbinfo,
            redirs,
            schema,
            commit_seq,
            next_table,
        });
        self.inner.state.store(Arc::clone(&state));
        Ok(state)
    }
}

fn bootstrap(storage: &Arc<Storage>, sync: bool) -> Result<DbState> {
    let mut writer = storage.writer();
    let block = CommitBlock::begin(&mut writer)?;
    let (redirs_root, redirs) = Redirects::empty(Arc::clone(storage)).store(&mut writer)?;
    let (dbinfo_root, dbinfo) =
        DbHashTrie::<TableInfoRef>::empty(Arc::clone(storage)).store(&mut writer, |w, v| v.store(w))?;
    let footer = Footer {
        dbinfo: dbinfo_root,
        redirs: redirs_root,
        next_table: 1,
        commit_seq: 0,
    };
    block.finish(writer, &footer, sync)?;
    info!("db.bootstrap");
    Ok(DbState {
        dbinfo,
        redirs,
        schema: Arc::new(Schema::default()),
        commit_seq: 0,
        next_table: 1,
    })
}

fn recover(storage: &Storage, options: &DbOptions) -> Result<()> {
    let fast = commit::fast_check(storage)?;
    if fast.ok {
        return Ok(());
    }
    let problem = fast.problem.unwrap_or_default();
    if !options.repair_on_open {
        return Err(StoreError::Corruption(format!("newest commit damaged: {problem}")));
    }
    let full = commit::full_check(storage)?;
    if full.commits == 0 {
        return Err(StoreError::Corruption(format!("no intact commit to recover: {problem}")));
    }
    warn!(
        size = full.size,
        ok_size = full.ok_size,
        problem = problem.as_str(),
        "db.repair_truncating"
    );
    storage.truncate(full.ok_size)
}
