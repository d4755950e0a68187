use crate::db::DbOptions;
use crate::storage::btree::BtreeOptions;
use crate::storage::chunked::StorageOptions;

/// Options used when opening a database for administrative commands.
///
/// Files record their chunk size and tools use it; `storage` only matters for
/// a file too short to hold a commit header.
#[derive(Clone, Debug, Default)]
pub struct AdminOpenOptions {
    /// Storage chunking.
    pub storage: StorageOptions,
    /// Btree split threshold.
    pub btree: BtreeOptions,
}

impl AdminOpenOptions {
    /// Database options for opening an existing file read-mostly.
    pub fn db_options(&self) -> DbOptions {
        DbOptions::default()
            .storage(self.storage.clone())
            .btree(self.btree.clone())
            .create_if_missing(false)
            .adopt_chunk_size(true)
    }
}
