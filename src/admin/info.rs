use std::path::Path;

use serde::Serialize;

use crate::admin::{AdminError, AdminOpenOptions, Result};
use crate::db::Database;

/// One index in an [`InfoReport`].
#[derive(Clone, Debug, Serialize)]
pub struct IndexSummary {
    /// Columns, as `(a,b)`.
    pub columns: String,
    /// Whether the index rejects duplicate fields.
    pub unique: bool,
    /// Tree levels above the leaves.
    pub levels: usize,
}

/// One table in an [`InfoReport`].
#[derive(Clone, Debug, Serialize)]
pub struct TableSummary {
    /// Table name.
    pub name: String,
    /// Table number.
    pub num: u32,
    /// Row count.
    pub rows: u64,
    /// Total bytes of the table's records.
    pub total_size: u64,
    /// Indexes, primary first.
    pub indexes: Vec<IndexSummary>,
}

/// Summary of the newest committed state.
#[derive(Clone, Debug, Serialize)]
pub struct InfoReport {
    /// Bytes of storage in use.
    pub size: u64,
    /// Sequence number of the newest commit.
    pub commit_seq: u64,
    /// Persistent redirects in effect.
    pub redirects: usize,
    /// Tables by name.
    pub tables: Vec<TableSummary>,
}

/// Summarizes the database at `path`.
pub fn info(path: impl AsRef<Path>, opts: &AdminOpenOptions) -> Result<InfoReport> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(AdminError::missing_database(path));
    }
    let db = Database::open(path, opts.db_options())?;
    report(&db)
}

/// Summarizes an open database.
pub fn report(db: &Database) -> Result<InfoReport> {
    let state = db.snapshot();
    let mut tables = Vec::with_capacity(state.schema().len());
    for (_, num) in state.schema().tables() {
        let info = state.table_info(num)?;
        tables.push(TableSummary {
            name: info.name.clone(),
            num: info.num.0,
            rows: info.nrows,
            total_size: info.total_size,
            indexes: info
                .indexes
                .iter()
                .map(|ix| IndexSummary {
                    columns: ix.describe(),
                    unique: ix.unique,
                    levels: ix.levels,
                })
                .collect(),
        });
    }
    Ok(InfoReport {
        size: db.storage().size(),
        commit_seq: state.commit_seq(),
        redirects: state.redirects().count()?,
        tables,
    })
}
