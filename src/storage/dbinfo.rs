#![forbid(unsafe_code)]

//! Metadata directory values: one [`TableInfo`] per table, keyed by table
//! number in a [`DbHashTrie`](crate::storage::hash_trie::DbHashTrie).
//!
//! A table info is stored as a record:
//!
//! ```text
//! [num] [name] [nrows] [total_size] { [index] }*
//! index = record [unique] [root] [levels] { [column] }*
//! ```

use std::fmt;
use std::sync::Arc;

use crate::storage::chunked::{Storage, StorageWriter};
use crate::storage::hash_trie::TrieValue;
use crate::storage::record::{Record, RecordBuilder};
use crate::types::{Address, Result, StoreError, TableNum};

const FIXED_FIELDS: usize = 4;

/// Definition and current root of one index.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexInfo {
    /// Row fields the index is keyed on, in order.
    pub columns: Vec<u16>,
    /// Rejects two rows with equal index fields.
    pub unique: bool,
    /// Logical address of the root node.
    pub root: Address,
    /// Tree height.
    pub levels: usize,
}

impl IndexInfo {
    /// Column list rendered as `(a,b)` for messages.
    pub fn describe(&self) -> String {
        describe_columns(&self.columns)
    }

    fn encode(&self) -> Record {
        let mut b = RecordBuilder::new()
            .add_int(self.unique as i64)
            .add_address(self.root)
            .add_int(self.levels as i64);
        for col in &self.columns {
            b = b.add_int(*col as i64);
        }
        b.build()
    }

    fn decode(rec: &Record) -> Result<Self> {
        if rec.field_count() < 3 {
            return Err(StoreError::Corruption("index info too short".into()));
        }
        let columns = (3..rec.field_count())
            .map(|i| {
                let col = rec.get_int(i)?;
                u16::try_from(col).map_err(|_| StoreError::Corruption(format!("index column {col}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            columns,
            unique: rec.get_int(0)? != 0,
            root: rec.get_address(1)?,
            levels: usize::try_from(rec.get_int(2)?)
                .map_err(|_| StoreError::Corruption("negative index levels".into()))?,
        })
    }
}

/// Renders a column list as `(a,b)`.
pub fn describe_columns(columns: &[u16]) -> String {
    let cols: Vec<String> = columns.iter().map(u16::to_string).collect();
    format!("({})", cols.join(","))
}

/// Per-table statistics and index roots.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableInfo {
    /// Directory key.
    pub num: TableNum,
    /// Table name.
    pub name: String,
    /// Live row count.
    pub nrows: u64,
    /// Bytes of live row records.
    pub total_size: u64,
    /// Indexes; the first one is the table's primary index.
    pub indexes: Vec<IndexInfo>,
}

impl TableInfo {
    /// Index keyed on exactly `columns`.
    pub fn index(&self, columns: &[u16]) -> Result<(usize, &IndexInfo)> {
        self.indexes
            .iter()
            .enumerate()
            .find(|(_, ix)| ix.columns == columns)
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "index {} on table {}",
                    describe_columns(columns),
                    self.name
                ))
            })
    }

    /// Applies a row count and byte delta.
    pub fn adjust(&mut self, rows: i64, bytes: i64) {
        self.nrows = self.nrows.saturating_add_signed(rows);
        self.total_size = self.total_size.saturating_add_signed(bytes);
    }

    /// Packs into the stored record form.
    pub fn encode(&self) -> Record {
        let mut b = RecordBuilder::new()
            .add_int(self.num.0 as i64)
            .add_str(&self.name)
            .add_int(self.nrows as i64)
            .add_int(self.total_size as i64);
        for ix in &self.indexes {
            b = b.add(ix.encode().as_bytes());
        }
        b.build()
    }

    /// Parses the stored record form.
    pub fn decode(rec: &Record) -> Result<Self> {
        if rec.field_count() < FIXED_FIELDS {
            return Err(StoreError::Corruption("table info too short".into()));
        }
        let num = u32::try_from(rec.get_int(0)?)
            .map_err(|_| StoreError::Corruption("table number out of range".into()))?;
        let indexes = (FIXED_FIELDS..rec.field_count())
            .map(|i| IndexInfo::decode(&Record::from_bytes(rec.field(i))?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            num: TableNum(num),
            name: rec.get_str(1)?.to_owned(),
            nrows: rec.get_int(2)?.max(0) as u64,
            total_size: rec.get_int(3)?.max(0) as u64,
            indexes,
        })
    }
}

/// Directory value: a stored table info or one changed since the last commit.
#[derive(Clone)]
pub enum TableInfoRef {
    /// Table info record in storage.
    Stored(Address),
    /// Pending table info.
    Mem(Arc<TableInfo>),
}

impl fmt::Debug for TableInfoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableInfoRef::Stored(adr) => write!(f, "Stored({adr})"),
            TableInfoRef::Mem(info) => write!(f, "Mem({})", info.name),
        }
    }
}

impl TrieValue for TableInfoRef {
    fn from_stored(raw: u32) -> Self {
        TableInfoRef::Stored(Address(raw))
    }
}

impl TableInfoRef {
    /// Resolves the table info, reading it from storage if needed.
    pub fn load(&self, storage: &Storage) -> Result<Arc<TableInfo>> {
        match self {
            TableInfoRef::Mem(info) => Ok(Arc::clone(info)),
            TableInfoRef::Stored(adr) => {
                let rec = Record::from_bytes(storage.buffer(adr.offset())?)?;
                Ok(Arc::new(TableInfo::decode(&rec)?))
            }
        }
    }

    /// Writes a pending table info and returns the word stored in the directory.
    /// Every index root must already be persistent.
    pub fn store(&self, writer: &mut StorageWriter<'_>) -> Result<u32> {
        match self {
            TableInfoRef::Stored(adr) => Ok(adr.0),
            TableInfoRef::Mem(info) => {
                if let Some(ix) = info.indexes.iter().find(|ix| ix.root.is_intref()) {
                    return Err(StoreError::Invariant(format!(
                        "table {} index {} has unpersisted root {}",
                        info.name,
                        ix.describe(),
                        ix.root
                    )));
                }
                let offset = writer.append(info.encode().as_bytes())?;
                Ok(Address::from_offset(offset)?.0)
            }
        }
    }
}
