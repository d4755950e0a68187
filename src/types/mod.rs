#![forbid(unsafe_code)]
//! Shared identifiers, the crate error type, and checksum helpers.

use std::fmt;

/// Checksum helpers for commit blocks.
pub mod checksum;

pub use checksum::{Checksum, Crc32Fast};

/// Byte alignment of every storage allocation.
pub const ALIGN: u64 = 8;
/// Shift applied to convert between byte offsets and compact addresses.
pub const ALIGN_SHIFT: u32 = 3;

const INTREF_BIT: u32 = 0x8000_0000;

/// Compact 32-bit reference to either persistent storage or a transaction-local object.
///
/// Persistent addresses hold `offset >> 3`; offsets are always 8-byte aligned so no
/// information is lost. When bit 31 is set the remaining bits index the owning
/// transaction's intref table instead.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Address(pub u32);

impl Address {
    /// The null address; no object ever lives at offset zero.
    pub const NULL: Address = Address(0);

    /// Largest byte offset representable by a persistent address.
    pub const MAX_OFFSET: u64 = ((INTREF_BIT - 1) as u64) << ALIGN_SHIFT;

    /// Converts an aligned storage offset into its compact form.
    pub fn from_offset(offset: u64) -> Result<Self> {
        if offset % ALIGN != 0 {
            return Err(StoreError::Invalid("storage offset not aligned"));
        }
        if offset > Self::MAX_OFFSET {
            return Err(StoreError::Invalid("storage offset exceeds address range"));
        }
        Ok(Address((offset >> ALIGN_SHIFT) as u32))
    }

    /// Builds the intref address for slot `index` of a transaction's intref table.
    pub fn intref(index: u32) -> Self {
        debug_assert!(index < INTREF_BIT, "intref index overflow");
        Address(INTREF_BIT | index)
    }

    /// Returns `true` for transaction-local handles.
    pub const fn is_intref(self) -> bool {
        self.0 & INTREF_BIT != 0
    }

    /// Returns `true` for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Index into the intref table. Only meaningful when [`Address::is_intref`] holds.
    pub const fn intref_index(self) -> u32 {
        self.0 & !INTREF_BIT
    }

    /// Byte offset of a persistent address.
    pub const fn offset(self) -> u64 {
        (self.0 as u64) << ALIGN_SHIFT
    }

    /// Encodes the address as four big-endian bytes, preserving numeric order.
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Decodes an address written by [`Address::to_bytes`].
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        let raw: [u8; 4] = src
            .try_into()
            .map_err(|_| StoreError::Corruption(format!("address field has {} bytes", src.len())))?;
        Ok(Address(u32::from_be_bytes(raw)))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_intref() {
            write!(f, "Intref({})", self.intref_index())
        } else {
            write!(f, "Address({:#x})", self.offset())
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Table number used as the metadata directory key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TableNum(pub u32);

impl fmt::Display for TableNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the storage and transaction engine.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Checksum or structural damage detected in persistent data.
    #[error("corruption: {0}")]
    Corruption(String),
    /// The caller passed an unusable argument or misused an API.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The file was written with a different chunk size than requested.
    #[error("file uses chunk size {recorded}, opened with {requested}")]
    ChunkSize {
        /// Chunk size recorded in the file.
        recorded: usize,
        /// Chunk size in the open options.
        requested: usize,
    },
    /// A named table, index or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Adding a key would duplicate an entry of a unique index.
    #[error("duplicate key in unique index {index} of table {table}")]
    Constraint {
        /// Table name.
        table: String,
        /// Index column list, rendered for display.
        index: String,
    },
    /// Internal consistency failure; the enclosing transaction is aborted.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// The whole-database lock could not be taken.
    #[error("database locked: {0}")]
    Locked(&'static str),
    /// The transaction was already completed or aborted.
    #[error("transaction already ended")]
    TransactionEnded,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Rounds `n` up to the storage alignment.
pub const fn align_up(n: u64) -> u64 {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_offset_roundtrip() {
        let adr = Address::from_offset(4096).unwrap();
        assert_eq!(adr.offset(), 4096);
        assert!(!adr.is_intref());
        assert!(Address::from_offset(4097).is_err());
        assert!(Address::from_offset(Address::MAX_OFFSET + ALIGN).is_err());
    }

    #[test]
    fn intref_bit_distinguishes_handles() {
        let adr = Address::intref(17);
        assert!(adr.is_intref());
        assert_eq!(adr.intref_index(), 17);
        assert!(!Address::NULL.is_intref());
        assert!(Address::NULL.is_null());
    }

    #[test]
    fn address_bytes_preserve_order() {
        let a = Address(5).to_bytes();
        let b = Address(300).to_bytes();
        assert!(a < b);
        assert_eq!(Address::from_bytes(&b).unwrap(), Address(300));
        assert!(Address::from_bytes(&b[..3]).is_err());
    }

    #[test]
    fn align_up_rounds_to_eight() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(13), 16);
    }
}
