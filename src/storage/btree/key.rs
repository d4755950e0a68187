//! Btree key layout.
//!
//! A leaf key is the indexed fields of a row followed by the row's data address,
//! so keys stay distinct even in non-unique indexes. A tree key is a copy of a
//! leaf key with the child address appended. The minimal sentinel is a tree key
//! holding only a child address; it sorts before every real key.

use crate::storage::record::{Record, RecordBuilder};
use crate::types::{Address, Result, StoreError};

/// Leaf key for `row` under an index on `columns`.
pub fn leaf_key(row: &Record, columns: &[u16], data: Address) -> Record {
    columns
        .iter()
        .fold(RecordBuilder::new(), |b, &col| b.add(row.get(col as usize)))
        .add_address(data)
        .build()
}

/// Indexed fields of `row` without an address, for lookups.
pub fn search_key(row: &Record, columns: &[u16]) -> Record {
    columns
        .iter()
        .fold(RecordBuilder::new(), |b, &col| b.add(row.get(col as usize)))
        .build()
}

/// Indexed fields of a leaf key.
pub fn index_fields(leaf_key: &Record) -> Record {
    leaf_key.prefix(leaf_key.field_count().saturating_sub(1))
}

/// Data address carried by a leaf key.
pub fn data_address(leaf_key: &Record) -> Result<Address> {
    if leaf_key.is_empty() {
        return Err(StoreError::Corruption("leaf key without data address".into()));
    }
    leaf_key.get_address(leaf_key.field_count() - 1)
}

/// Child address carried by a tree key.
pub(crate) fn child_address(tree_key: &Record) -> Result<Address> {
    if tree_key.is_empty() {
        return Err(StoreError::Corruption("tree key without child address".into()));
    }
    tree_key.get_address(tree_key.field_count() - 1)
}

/// Tree key routing `separator` and everything after it to `child`.
pub(crate) fn tree_key(separator: &Record, child: Address) -> Record {
    RecordBuilder::new()
        .add_fields_of(separator)
        .add_address(child)
        .build()
}

/// Minimal first key of a tree node.
pub(crate) fn sentinel(child: Address) -> Record {
    RecordBuilder::new().add_address(child).build()
}

pub(crate) fn is_sentinel(tree_key: &Record) -> bool {
    tree_key.field_count() == 1
}

/// Key a split node passes up for its new right sibling. Leaf keys are copied
/// whole; tree keys lose their own child address.
pub(crate) fn separator(first_key: &Record, leaf: bool) -> Record {
    if leaf {
        first_key.clone()
    } else {
        index_fields(first_key)
    }
}

/// Copy of `key` with field `i` replaced by `adr`.
pub(crate) fn with_address(key: &Record, i: usize, adr: Address) -> Record {
    let mut b = RecordBuilder::new();
    for (j, field) in key.fields().enumerate() {
        b = if j == i { b.add_address(adr) } else { b.add(field) };
    }
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_and_tree_keys_share_a_prefix() {
        let row = RecordBuilder::new().add_str("id7").add_str("name").add_int(3).build();
        let leaf = leaf_key(&row, &[2, 0], Address(40));
        assert_eq!(leaf.field_count(), 3);
        assert_eq!(data_address(&leaf).unwrap(), Address(40));
        assert_eq!(index_fields(&leaf), search_key(&row, &[2, 0]));

        let tree = tree_key(&separator(&leaf, true), Address(99));
        assert_eq!(child_address(&tree).unwrap(), Address(99));
        assert_eq!(separator(&tree, false), leaf);
        assert!(!is_sentinel(&tree));
        assert_eq!(
            sentinel(Address(5)).compare_range(0, &leaf, usize::MAX),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn with_address_replaces_one_field() {
        let key = RecordBuilder::new()
            .add_str("k")
            .add_address(Address::intref(3))
            .add_address(Address(9))
            .build();
        let fixed = with_address(&key, 1, Address(12));
        assert_eq!(fixed.get_address(1).unwrap(), Address(12));
        assert_eq!(fixed.get_address(2).unwrap(), Address(9));
        assert_eq!(fixed.get(0), b"k");
    }
}
