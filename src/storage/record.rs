//! Immutable packed tuples of byte fields.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! [mode:2 bits | field count:14 bits] [offset table: count + 1 entries] [field n-1] .. [field 0]
//! ```
//!
//! `mode` selects the offset width (1 = u8, 2 = u16, 3 = u32), chosen as the
//! narrowest width that can hold the total record length. Entry 0 of the offset
//! table is the record length; entry `i + 1` is where field `i` starts. Fields are
//! stored back to front, so field `i` spans `offset[i + 1]..offset[i]`.
//!
//! Records compare field by field on raw bytes; a record that is a strict prefix
//! of another sorts first. Field encoders in [`crate::primitives::bytes::ord`]
//! keep that order equal to the natural order of the encoded values.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

use crate::primitives::bytes::ord;
use crate::types::{Address, Result, StoreError};

const HEADER_LEN: usize = 2;
const MAX_FIELDS: usize = (1 << 14) - 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Mode {
    Byte = 1,
    Short = 2,
    Int = 3,
}

impl Mode {
    fn width(self) -> usize {
        match self {
            Mode::Byte => 1,
            Mode::Short => 2,
            Mode::Int => 4,
        }
    }

    fn from_bits(bits: u16) -> Result<Self> {
        match bits {
            1 => Ok(Mode::Byte),
            2 => Ok(Mode::Short),
            3 => Ok(Mode::Int),
            other => Err(StoreError::Corruption(format!("bad record mode {other}"))),
        }
    }

    fn for_lengths(nfields: usize, data_len: usize) -> Self {
        for mode in [Mode::Byte, Mode::Short] {
            let total = HEADER_LEN + (nfields + 1) * mode.width() + data_len;
            let max = if mode == Mode::Byte { u8::MAX as usize } else { u16::MAX as usize };
            if total <= max {
                return mode;
            }
        }
        Mode::Int
    }
}

/// Immutable record, possibly a zero-copy slice of persistent storage.
#[derive(Clone)]
pub struct Record {
    buf: Bytes,
    mode: Mode,
    count: usize,
}

impl Record {
    /// Parses a record at the start of `buf`, trimming anything past its length.
    pub fn from_bytes(buf: Bytes) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(StoreError::Corruption("record shorter than header".into()));
        }
        let hdr = u16::from_be_bytes([buf[0], buf[1]]);
        let mode = Mode::from_bits(hdr >> 14)?;
        let count = (hdr & MAX_FIELDS as u16) as usize;
        let table_end = HEADER_LEN + (count + 1) * mode.width();
        if buf.len() < table_end {
            return Err(StoreError::Corruption("record offset table truncated".into()));
        }
        let mut rec = Record { buf, mode, count };
        let len = rec.offset(0);
        if len < table_end || len > rec.buf.len() {
            return Err(StoreError::Corruption(format!(
                "record length {len} outside {table_end}..={}",
                rec.buf.len()
            )));
        }
        rec.buf.truncate(len);
        let mut prev = len;
        for i in 1..=count {
            let off = rec.offset(i);
            if off > prev || off < table_end {
                return Err(StoreError::Corruption("record field offsets out of order".into()));
            }
            prev = off;
        }
        if prev != table_end {
            return Err(StoreError::Corruption("record has bytes between table and fields".into()));
        }
        Ok(rec)
    }

    /// Builds a record from the given fields.
    pub fn from_fields<I, F>(fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        let mut builder = RecordBuilder::new();
        for f in fields {
            builder = builder.add(f.as_ref());
        }
        builder.build()
    }

    /// A record with no fields.
    pub fn empty() -> Self {
        RecordBuilder::new().build()
    }

    /// Number of fields.
    pub fn field_count(&self) -> usize {
        self.count
    }

    /// Returns true when the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Encoded length in bytes.
    pub fn byte_len(&self) -> usize {
        self.buf.len()
    }

    /// The packed bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.buf
    }

    fn offset(&self, i: usize) -> usize {
        let w = self.mode.width();
        let at = HEADER_LEN + i * w;
        let b = &self.buf[at..at + w];
        match self.mode {
            Mode::Byte => b[0] as usize,
            Mode::Short => u16::from_be_bytes([b[0], b[1]]) as usize,
            Mode::Int => u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize,
        }
    }

    /// Field `i`, or an empty slice when `i` is past the last field.
    pub fn get(&self, i: usize) -> &[u8] {
        if i >= self.count {
            return &[];
        }
        &self.buf[self.offset(i + 1)..self.offset(i)]
    }

    /// Field `i` as a zero-copy [`Bytes`] handle.
    pub fn field(&self, i: usize) -> Bytes {
        if i >= self.count {
            return Bytes::new();
        }
        self.buf.slice(self.offset(i + 1)..self.offset(i))
    }

    /// Start offset and length of field `i` within the packed bytes.
    pub fn field_range(&self, i: usize) -> Option<(usize, usize)> {
        if i >= self.count {
            return None;
        }
        let start = self.offset(i + 1);
        Some((start, self.offset(i) - start))
    }

    /// Iterates over the fields in order.
    pub fn fields(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.count).map(move |i| self.get(i))
    }

    /// Decodes field `i` as a compact integer.
    pub fn get_int(&self, i: usize) -> Result<i64> {
        ord::get_int(self.get(i))
    }

    /// Decodes field `i` as an address.
    pub fn get_address(&self, i: usize) -> Result<Address> {
        Address::from_bytes(self.get(i))
    }

    /// Decodes field `i` as UTF-8 text.
    pub fn get_str(&self, i: usize) -> Result<&str> {
        std::str::from_utf8(self.get(i))
            .map_err(|_| StoreError::Corruption(format!("record field {i} is not UTF-8")))
    }

    /// The last field, used by Btree keys to hold an address.
    pub fn last(&self) -> &[u8] {
        match self.count {
            0 => &[],
            n => self.get(n - 1),
        }
    }

    /// A new record holding the first `n` fields.
    pub fn prefix(&self, n: usize) -> Record {
        Record::from_fields(self.fields().take(n))
    }

    /// Field-by-field lexicographic comparison.
    pub fn compare(&self, other: &Record) -> Ordering {
        self.compare_range(usize::MAX, other, usize::MAX)
    }

    /// Compares only the first `n` fields of each record.
    pub fn compare_fields(&self, other: &Record, n: usize) -> Ordering {
        self.compare_range(usize::MAX, other, n)
    }

    /// Compares the first `head` fields of `self` with `other`, both cut to `n` fields.
    ///
    /// Tree keys carry a trailing child address; comparing with
    /// `head = field_count() - 1` treats them as the leaf key they were copied from.
    pub fn compare_range(&self, head: usize, other: &Record, n: usize) -> Ordering {
        let a = head.min(self.count).min(n);
        let b = other.count.min(n);
        for i in 0..a.min(b) {
            match self.get(i).cmp(other.get(i)) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        a.cmp(&b)
    }

    /// Returns true when the first `prefix.field_count()` fields equal `prefix`.
    pub fn starts_with(&self, prefix: &Record) -> bool {
        self.count >= prefix.count
            && (0..prefix.count).all(|i| self.get(i) == prefix.get(i))
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Record {}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for field in self.fields() {
            match std::str::from_utf8(field) {
                Ok(s) if s.chars().all(|c| !c.is_control()) => list.entry(&s),
                _ => list.entry(&format_args!("0x{}", hex_string(field))),
            };
        }
        list.finish()
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Incremental record builder. Produces the same bytes as a stored record.
#[derive(Default, Clone, Debug)]
pub struct RecordBuilder {
    fields: Vec<Vec<u8>>,
}

impl RecordBuilder {
    /// Starts an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw byte field.
    pub fn add(mut self, field: &[u8]) -> Self {
        self.fields.push(field.to_vec());
        self
    }

    /// Appends an order-preserving compact integer field.
    pub fn add_int(mut self, v: i64) -> Self {
        let mut buf = Vec::with_capacity(9);
        ord::put_int(&mut buf, v);
        self.fields.push(buf);
        self
    }

    /// Appends a UTF-8 text field.
    pub fn add_str(self, s: &str) -> Self {
        self.add(s.as_bytes())
    }

    /// Appends an address field (four big-endian bytes).
    pub fn add_address(self, adr: Address) -> Self {
        self.add(&adr.to_bytes())
    }

    /// Appends every field of `rec`.
    pub fn add_fields_of(mut self, rec: &Record) -> Self {
        self.fields.extend(rec.fields().map(<[u8]>::to_vec));
        self
    }

    /// Number of fields added so far.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true when no field has been added.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Packed length the record will have.
    pub fn byte_len(&self) -> usize {
        let data: usize = self.fields.iter().map(Vec::len).sum();
        let mode = Mode::for_lengths(self.fields.len(), data);
        HEADER_LEN + (self.fields.len() + 1) * mode.width() + data
    }

    /// Packs the fields into a new record.
    pub fn build(self) -> Record {
        let mut out = Vec::with_capacity(self.byte_len());
        self.pack_into(&mut out);
        let count = self.fields.len();
        let data: usize = self.fields.iter().map(Vec::len).sum();
        Record {
            buf: Bytes::from(out),
            mode: Mode::for_lengths(count, data),
            count,
        }
    }

    /// Appends the packed bytes to `out`.
    pub fn pack_into(&self, out: &mut Vec<u8>) {
        let count = self.fields.len();
        assert!(count <= MAX_FIELDS, "record has more than {MAX_FIELDS} fields");
        let data: usize = self.fields.iter().map(Vec::len).sum();
        let mode = Mode::for_lengths(count, data);
        let w = mode.width();
        let table_end = HEADER_LEN + (count + 1) * w;
        let total = table_end + data;
        let hdr = ((mode as u16) << 14) | count as u16;
        out.extend_from_slice(&hdr.to_be_bytes());
        let push = |out: &mut Vec<u8>, v: usize| match mode {
            Mode::Byte => out.push(v as u8),
            Mode::Short => out.extend_from_slice(&(v as u16).to_be_bytes()),
            Mode::Int => out.extend_from_slice(&(v as u32).to_be_bytes()),
        };
        push(out, total);
        let mut end = total;
        for f in &self.fields {
            end -= f.len();
            push(out, end);
        }
        for f in self.fields.iter().rev() {
            out.extend_from_slice(f);
        }
    }
}
