#![forbid(unsafe_code)]
//! Order-preserving encoders shared by the record packer and metadata records.

pub mod ord {
    //! Order-preserving encoders for integer fields.
    //!
    //! Every encoder here produces bytes whose lexicographic order matches the
    //! numeric order of the inputs, so packed fields compare correctly inside
    //! [`crate::storage::Record`] comparisons.

    use crate::types::{Result, StoreError};

    const SIGN_BIT: u64 = 1 << 63;
    const NONNEG_BASE: u8 = 0x80;

    /// Fixed-width big-endian encoding of a u32.
    pub fn put_u32_be(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a u32 written by [`put_u32_be`].
    pub fn get_u32_be(src: &[u8]) -> Result<u32> {
        let head: [u8; 4] = src
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| StoreError::Corruption(format!("u32 field has {} bytes", src.len())))?;
        Ok(u32::from_be_bytes(head))
    }

    /// Fixed-width encoding of an i64 (sign bit flipped so negatives sort first).
    pub fn put_i64_be(dst: &mut Vec<u8>, v: i64) {
        let flipped = (v as u64) ^ SIGN_BIT;
        dst.extend_from_slice(&flipped.to_be_bytes());
    }

    /// Decodes an i64 written by [`put_i64_be`].
    pub fn get_i64_be(src: &[u8]) -> Result<i64> {
        let head: [u8; 8] = src
            .get(..8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| StoreError::Corruption(format!("i64 field has {} bytes", src.len())))?;
        Ok((u64::from_be_bytes(head) ^ SIGN_BIT) as i64)
    }

    fn significant_bytes(v: u64) -> usize {
        8 - (v.leading_zeros() as usize / 8)
    }

    /// Compact variable-width encoding of an i64.
    ///
    /// Non-negative values are `0x80 + n` followed by the `n` significant big-endian
    /// bytes. Negative values store `m = !v` as `0x7f - n` followed by the complement
    /// of `m`'s significant bytes, which keeps larger magnitudes sorting first.
    pub fn put_int(dst: &mut Vec<u8>, v: i64) {
        if v >= 0 {
            let u = v as u64;
            let n = significant_bytes(u);
            dst.push(NONNEG_BASE + n as u8);
            dst.extend_from_slice(&u.to_be_bytes()[8 - n..]);
        } else {
            let m = !(v as u64);
            let n = significant_bytes(m);
            dst.push(NONNEG_BASE - 1 - n as u8);
            dst.extend((!m).to_be_bytes()[8 - n..].iter().copied());
        }
    }

    /// Decodes an i64 written by [`put_int`].
    pub fn get_int(src: &[u8]) -> Result<i64> {
        let (&tag, body) = src
            .split_first()
            .ok_or_else(|| StoreError::Corruption("empty int field".into()))?;
        if tag >= NONNEG_BASE {
            let n = (tag - NONNEG_BASE) as usize;
            if n > 8 || body.len() != n {
                return Err(StoreError::Corruption(format!("bad int field tag {tag:#x}")));
            }
            let mut buf = [0u8; 8];
            buf[8 - n..].copy_from_slice(body);
            let u = u64::from_be_bytes(buf);
            if u > i64::MAX as u64 {
                return Err(StoreError::Corruption("int field overflows i64".into()));
            }
            Ok(u as i64)
        } else {
            let n = (NONNEG_BASE - 1 - tag) as usize;
            if n > 8 || body.len() != n {
                return Err(StoreError::Corruption(format!("bad int field tag {tag:#x}")));
            }
            let mut buf = [0xFFu8; 8];
            buf[8 - n..].copy_from_slice(body);
            let m = !u64::from_be_bytes(buf);
            Ok(!m as i64)
        }
    }
}
