#![forbid(unsafe_code)]

/// Incremental checksum over a sequence of byte slices.
pub trait Checksum {
    /// Clears all accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;

    /// Feeds `len` zero bytes, used for fields that are zeroed while checksumming.
    fn update_zeros(&mut self, len: usize) {
        const ZEROS: [u8; 64] = [0u8; 64];
        let mut left = len;
        while left > 0 {
            let n = left.min(ZEROS.len());
            self.update(&ZEROS[..n]);
            left -= n;
        }
    }
}

/// CRC-32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksums a commit block held in one buffer, treating `checksum_at..checksum_at + 4`
/// as zero.
pub fn block_crc32(block: &[u8], checksum_at: usize) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&block[..checksum_at]);
    hasher.update_zeros(4);
    hasher.update(&block[checksum_at + 4..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_trait_roundtrip() {
        let mut c = Crc32Fast::default();
        c.update(b"hello");
        let first = c.finalize();
        c.update(b" world");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"hello world");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn block_crc_ignores_checksum_field() {
        let mut block = vec![7u8; 32];
        let clean = block_crc32(&block, 24);
        block[24..28].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        assert_eq!(block_crc32(&block, 24), clean);
        block[3] ^= 1;
        assert_ne!(block_crc32(&block, 24), clean);
    }

    #[test]
    fn zeros_match_explicit_zero_bytes() {
        let mut a = Crc32Fast::default();
        a.update_zeros(150);
        let mut b = Crc32Fast::default();
        b.update(&[0u8; 150]);
        assert_eq!(a.finalize(), b.finalize());
    }
}
