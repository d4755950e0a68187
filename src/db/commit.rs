#![forbid(unsafe_code)]

//! Commit blocks and log verification.
//!
//! The file is a sequence of commit blocks:
//!
//! ```text
//! header  [size: u32] [chunk size: u32] [timestamp ms: u64]
//! body    records, btree nodes, trie nodes, table infos
//! footer  [magic: u32] [dbinfo root: u32] [redirects root: u32] [next table: u32] [commit seq: u64]
//! trailer [crc32: u32] [size: u32]
//! ```
//!
//! All integers are big-endian. `size` covers the whole block and is repeated
//! in the trailer so the newest block can be found from the end of the file.
//! Every header records the storage chunk size. Openers read it from the
//! first block.
//! The checksum covers every byte of the block with the crc field read as zero.
//! A header never straddles a chunk boundary: when fewer than
//! [`HEADER_LEN`] bytes remain in a chunk the next block starts in the next one.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::storage::chunked::{Storage, StorageWriter};
use crate::types::checksum::{block_crc32, Checksum, Crc32Fast};
use crate::types::{Address, Result, StoreError};

/// Header bytes at the start of every block.
pub const HEADER_LEN: usize = 16;
/// Footer plus trailer at the end of every block.
pub const TAIL_LEN: usize = 32;
/// Smallest possible block.
pub const MIN_BLOCK_LEN: u64 = (HEADER_LEN + TAIL_LEN) as u64;

const FOOTER_MAGIC: u32 = 0x494D_5331; // "IMS1"
const CRC_FROM_END: usize = 8;

/// Roots recorded by the newest commit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Footer {
    /// Root of the metadata directory trie.
    pub dbinfo: Address,
    /// Root of the redirect trie.
    pub redirs: Address,
    /// Next table number to hand out.
    pub next_table: u32,
    /// Sequence number of this commit.
    pub commit_seq: u64,
}

impl Footer {
    fn encode(&self, dst: &mut [u8]) {
        dst[0..4].copy_from_slice(&FOOTER_MAGIC.to_be_bytes());
        dst[4..8].copy_from_slice(&self.dbinfo.to_bytes());
        dst[8..12].copy_from_slice(&self.redirs.to_bytes());
        dst[12..16].copy_from_slice(&self.next_table.to_be_bytes());
        dst[16..24].copy_from_slice(&self.commit_seq.to_be_bytes());
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < 24 {
            return Err(StoreError::Corruption("commit footer truncated".into()));
        }
        let magic = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if magic != FOOTER_MAGIC {
            return Err(StoreError::Corruption(format!("bad commit footer magic {magic:#x}")));
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&src[16..24]);
        Ok(Self {
            dbinfo: Address::from_bytes(&src[4..8])?,
            redirs: Address::from_bytes(&src[8..12])?,
            next_table: u32::from_be_bytes([src[12], src[13], src[14], src[15]]),
            commit_seq: u64::from_be_bytes(seq),
        })
    }
}

/// A block being staged in a [`StorageWriter`]. The header is reserved by
/// [`CommitBlock::begin`]; everything allocated afterwards is the body.
pub struct CommitBlock {
    start: u64,
}

impl CommitBlock {
    /// Reserves the block header. Must be the writer's first allocation.
    pub fn begin(writer: &mut StorageWriter<'_>) -> Result<Self> {
        if writer.position() != writer.start() {
            return Err(StoreError::Invariant("commit block must open the writer".into()));
        }
        let start = writer.alloc(HEADER_LEN)?;
        Ok(Self { start })
    }

    /// Offset of the block header.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Writes footer, trailer and checksum, then seals the writer. Returns the
    /// new logical end of storage.
    pub fn finish(self, mut writer: StorageWriter<'_>, footer: &Footer, sync: bool) -> Result<u64> {
        let tail = writer.alloc(TAIL_LEN)?;
        let end = writer.position();
        let size = u32::try_from(end - self.start)
            .map_err(|_| StoreError::Invalid("commit larger than 4 GiB"))?;
        let chunk = u32::try_from(writer.chunk_size())
            .map_err(|_| StoreError::Invalid("chunk size larger than 4 GiB"))?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        {
            let header = writer.buffer_mut(self.start, HEADER_LEN)?;
            header[0..4].copy_from_slice(&size.to_be_bytes());
            header[4..8].copy_from_slice(&chunk.to_be_bytes());
            header[8..16].copy_from_slice(&millis.to_be_bytes());
        }
        {
            let buf = writer.buffer_mut(tail, TAIL_LEN)?;
            footer.encode(&mut buf[..24]);
            buf[28..32].copy_from_slice(&size.to_be_bytes());
        }
        let rel = (self.start - writer.start()) as usize;
        let sum = block_crc32(&writer.staged()[rel..], size as usize - CRC_FROM_END);
        writer
            .buffer_mut(end - CRC_FROM_END as u64, 4)?
            .copy_from_slice(&sum.to_be_bytes());
        let end = writer.commit(sync)?;
        debug!(
            start = self.start,
            bytes = size,
            commit_seq = footer.commit_seq,
            "commit.block_written"
        );
        Ok(end)
    }
}

/// Result of verifying the newest block.
#[derive(Clone, Debug, Serialize)]
pub struct FastCheck {
    /// Whether the newest block is intact.
    pub ok: bool,
    /// Logical size of storage.
    pub size: u64,
    /// Offset of the newest block, when its size word was plausible.
    pub last_block: Option<u64>,
    /// Why the check failed.
    pub problem: Option<String>,
}

/// Result of verifying every block from the start of the file.
#[derive(Clone, Debug, Serialize)]
pub struct FullCheck {
    /// Whether every block is intact.
    pub ok: bool,
    /// Logical size of storage.
    pub size: u64,
    /// End of the last intact block; storage can be truncated to this size.
    pub ok_size: u64,
    /// Number of intact blocks.
    pub commits: u64,
    /// Why scanning stopped early.
    pub problem: Option<String>,
}

/// Verifies only the newest block, located through the trailing size word.
pub fn fast_check(storage: &Storage) -> Result<FastCheck> {
    let size = storage.size();
    let mut report = FastCheck {
        ok: false,
        size,
        last_block: None,
        problem: None,
    };
    if size == 0 {
        report.ok = true;
        return Ok(report);
    }
    if size < MIN_BLOCK_LEN {
        report.problem = Some(format!("storage of {size} bytes holds no complete commit"));
        return Ok(report);
    }
    let trailer = storage.read_from_end(4, 4)?;
    let block = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as u64;
    if block < MIN_BLOCK_LEN || block > size {
        report.problem = Some(format!("trailing size {block} out of range"));
        return Ok(report);
    }
    let start = size - block;
    report.last_block = Some(start);
    match verify_block(storage, start, size) {
        Ok(()) => report.ok = true,
        Err(problem) => report.problem = Some(problem),
    }
    if let Some(problem) = &report.problem {
        warn!(size, problem = problem.as_str(), "commit.fast_check_failed");
    }
    Ok(report)
}

/// Verifies every block from the start of storage, stopping at the first bad one.
pub fn full_check(storage: &Storage) -> Result<FullCheck> {
    let size = storage.size();
    let chunk = storage.chunk_size() as u64;
    let mut report = FullCheck {
        ok: false,
        size,
        ok_size: 0,
        commits: 0,
        problem: None,
    };
    let mut pos = 0u64;
    while pos < size {
        if chunk - pos % chunk < HEADER_LEN as u64 {
            pos += chunk - pos % chunk;
            continue;
        }
        if size - pos < MIN_BLOCK_LEN {
            report.problem = Some(format!("{} stray bytes at {pos}", size - pos));
            break;
        }
        let header = storage.read(pos, 4)?;
        let block = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        if block < MIN_BLOCK_LEN || block > size - pos {
            report.problem = Some(format!("block at {pos} has size {block}"));
            break;
        }
        if let Err(problem) = verify_block(storage, pos, pos + block) {
            report.problem = Some(problem);
            break;
        }
        pos += block;
        report.ok_size = pos;
        report.commits += 1;
    }
    if report.problem.is_none() && report.ok_size != size {
        report.problem = Some(format!("{} trailing bytes after the last block", size - report.ok_size));
    }
    report.ok = report.problem.is_none() && report.ok_size == size;
    if let Some(problem) = &report.problem {
        warn!(ok_size = report.ok_size, size, problem = problem.as_str(), "commit.full_check_failed");
    } else {
        debug!(commits = report.commits, size, "commit.full_check");
    }
    Ok(report)
}

/// Chunk size recorded in the first block header, read straight from the
/// provider. `None` for an empty file or one too short to hold a header.
pub fn recorded_chunk_size(io: &dyn FileIo) -> Result<Option<usize>> {
    if io.len()? < HEADER_LEN as u64 {
        return Ok(None);
    }
    let mut header = [0u8; 8];
    io.read_at(0, &mut header)?;
    let chunk = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    Ok((chunk != 0).then_some(chunk as usize))
}

/// Reads the footer of the newest block.
pub fn read_footer(storage: &Storage) -> Result<Footer> {
    let tail = storage.read_from_end(TAIL_LEN as u64, TAIL_LEN)?;
    Footer::decode(&tail)
}

fn verify_block(storage: &Storage, start: u64, end: u64) -> std::result::Result<(), String> {
    let check = || -> Result<std::result::Result<(), String>> {
        let header = storage.read(start, 8)?;
        let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        if start + size != end {
            return Ok(Err(format!(
                "block at {start} claims size {size}, trailer says {}",
                end - start
            )));
        }
        let chunk = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if chunk != storage.chunk_size() {
            return Ok(Err(format!(
                "block at {start} written with chunk size {chunk}, storage uses {}",
                storage.chunk_size()
            )));
        }
        let tail = storage.read(end - TAIL_LEN as u64, TAIL_LEN)?;
        let stored = u32::from_be_bytes([tail[24], tail[25], tail[26], tail[27]]);
        let crc_at = end - CRC_FROM_END as u64;
        let mut crc = Crc32Fast::default();
        let mut iter = storage.iter(start);
        while let Some(run) = iter.next_until(crc_at)? {
            crc.update(&run);
        }
        crc.update_zeros(4);
        while let Some(run) = iter.next_until(end)? {
            let skip = if iter.position() - run.len() as u64 == crc_at { 4 } else { 0 };
            crc.update(&run[skip..]);
        }
        if crc.finalize() != stored {
            return Ok(Err(format!("checksum mismatch in block at {start}")));
        }
        if let Err(err) = Footer::decode(&tail) {
            return Ok(Err(format!("block at {start}: {err}")));
        }
        Ok(Ok(()))
    };
    match check() {
        Ok(result) => result,
        Err(err) => Err(format!("block at {start} unreadable: {err}")),
    }
}
