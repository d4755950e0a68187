//! Append-only, chunked byte space backing every persistent object.
//!
//! Offsets grow monotonically and are never reused. The space is divided into
//! fixed-size chunks that are created lazily; no allocation straddles a chunk
//! boundary, so an allocation that does not fit in the current chunk starts at the
//! next one and the skipped tail stays zero.
//!
//! Sealed bytes are immutable and shared as [`Bytes`] segments, so readers on any
//! thread slice them without copying. Only the append frontier, owned by a
//! [`StorageWriter`], is exclusive.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::primitives::io::{FileIo, MemFileIo};
use crate::types::{align_up, Result, StoreError, ALIGN};

/// Default chunk size (8 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 << 20;
/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 4096;

/// Tuning knobs for [`Storage`].
#[derive(Clone, Debug)]
pub struct StorageOptions {
    /// Size of each chunk in bytes; a multiple of the allocation alignment.
    pub chunk_size: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl StorageOptions {
    /// Sets the chunk size.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE || self.chunk_size as u64 % ALIGN != 0 {
            return Err(StoreError::Invalid(
                "chunk size must be an aligned value of at least 4 KiB",
            ));
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
struct Chunk {
    /// Immutable segments ordered by their start offset within the chunk.
    segments: Vec<(usize, Bytes)>,
    /// `false` for chunks of a reopened file that have not been read yet.
    loaded: bool,
}

struct Sealed {
    chunks: Vec<Chunk>,
    end: u64,
}

/// Chunked append-only byte space over a [`FileIo`] provider.
pub struct Storage {
    io: Arc<dyn FileIo>,
    chunk_size: usize,
    sealed: RwLock<Sealed>,
    /// Length the provider has been grown to; always whole chunks past `end`.
    file_len: Mutex<u64>,
    frontier: Mutex<()>,
}

impl Storage {
    /// Opens storage over `io`, detecting the logical end of existing content.
    pub fn open(io: Arc<dyn FileIo>, options: StorageOptions) -> Result<Self> {
        options.validate()?;
        let chunk_size = options.chunk_size;
        let file_len = io.len()?;
        let end = logical_end(io.as_ref(), file_len, chunk_size)?;
        let nchunks = chunk_count(end, chunk_size);
        let chunks = vec![Chunk::default(); nchunks];
        if file_len != end {
            info!(file_len, end, "storage trailing padding excluded");
        }
        debug!(end, chunks = nchunks, chunk_size, "storage.open");
        Ok(Self {
            io,
            chunk_size,
            sealed: RwLock::new(Sealed { chunks, end }),
            file_len: Mutex::new(file_len),
            frontier: Mutex::new(()),
        })
    }

    /// Creates empty storage held entirely in memory.
    pub fn in_memory(options: StorageOptions) -> Result<Self> {
        Self::open(Arc::new(MemFileIo::new()), options)
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Logical size: offset one past the last sealed byte.
    pub fn size(&self) -> u64 {
        self.sealed.read().end
    }

    /// Number of sealed bytes from `offset` to the end.
    pub fn size_from(&self, offset: u64) -> u64 {
        self.size().saturating_sub(offset)
    }

    /// The raw provider, used by the checker to truncate damaged tails.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    /// Sealed bytes from `offset` up to the end of the segment containing it.
    ///
    /// Every allocation lies within a single segment, so the result always covers
    /// a whole object that starts at `offset`.
    pub fn buffer(&self, offset: u64) -> Result<Bytes> {
        if offset >= self.size() {
            return Err(StoreError::Corruption(format!(
                "storage offset {offset} beyond end {}",
                self.size()
            )));
        }
        let idx = (offset / self.chunk_size as u64) as usize;
        let within = (offset % self.chunk_size as u64) as usize;
        self.ensure_loaded(idx)?;
        let sealed = self.sealed.read();
        let chunk = &sealed.chunks[idx];
        let pos = chunk
            .segments
            .partition_point(|(start, _)| *start <= within);
        if pos == 0 {
            return Err(StoreError::Corruption(format!(
                "storage offset {offset} not covered by a segment"
            )));
        }
        let (start, seg) = &chunk.segments[pos - 1];
        let rel = within - start;
        if rel >= seg.len() {
            return Err(StoreError::Corruption(format!(
                "storage offset {offset} falls in a chunk gap"
            )));
        }
        Ok(seg.slice(rel..))
    }

    /// Reads exactly `len` sealed bytes at `offset` without copying.
    pub fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let buf = self.buffer(offset)?;
        if buf.len() < len {
            return Err(StoreError::Corruption(format!(
                "short read of {len} bytes at {offset}"
            )));
        }
        Ok(buf.slice(..len))
    }

    /// Reads `len` bytes ending `back` bytes before the logical end.
    ///
    /// `read_from_end(8, 8)` returns the final eight bytes; used to locate trailers.
    pub fn read_from_end(&self, back: u64, len: usize) -> Result<Bytes> {
        let end = self.size();
        let offset = end
            .checked_sub(back)
            .ok_or_else(|| StoreError::Corruption(format!("cannot read {back} bytes back from {end}")))?;
        self.read(offset, len)
    }

    /// Forward cursor over sealed bytes starting at `offset`.
    pub fn iter(&self, offset: u64) -> StorageIter<'_> {
        StorageIter {
            storage: self,
            pos: offset,
            end: self.size(),
        }
    }

    /// Takes the append frontier. Blocks while another writer holds it.
    pub fn writer(&self) -> StorageWriter<'_> {
        let guard = self.frontier.lock();
        let start = self.size();
        StorageWriter {
            storage: self,
            _guard: guard,
            start,
            pos: start,
            buf: Vec::new(),
        }
    }

    /// Cuts the logical end back to `end`, discarding everything after it.
    pub fn truncate(&self, end: u64) -> Result<()> {
        let _frontier = self.frontier.lock();
        let mut sealed = self.sealed.write();
        if end > sealed.end {
            return Err(StoreError::Invalid("cannot truncate past the end"));
        }
        self.io.truncate(end)?;
        self.io.sync_all()?;
        *self.file_len.lock() = end;
        let nchunks = chunk_count(end, self.chunk_size);
        sealed.chunks.truncate(nchunks);
        if let Some(last) = sealed.chunks.last_mut() {
            let limit = end as usize - (nchunks - 1) * self.chunk_size;
            let mut kept = Vec::with_capacity(last.segments.len());
            for (start, seg) in last.segments.drain(..) {
                if start < limit {
                    let keep = seg.len().min(limit - start);
                    kept.push((start, seg.slice(..keep)));
                }
            }
            last.segments = kept;
        }
        sealed.end = end;
        info!(end, "storage truncated");
        Ok(())
    }

    fn ensure_loaded(&self, idx: usize) -> Result<()> {
        {
            let sealed = self.sealed.read();
            match sealed.chunks.get(idx) {
                Some(chunk) if chunk.loaded => return Ok(()),
                Some(_) => {}
                None => return Err(StoreError::Corruption(format!("chunk {idx} missing"))),
            }
        }
        let base = idx as u64 * self.chunk_size as u64;
        let len = (self.size() - base).min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; len];
        self.io.read_at(base, &mut buf)?;
        let mut sealed = self.sealed.write();
        let chunk = &mut sealed.chunks[idx];
        if !chunk.loaded {
            debug!(chunk = idx, len, "storage chunk loaded");
            // Segments sealed after open are newer than anything read from the file.
            let mut segments = vec![(0usize, Bytes::from(buf))];
            segments.retain(|(_, seg)| !seg.is_empty());
            let fresh: Vec<(usize, Bytes)> = chunk
                .segments
                .drain(..)
                .filter(|(start, _)| *start >= len)
                .collect();
            segments.extend(fresh);
            chunk.segments = segments;
            chunk.loaded = true;
        }
        Ok(())
    }

    fn seal(&self, start: u64, buf: Vec<u8>, sync: bool) -> Result<()> {
        let end = start + buf.len() as u64;
        {
            let mut file_len = self.file_len.lock();
            let grown = align_to_chunk(end, self.chunk_size as u64);
            if grown > *file_len {
                self.io.truncate(grown)?;
                *file_len = grown;
            }
        }
        self.io.write_at(start, &buf)?;
        if sync {
            self.io.sync_all()?;
        }
        let bytes = Bytes::from(buf);
        let mut sealed = self.sealed.write();
        let chunk_size = self.chunk_size as u64;
        let mut pos = start;
        while pos < end {
            let idx = (pos / chunk_size) as usize;
            let chunk_end = (idx as u64 + 1) * chunk_size;
            let piece_end = end.min(chunk_end);
            while sealed.chunks.len() <= idx {
                sealed.chunks.push(Chunk {
                    segments: Vec::new(),
                    loaded: true,
                });
            }
            let piece = bytes.slice((pos - start) as usize..(piece_end - start) as usize);
            let within = (pos % chunk_size) as usize;
            sealed.chunks[idx].segments.push((within, piece));
            pos = piece_end;
        }
        sealed.end = end;
        Ok(())
    }
}

/// Exclusive handle on the append frontier.
///
/// Allocations are staged in memory and become visible to readers only when
/// [`StorageWriter::commit`] seals them. Dropping the writer discards them.
/// Padding skipped at a chunk boundary is staged as zeros, so sealed storage has
/// no holes.
pub struct StorageWriter<'a> {
    storage: &'a Storage,
    _guard: MutexGuard<'a, ()>,
    start: u64,
    pos: u64,
    buf: Vec<u8>,
}

impl StorageWriter<'_> {
    /// Offset of the first staged byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Offset one past the last staged byte.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Chunk size of the underlying storage.
    pub fn chunk_size(&self) -> usize {
        self.storage.chunk_size
    }

    /// Reserves `n` zeroed bytes, rounded up to the alignment, and returns their offset.
    pub fn alloc(&mut self, n: usize) -> Result<u64> {
        let n = align_up(n.max(1) as u64);
        let chunk_size = self.storage.chunk_size as u64;
        if n > chunk_size {
            return Err(StoreError::Invalid("allocation larger than a storage chunk"));
        }
        let used = self.pos % chunk_size;
        if used + n > chunk_size {
            self.pad_to(self.pos - used + chunk_size);
        }
        let offset = self.pos;
        self.pad_to(self.pos + n);
        Ok(offset)
    }

    /// Allocates room for `data` and copies it in.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.alloc(data.len())?;
        self.buffer_mut(offset, data.len())?.copy_from_slice(data);
        Ok(offset)
    }

    /// Mutable view of `len` staged bytes at `offset`.
    pub fn buffer_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        if offset < self.start || offset + len as u64 > self.pos {
            return Err(StoreError::Invalid("buffer outside the staged region"));
        }
        let rel = (offset - self.start) as usize;
        Ok(&mut self.buf[rel..rel + len])
    }

    /// All staged bytes, from [`StorageWriter::start`] to [`StorageWriter::position`].
    pub fn staged(&self) -> &[u8] {
        &self.buf
    }

    /// Seals the staged bytes: writes them through, optionally syncs, and
    /// publishes them to readers.
    pub fn commit(self, sync: bool) -> Result<u64> {
        let end = self.pos;
        if self.buf.is_empty() {
            return Ok(end);
        }
        self.storage.seal(self.start, self.buf, sync)?;
        Ok(end)
    }

    fn pad_to(&mut self, target: u64) {
        let len = (target - self.start) as usize;
        self.buf.resize(len, 0);
        self.pos = target;
    }
}

/// Forward cursor over sealed storage, yielding contiguous byte runs.
pub struct StorageIter<'a> {
    storage: &'a Storage,
    pos: u64,
    end: u64,
}

impl StorageIter<'_> {
    /// Current offset.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Next run of bytes, at most up to `limit` (absolute offset).
    pub fn next_until(&mut self, limit: u64) -> Result<Option<Bytes>> {
        let limit = limit.min(self.end);
        if self.pos >= limit {
            return Ok(None);
        }
        let buf = self.storage.buffer(self.pos)?;
        let run = (buf.len() as u64).min(limit - self.pos) as usize;
        self.pos += run as u64;
        Ok(Some(buf.slice(..run)))
    }
}

impl Iterator for StorageIter<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.end;
        self.next_until(end).transpose()
    }
}

fn chunk_count(end: u64, chunk_size: usize) -> usize {
    end.div_ceil(chunk_size as u64) as usize
}

fn align_to_chunk(offset: u64, chunk_size: u64) -> u64 {
    offset.div_ceil(chunk_size) * chunk_size
}

/// Finds the end of real content, ignoring zero padding left by whole-chunk growth.
///
/// Every commit ends with an aligned word holding a nonzero size, so the logical end
/// is the aligned boundary just past the last nonzero byte.
fn logical_end(io: &dyn FileIo, file_len: u64, chunk_size: usize) -> Result<u64> {
    let mut hi = file_len;
    while hi > 0 {
        let lo = hi.saturating_sub(chunk_size as u64);
        let mut buf = vec![0u8; (hi - lo) as usize];
        io.read_at(lo, &mut buf)?;
        if let Some(last) = buf.iter().rposition(|&b| b != 0) {
            return Ok(align_up(lo + last as u64 + 1));
        }
        hi = lo;
    }
    Ok(0)
}
