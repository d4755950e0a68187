#![forbid(unsafe_code)]

use std::{
    fs::File,
    io,
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::trace;

use crate::types::{Result, StoreError};

/// Raw byte-storage provider consumed by [`crate::storage::Storage`].
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes starting at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` starting at `off`, growing the file if needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to durable media.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if nothing has been written yet.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or zero-extends to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
fn read_once(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, dst, off)
}

#[cfg(unix)]
fn write_once(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, src, off)
}

#[cfg(windows)]
fn read_once(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, dst, off)
}

#[cfg(windows)]
fn write_once(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, src, off)
}

#[cfg(not(any(unix, windows)))]
fn read_once(_file: &File, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "positioned reads unsupported"))
}

#[cfg(not(any(unix, windows)))]
fn write_once(_file: &File, _src: &[u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "positioned writes unsupported"))
}

/// Positioned read that retries short reads; EOF before `dst` is full is an error.
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    while !dst.is_empty() {
        match read_once(file, dst, off)? {
            0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of file")),
            n => {
                dst = &mut dst[n..];
                off += n as u64;
            }
        }
    }
    Ok(())
}

fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    while !src.is_empty() {
        match write_once(file, src, off)? {
            0 => return Err(io::Error::new(io::ErrorKind::WriteZero, "positioned write made no progress")),
            n => {
                src = &src[n..];
                off += n as u64;
            }
        }
    }
    Ok(())
}

/// File-backed provider sharing one handle through an `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens `path` for read-write access, creating it when `create` is set.
    pub fn open(path: impl AsRef<Path>, create: bool) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)
            .map_err(StoreError::from)?;
        Ok(Self::new(file))
    }

    /// The underlying file handle, used for advisory locking.
    pub fn file(&self) -> &Arc<File> {
        &self.inner
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        trace!(off, len = dst.len(), "io.read_at");
        read_exact_at(&self.inner, off, dst).map_err(StoreError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write_at");
        write_all_at(&self.inner, off, src).map_err(StoreError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(StoreError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata().map_err(StoreError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(StoreError::from)
    }
}

/// In-memory provider for tests and throwaway databases.
///
/// Clones share the same buffer, so a test can "reopen" a database by handing a
/// clone to a fresh [`crate::db::Database`].
#[derive(Clone, Default)]
pub struct MemFileIo {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Applies `f` to the raw bytes, for corruption tests.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut self.data.write())
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = usize::try_from(off).map_err(|_| StoreError::Invalid("offset overflow"))?;
        let end = start
            .checked_add(dst.len())
            .ok_or(StoreError::Invalid("offset overflow"))?;
        if end > data.len() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of in-memory file",
            )));
        }
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let start = usize::try_from(off).map_err(|_| StoreError::Invalid("offset overflow"))?;
        let end = start
            .checked_add(src.len())
            .ok_or(StoreError::Invalid("offset overflow"))?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| StoreError::Invalid("length overflow"))?;
        self.data.write().resize(len, 0);
        Ok(())
    }
}
