#![allow(unsafe_code)]
//! Locks guarding a database: the cross-process file lock, the in-process commit
//! lock, and the whole-database lock taken by exclusive transactions.

use std::fs::File;
use std::io;
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    Mutex, MutexGuard, RawRwLock, RwLock,
};

use crate::types::{Result, StoreError};

/// Byte offset of the advisory lock region, far past any real data.
const LOCK_OFFSET: u64 = 1 << 62;
const LOCK_LEN: u64 = 1;

/// Exclusive advisory lock on a database file, released on drop.
///
/// Keeps a second process from appending to a file this process has open.
/// Locks are per process, so two handles inside one process do not exclude
/// each other; the in-process [`DbLocks`] cover that case.
pub struct FileLock {
    file: Arc<File>,
}

impl FileLock {
    /// Tries to lock `file` without blocking. Returns `Ok(None)` when another
    /// process holds the lock.
    pub fn try_exclusive(file: Arc<File>) -> Result<Option<Self>> {
        if lock_region(&file, LOCK_OFFSET, LOCK_LEN).map_err(StoreError::from)? {
            Ok(Some(Self { file }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(_err) = unlock_region(&self.file, LOCK_OFFSET, LOCK_LEN) {
            #[cfg(debug_assertions)]
            eprintln!("failed to release database file lock: {_err:?}");
        }
    }
}

/// Guard held by an update transaction for its whole lifetime.
pub type SharedDbGuard = ArcRwLockReadGuard<RawRwLock, ()>;
/// Guard held by an exclusive transaction for its whole lifetime.
pub type ExclusiveDbGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// In-process lock set shared by every handle on one database.
pub struct DbLocks {
    commit: Mutex<()>,
    database: Arc<RwLock<()>>,
}

impl Default for DbLocks {
    fn default() -> Self {
        Self {
            commit: Mutex::new(()),
            database: Arc::new(RwLock::new(())),
        }
    }
}

impl DbLocks {
    /// Serializes commit steps. Readers never take this lock.
    pub fn commit(&self) -> MutexGuard<'_, ()> {
        self.commit.lock()
    }

    /// Registers an update transaction. Fails fast while an exclusive transaction runs.
    pub fn try_shared(&self) -> Result<SharedDbGuard> {
        self.database
            .try_read_arc()
            .ok_or(StoreError::Locked("exclusive transaction in progress"))
    }

    /// Takes the whole-database lock. Fails fast if any update or exclusive
    /// transaction is in flight.
    pub fn try_exclusive(&self) -> Result<ExclusiveDbGuard> {
        self.database
            .try_write_arc()
            .ok_or(StoreError::Locked("other update transactions in progress"))
    }
}

fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, len)
    }
    #[cfg(windows)]
    {
        windows::lock_region(file, start, len)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Ok(true)
    }
}

fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file, start, len)
    }
    #[cfg(windows)]
    {
        windows::unlock_region(file, start, len)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn flock(kind: libc::c_short, start: u64, len: u64) -> libc::flock {
        // SAFETY: `flock` is a plain C struct; all-zero is a valid bit pattern and
        // platform-specific padding fields must stay zeroed.
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = kind;
        lock.l_whence = libc::SEEK_SET as _;
        lock.l_start = start as libc::off_t;
        lock.l_len = len as libc::off_t;
        lock
    }

    pub fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut lock = flock(libc::F_WRLCK as libc::c_short, start, len);
        loop {
            // SAFETY: `fd` is a live descriptor owned by `file` and `lock` is initialized.
            let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut lock = flock(libc::F_UNLCK as libc::c_short, start, len);
        // SAFETY: same as above.
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_region(file: &File, start: u64, len: u64) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
            let res = LockFileEx(
                handle as _,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if matches!(err.raw_os_error(), Some(code) if code as u32 == ERROR_LOCK_VIOLATION) {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let res = UnlockFileEx(handle as _, 0, len as u32, (len >> 32) as u32, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
