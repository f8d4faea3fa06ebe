//! Cross-process file locking for store mutation.
//!
//! Every participant that mutates a store serializes on one lock file next
//! to it. Each acquisition opens a fresh file handle, so two handles in the
//! same process exclude each other just like two processes do.
//!
//! # Safety
//! - The lock is released when the [`FileLockGuard`] is dropped
//! - The lock file is created if it doesn't exist and never deleted
//! - [`FileLock::acquire`] blocks until the lock is free; a holder that dies
//!   releases it with its file descriptor, a holder that hangs blocks everyone

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// Named exclusive lock backed by a lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLock {
    path: PathBuf,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Lock on the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the exclusive lock is acquired.
    ///
    /// # Errors
    /// - `ErrorKind::PermissionDenied` if the lock file cannot be opened
    pub fn acquire(&self) -> IoResult<FileLockGuard> {
        let file = self.open()?;
        lock(&file, true)?;
        Ok(FileLockGuard {
            file,
            path: self.path.clone(),
        })
    }

    /// Acquires the lock only if it is free right now.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another handle holds the lock
    pub fn try_acquire(&self) -> IoResult<FileLockGuard> {
        let file = self.open()?;
        lock(&file, false)?;
        Ok(FileLockGuard {
            file,
            path: self.path.clone(),
        })
    }

    fn open(&self) -> IoResult<File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
    }
}

impl FileLockGuard {
    /// Returns the path to the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well.
        let _ = unlock(&self.file);
    }
}

#[cfg(unix)]
fn lock(file: &File, blocking: bool) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let flags = if blocking {
        libc::LOCK_EX
    } else {
        libc::LOCK_EX | libc::LOCK_NB
    };
    loop {
        let result = unsafe { libc::flock(fd, flags) };
        if result == 0 {
            return Ok(());
        }
        let errno = IoError::last_os_error();
        match errno.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EWOULDBLOCK) => {
                return Err(IoError::new(ErrorKind::WouldBlock, "store is locked by another participant"));
            }
            _ => return Err(errno),
        }
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if result != 0 {
        return Err(IoError::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn lock(file: &File, blocking: bool) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;
    let flags = if blocking {
        LOCKFILE_EXCLUSIVE_LOCK
    } else {
        LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY
    };
    let result = unsafe {
        let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
        LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
    };

    if result == 0 {
        let err = IoError::last_os_error();
        if blocking {
            return Err(err);
        }
        return Err(IoError::new(
            ErrorKind::WouldBlock,
            format!("store is locked by another participant: {err}"),
        ));
    }
    Ok(())
}

#[cfg(windows)]
fn unlock(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::UnlockFileEx;

    let handle = file.as_raw_handle() as HANDLE;
    let result = unsafe {
        let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
        UnlockFileEx(handle, 0, 1, 0, &mut overlapped)
    };
    if result == 0 {
        return Err(IoError::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn lock(_file: &File, _blocking: bool) -> IoResult<()> {
    Err(IoError::new(
        ErrorKind::Unsupported,
        "file locking not supported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn unlock(_file: &File) -> IoResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_lock_acquire_release() {
        let dir = tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("store.lock"));
        {
            let guard = lock.acquire().unwrap();
            assert!(guard.path().exists());
        }
        // released on drop
        let _again = lock.try_acquire().unwrap();
    }

    #[test]
    fn test_lock_excludes_second_handle() {
        let dir = tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("store.lock"));

        let _held = lock.acquire().unwrap();
        let err = lock.try_acquire().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let dir = tempdir().unwrap();
        let lock = FileLock::new(dir.path().join("store.lock"));
        let held = lock.acquire().unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let lock = lock.clone();
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let _guard = lock.acquire().unwrap();
                released.load(Ordering::SeqCst)
            })
        };

        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
