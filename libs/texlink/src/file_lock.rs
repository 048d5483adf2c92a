// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Advisory whole-file locks used as machine-wide named mutexes.
//!
//! `flock` locks belong to the open file description, so two independently
//! opened handles exclude each other even inside one process, and the kernel
//! drops the lock when the holding process exits.

use std::fs::File;
use std::io;

/// Try to take an exclusive lock. `Ok(false)` means another holder has it.
#[cfg(unix)]
pub(crate) fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the fd is owned by `file` and valid for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(false),
        _ => Err(err),
    }
}

/// Block until the exclusive lock is held.
#[cfg(unix)]
pub(crate) fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        // SAFETY: the fd is owned by `file` and valid for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

#[cfg(unix)]
pub(crate) fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the fd is owned by `file` and valid for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub(crate) fn try_lock_exclusive(_file: &File) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "file locks are not implemented for this platform",
    ))
}

#[cfg(not(unix))]
pub(crate) fn lock_exclusive(_file: &File) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "file locks are not implemented for this platform",
    ))
}

#[cfg(not(unix))]
pub(crate) fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn open(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_independent_handles_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.lock");
        let a = open(&path);
        let b = open(&path);

        assert!(try_lock_exclusive(&a).unwrap());
        assert!(!try_lock_exclusive(&b).unwrap());
        unlock(&a).unwrap();
        assert!(try_lock_exclusive(&b).unwrap());
        unlock(&b).unwrap();
    }

    #[test]
    fn test_drop_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.lock");
        let a = open(&path);
        assert!(try_lock_exclusive(&a).unwrap());
        drop(a);
        let b = open(&path);
        assert!(try_lock_exclusive(&b).unwrap());
    }
}
