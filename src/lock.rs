//! Single-instance lock
//!
//! An advisory non-blocking flock on `/var/ipp-usb/lock/ipp-usb.lock`.
//! Holding the guard keeps the descriptor (and therefore the lock) open for
//! the lifetime of the process.

use std::fs::{self, File, OpenOptions};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::err::{Error, Result};

/// Holds the lock until dropped.
pub struct LockGuard {
    _lock: Flock<File>,
}

/// Take the single-instance lock, creating the lock directory if needed.
///
/// Returns `Error::LockBusy` when another instance already holds it.
pub fn acquire(lock_file: &Path) -> Result<LockGuard> {
    if let Some(dir) = lock_file.parent() {
        fs::create_dir_all(dir)?;
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(lock_file)?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(LockGuard { _lock: lock }),
        Err((_, Errno::EWOULDBLOCK)) => Err(Error::LockBusy),
        Err((_, errno)) => Err(Error::Io(std::io::Error::from(errno))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_within_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock/ipp-usb.lock");

        let guard = acquire(&path).unwrap();
        // flock is per-open-file-description, so a second acquire in the
        // same process still conflicts.
        assert!(matches!(acquire(&path), Err(Error::LockBusy)));

        drop(guard);
        assert!(acquire(&path).is_ok());
    }
}
