//! Exclusive advisory lock on a single file, used to guarantee that at most one
//! process has a store directory open at a time.
//!
//! This uses `flock(2)` with `LOCK_EX | LOCK_NB` (never blocks), simplified to a single
//! exclusive holder: a chunk manager never needs a shared/reader lock, only "is someone
//! else already managing this directory". Unlike `fcntl` record locks, `flock` locks are
//! associated with the open file description rather than the process, so two
//! independent opens in the same process correctly contend with each other too.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::{bail, Error};
use nix::fcntl::{flock, FlockArg};

/// Handle to a lock file; does not itself hold the lock (see [`DirLockGuard`]).
pub struct DirLock {
    file: File,
}

/// An acquired exclusive lock. Dropping the guard releases the lock.
pub struct DirLockGuard {
    _file: File,
}

impl DirLock {
    /// Open (creating if necessary) the lock file at `path`. Does not acquire the lock.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self { file })
    }

    /// Try to acquire the exclusive lock without blocking.
    ///
    /// Returns `Ok(None)` (rather than an error) when the lock is already held by
    /// another process, so callers can distinguish contention from other I/O
    /// failures and surface `DirectoryLocked` accordingly.
    pub fn try_exclusive(self) -> Result<Option<DirLockGuard>, Error> {
        match flock(self.file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(DirLockGuard { _file: self.file })),
            Err(nix::errno::Errno::EWOULDBLOCK) => Ok(None),
            Err(err) => bail!("unable to acquire exclusive lock - {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_is_contended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        let first = DirLock::open(&path).unwrap().try_exclusive().unwrap();
        assert!(first.is_some());

        let second = DirLock::open(&path).unwrap().try_exclusive().unwrap();
        assert!(second.is_none());

        drop(first);

        let third = DirLock::open(&path).unwrap().try_exclusive().unwrap();
        assert!(third.is_some());
    }
}
