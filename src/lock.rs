//! Host-wide mutual exclusion for mutating operations.
//!
//! Invocations of this tool are independent processes fired by container
//! lifecycle hooks, possibly concurrently. Every mutating operation runs
//! under one exclusive advisory `flock` on a well-known path. The OS drops
//! the lock when the holding process exits, so a crashed invocation can
//! never wedge the host.

use std::fs::{File, OpenOptions};
use std::path::Path;

use log::debug;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};

pub const DEFAULT_LOCK_PATH: &str = "/run/eni-ipam.lock";

/// Exclusive host lock, held for the lifetime of the value.
pub struct HostLock {
    _lock: Flock<File>,
}

impl HostLock {
    pub fn acquire() -> Result<Self> {
        Self::acquire_at(Path::new(DEFAULT_LOCK_PATH))
    }

    /// Non-blocking acquisition: a second holder gets [`Error::LockBusy`]
    /// immediately rather than waiting out another invocation.
    pub fn acquire_at(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Lock)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                debug!("acquired host lock at {}", path.display());
                Ok(HostLock { _lock: lock })
            }
            Err((_, Errno::EAGAIN)) => Err(Error::LockBusy),
            Err((_, errno)) => Err(Error::Lock(std::io::Error::from(errno))),
        }
    }
}

/// Run `f` under the host lock. The lock is released when the guard drops,
/// on every exit path.
pub fn run_locked<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _guard = HostLock::acquire()?;
    f()
}
