//! # Named File Mutex
//!
//! An advisory, cross-process lock scoped to a session name. The lock is a
//! directory named `mutex-<md5(name)>` inside the repository's `tmp/` area:
//! `mkdir` is atomic on every platform we care about, so whichever process
//! creates the directory holds the lock, and `EEXIST` means somebody else
//! does. Release removes the directory.
//!
//! A crashed holder leaves a stale lock directory behind. The repository does
//! not auto-expire locks; operators clear them manually after confirming the
//! holder is gone.

use crate::checksum::md5_hex;
use crate::error::{LockError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Polling cadence for [`FileMutex::lock_with_timeout`].
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A cross-process advisory lock identified by a human-readable name.
#[derive(Debug)]
pub struct FileMutex {
    name: String,
    path: PathBuf,
    locked: bool,
}

impl FileMutex {
    /// Prepares a mutex for `name` with its lock directory under `dir`.
    /// Does not acquire anything.
    pub fn new(dir: &Path, name: &str) -> Self {
        let id = md5_hex(name.as_bytes());
        Self {
            name: name.to_string(),
            path: dir.join(format!("mutex-{id}")),
            locked: false,
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Panics if this instance already holds the lock: locking a held mutex
    /// is a programming error, not a runtime condition.
    pub fn lock(&mut self) -> Result<()> {
        assert!(!self.locked, "tried to lock a mutex twice: {}", self.name);
        match std::fs::create_dir(&self.path) {
            Ok(()) => {
                self.locked = true;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(LockError::Locked {
                name: self.name.clone(),
                path: self.path.clone(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquires the lock, polling once per second until `timeout` elapses.
    pub fn lock_with_timeout(&mut self, timeout: Duration) -> Result<()> {
        assert!(!self.locked, "tried to lock a mutex twice: {}", self.name);
        let t0 = Instant::now();
        loop {
            match self.lock() {
                Ok(()) => return Ok(()),
                Err(crate::error::VaultError::Lock(_)) => {
                    if t0.elapsed() > timeout {
                        return Err(LockError::Timeout {
                            name: self.name.clone(),
                            seconds: timeout.as_secs(),
                        }
                        .into());
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Releases the lock. A failure to remove the lock directory is logged
    /// rather than propagated: the caller is past the point of caring, and
    /// the stale directory is visible to operators.
    pub fn release(&mut self) {
        assert!(self.locked, "tried to release an unlocked mutex");
        if let Err(e) = std::fs::remove_dir(&self.path) {
            tracing::warn!(
                mutex = %self.name,
                path = %self.path.display(),
                "could not remove lock dir: {e}"
            );
        }
        self.locked = false;
    }

    /// Path of the lock directory, for diagnostics.
    pub fn lock_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileMutex {
    fn drop(&mut self) {
        if self.locked {
            tracing::warn!(mutex = %self.name, "lock was forgotten, cleaning up");
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;

    #[test]
    fn lock_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = FileMutex::new(dir.path(), "alpha");
        m.lock().unwrap();
        assert!(m.is_locked());
        assert!(m.lock_path().is_dir());
        m.release();
        assert!(!m.is_locked());
        assert!(!m.lock_path().exists());
    }

    #[test]
    fn second_holder_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = FileMutex::new(dir.path(), "beta");
        let mut b = FileMutex::new(dir.path(), "beta");
        a.lock().unwrap();
        let err = b.lock().unwrap_err();
        assert!(matches!(err, VaultError::Lock(LockError::Locked { .. })));
        a.release();
        b.lock().unwrap();
        b.release();
    }

    #[test]
    fn distinct_names_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = FileMutex::new(dir.path(), "gamma");
        let mut b = FileMutex::new(dir.path(), "delta");
        a.lock().unwrap();
        b.lock().unwrap();
        a.release();
        b.release();
    }

    #[test]
    fn timeout_expires() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = FileMutex::new(dir.path(), "epsilon");
        let mut b = FileMutex::new(dir.path(), "epsilon");
        a.lock().unwrap();
        let err = b.lock_with_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, VaultError::Lock(LockError::Timeout { .. })));
        a.release();
    }

    #[test]
    fn drop_releases_forgotten_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut m = FileMutex::new(dir.path(), "zeta");
            m.lock().unwrap();
            m.lock_path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
