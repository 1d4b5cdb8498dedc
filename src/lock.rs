// src/lock.rs

//! Exclusive lock on a target root
//!
//! One operation at a time may plan or mutate a root. The lock is a
//! non-blocking `flock(LOCK_EX)` on `<root>/var/lib/bpm/bpm.lock`; failing
//! to get it aborts immediately, there is no waiting or retrying.
//!
//! # Example
//!
//! ```ignore
//! use bpm::lock::RootLock;
//!
//! let _lock = RootLock::acquire(Path::new("/"))?;
//! // ... plan and execute ...
//! // Lock released and file removed on drop
//! ```

use crate::db::BPM_DIR;
use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Lock file name inside the state directory
pub const LOCK_FILE: &str = "bpm.lock";

/// Reopen attempts when the locked file was unlinked under us
const STALE_ATTEMPTS: usize = 3;

/// Exclusive lock held for the duration of one operation
#[derive(Debug)]
pub struct RootLock {
    /// The lock file handle (kept open to maintain lock)
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl RootLock {
    /// Lock file location for `root`
    pub fn lock_path(root: &Path) -> PathBuf {
        root.join(BPM_DIR).join(LOCK_FILE)
    }

    /// Try to acquire the lock for `root` without blocking
    ///
    /// Returns `Error::LockHeld` when another operation owns the root.
    ///
    /// A releasing holder unlinks the file, so a handle opened just before
    /// that can end up locking an orphaned inode. After locking, the handle
    /// is checked against the path and reopened if the two differ.
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = Self::lock_path(root);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..STALE_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
                {
                    debug!("Lock already held at {}", path.display());
                    return Err(Error::LockHeld(path.display().to_string()));
                }
                Err(e) => {
                    return Err(Error::IoError(format!(
                        "Failed to acquire lock {}: {}",
                        path.display(),
                        e
                    )));
                }
            }

            if is_current(&file, &path)? {
                info!("Acquired lock at {}", path.display());
                return Ok(Self { file, path });
            }
            debug!("Lock file {} was replaced while locking, reopening", path.display());
        }

        Err(Error::LockHeld(path.display().to_string()))
    }

    /// Path to the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether `file` is still the inode found at `path`
fn is_current(file: &File, path: &Path) -> Result<bool> {
    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Unlinks the lock file while still holding the flock. A waiter that opened
/// the old inode sees it is gone in [`RootLock::acquire`] and reopens.
impl Drop for RootLock {
    fn drop(&mut self) {
        // The flock goes away with the file handle
        let _ = fs::remove_file(&self.path);
        info!("Released lock at {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let temp = TempDir::new().unwrap();
        let lock = RootLock::acquire(temp.path()).unwrap();
        assert!(lock.path().exists());
        assert_eq!(lock.path(), temp.path().join("var/lib/bpm/bpm.lock"));
    }

    #[test]
    fn test_second_acquire_fails() {
        let temp = TempDir::new().unwrap();
        let _lock = RootLock::acquire(temp.path()).unwrap();

        let result = RootLock::acquire(temp.path());
        assert!(matches!(result, Err(Error::LockHeld(_))));
    }

    #[test]
    fn test_release_on_drop() {
        let temp = TempDir::new().unwrap();
        let lock = RootLock::acquire(temp.path()).unwrap();
        let path = lock.path().to_path_buf();
        drop(lock);

        assert!(!path.exists());
        let again = RootLock::acquire(temp.path());
        assert!(again.is_ok());
    }

    #[test]
    fn test_release_on_panic() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();

        let result = std::panic::catch_unwind(|| {
            let _lock = RootLock::acquire(&root).unwrap();
            panic!("operation failed");
        });
        assert!(result.is_err());
        assert!(RootLock::acquire(temp.path()).is_ok());
    }

    #[test]
    fn test_unlinked_handle_is_not_current() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(LOCK_FILE);
        let stale = File::create(&path).unwrap();
        assert!(is_current(&stale, &path).unwrap());

        fs::remove_file(&path).unwrap();
        assert!(!is_current(&stale, &path).unwrap());

        File::create(&path).unwrap();
        assert!(!is_current(&stale, &path).unwrap());
    }

    #[test]
    fn test_acquire_after_stale_handle_released() {
        let temp = TempDir::new().unwrap();
        let first = RootLock::acquire(temp.path()).unwrap();
        let path = first.path().to_path_buf();

        // Opened before the holder releases, as a racing acquirer would
        let stale = File::open(&path).unwrap();
        drop(first);

        // The orphaned inode can be locked, but it no longer guards the root
        stale.try_lock_exclusive().unwrap();
        assert!(!is_current(&stale, &path).unwrap());

        let second = RootLock::acquire(temp.path()).unwrap();
        assert!(is_current(&second.file, &path).unwrap());
        assert!(matches!(RootLock::acquire(temp.path()), Err(Error::LockHeld(_))));
    }

    #[test]
    fn test_independent_roots() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let _a = RootLock::acquire(first.path()).unwrap();
        assert!(RootLock::acquire(second.path()).is_ok());
    }
}
