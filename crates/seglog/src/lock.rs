//! Advisory lock on a log directory, held for the lifetime of an open log.

use crate::error::{LogError, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the lock file inside a log directory.
pub const LOCK_FILE: &str = "LOCK";

/// `flock` on `LOCK`: exclusive for writers, shared for read-only opens.
///
/// The lock is released when the value is dropped and its descriptor closes.
#[derive(Debug)]
pub(crate) struct DirLock {
    _file: Option<File>,
    path: PathBuf,
}

impl DirLock {
    /// Takes the lock without blocking; contention fails with `Locked`.
    ///
    /// A shared request on a directory without a lock file succeeds without locking.
    pub(crate) fn acquire(dir: &Path, shared: bool) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = if shared {
            match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(Self { _file: None, path });
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?
        };

        match try_lock(&file, shared) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(LogError::Locked(path));
            }
            Err(e) => return Err(e.into()),
        }
        debug!(
            "Locked {} ({})",
            path.display(),
            if shared { "shared" } else { "exclusive" }
        );
        Ok(Self {
            _file: Some(file),
            path,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File, shared: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let mode = if shared { libc::LOCK_SH } else { libc::LOCK_EX };
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), mode | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File, _shared: bool) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exclusive_lock_conflicts() {
        let temp_dir = TempDir::new().unwrap();
        let held = DirLock::acquire(temp_dir.path(), false).unwrap();
        assert!(held.path().ends_with(LOCK_FILE));

        assert!(matches!(
            DirLock::acquire(temp_dir.path(), false),
            Err(LogError::Locked(_))
        ));
        assert!(matches!(
            DirLock::acquire(temp_dir.path(), true),
            Err(LogError::Locked(_))
        ));

        drop(held);
        DirLock::acquire(temp_dir.path(), false).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let temp_dir = TempDir::new().unwrap();
        let unlocked = DirLock::acquire(temp_dir.path(), true).unwrap();
        assert!(!temp_dir.path().join(LOCK_FILE).exists());
        drop(unlocked);

        drop(DirLock::acquire(temp_dir.path(), false).unwrap());
        let _first = DirLock::acquire(temp_dir.path(), true).unwrap();
        let _second = DirLock::acquire(temp_dir.path(), true).unwrap();
        assert!(DirLock::acquire(temp_dir.path(), false).is_err());
    }
}
