use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Advisory lock serializing read-modify-write cycles on shared state files.
///
/// Several injected processes may update the same profile at once, so every
/// mutation re-reads the file while holding this lock.
pub struct LockFile {
    _file: File,
}

impl LockFile {
    /// Block until an exclusive lock on `path` is held.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        Self::lock(path, false)
    }

    /// Take the lock only if nobody else holds it.
    #[cfg(test)]
    pub(crate) fn try_acquire(path: &Path) -> io::Result<Self> {
        Self::lock(path, true)
    }

    fn lock(path: &Path, nonblocking: bool) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use libc::{LOCK_EX, LOCK_NB, flock};
            let fd = file.as_raw_fd();
            let op = if nonblocking { LOCK_EX | LOCK_NB } else { LOCK_EX };
            if unsafe { flock(fd, op) } != 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        format!("{} is locked by another process", path.display()),
                    ));
                }
                return Err(err);
            }
        }

        tracing::trace!("Acquired lock file: {}", path.display());

        Ok(Self { _file: file })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        tracing::trace!("Released lock file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_nonblocking_lock_would_block() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/state.lock");

        let held = LockFile::acquire(&path).unwrap();
        let err = LockFile::try_acquire(&path).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        drop(held);
        assert!(LockFile::try_acquire(&path).is_ok());
    }
}
