use std::fs::{self, File};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::BoxError;

pub(crate) const LOCK_EXT: &str = "lock";

/// Exclusive hold on one cache entry, shared by every process using the
/// same cache root.
///
/// The lock is an advisory lock on `<entry>.lock`, a sibling file of the
/// entry directory. Every holder opens its own handle, so threads of one
/// process exclude each other the same way separate processes do. Dropping
/// the value closes the handle and releases the lock. The file itself stays
/// behind: unlinking it while someone waits on it would let a third caller
/// lock a fresh file next to them.
#[derive(Debug)]
pub(crate) struct EntryLock {
    _file: File,
}

impl EntryLock {
    pub(crate) fn path(entry: &Utf8Path) -> Utf8PathBuf {
        entry.with_extension(LOCK_EXT)
    }

    /// Blocks until no one else holds `entry`.
    pub(crate) fn acquire(entry: &Utf8Path) -> Result<Self, BoxError> {
        let path = Self::path(entry);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(BoxError::io(parent))?;
        }

        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(BoxError::io(&path))?;
        file.lock().map_err(BoxError::io(&path))?;

        tracing::trace!(lock = %path, "[Memory] Entry locked");
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use std::fs::TryLockError;

    use super::*;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp.path().to_path_buf()).unwrap();
        (temp, dir)
    }

    #[test]
    fn test_lock_file_sits_next_to_entry() {
        let entry = Utf8Path::new("/cache/demo/sum/abc123");
        assert_eq!(EntryLock::path(entry), "/cache/demo/sum/abc123.lock");
    }

    #[test]
    fn test_held_lock_excludes_other_handles() {
        let (_temp, dir) = scratch();
        let entry = dir.join("demo").join("abc");

        let held = EntryLock::acquire(&entry).unwrap();
        let other = File::options()
            .write(true)
            .open(EntryLock::path(&entry))
            .unwrap();
        assert!(matches!(other.try_lock(), Err(TryLockError::WouldBlock)));

        drop(held);
        other.try_lock().unwrap();
        assert!(!entry.exists());
    }
}
