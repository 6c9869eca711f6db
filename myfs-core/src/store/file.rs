//! File-backed store with advisory exclusive locking.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{MyfsError, MyfsResult};

use super::VolumeStore;

/// A [`VolumeStore`] over a real file.
///
/// The container file is held under an fs2 advisory exclusive lock for the
/// lifetime of the store when [`FileStore::lock_exclusive`] has been called.
/// Advisory locks are unreliable on network filesystems; concurrent opens
/// across such mounts are not supported.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    locked: bool,
}

impl FileStore {
    /// Creates the file, failing if it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> MyfsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| MyfsError::io(format!("creating {}", path.display()), e))?;
        Ok(Self {
            file,
            path,
            locked: false,
        })
    }

    /// Opens an existing file, or creates it when `create` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> MyfsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .map_err(|e| MyfsError::io(format!("opening {}", path.display()), e))?;
        Ok(Self {
            file,
            path,
            locked: false,
        })
    }

    /// Acquires the advisory exclusive lock for this session.
    ///
    /// # Errors
    ///
    /// Returns [`MyfsError::Locked`] if another process holds the lock.
    pub fn lock_exclusive(&mut self) -> MyfsResult<()> {
        self.file.try_lock_exclusive().map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                MyfsError::Locked
            } else {
                MyfsError::io(format!("locking {}", self.path.display()), e)
            }
        })?;
        self.locked = true;
        Ok(())
    }

    /// Returns the path this store is backed by.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, context: &str, e: std::io::Error) -> MyfsError {
        MyfsError::io(format!("{context} {}", self.path.display()), e)
    }
}

impl VolumeStore for FileStore {
    fn len(&self) -> MyfsResult<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| self.io_err("sizing", e))
    }

    fn read_at(&mut self, offset: u64, len: usize) -> MyfsResult<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err("seeking", e))?;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| self.io_err("reading", e))?;
        Ok(buf)
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> MyfsResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err("seeking", e))?;
        self.file
            .write_all(bytes)
            .map_err(|e| self.io_err("writing", e))
    }

    fn append(&mut self, bytes: &[u8]) -> MyfsResult<u64> {
        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| self.io_err("seeking", e))?;
        self.file
            .write_all(bytes)
            .map_err(|e| self.io_err("appending", e))?;
        Ok(offset)
    }

    fn set_len(&mut self, len: u64) -> MyfsResult<()> {
        self.file
            .set_len(len)
            .map_err(|e| self.io_err("truncating", e))
    }

    fn sync(&mut self) -> MyfsResult<()> {
        self.file
            .sync_all()
            .map_err(|e| self.io_err("syncing", e))
    }

    fn replace_contents(&mut self, bytes: &[u8]) -> MyfsResult<()> {
        let mut tmp_path = self.path.clone();
        let mut name = tmp_path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        tmp_path.set_file_name(name);

        // Stage the full image, make it durable, then swap it in atomically.
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|e| MyfsError::io(format!("creating {}", tmp_path.display()), e))?;
            tmp.write_all(bytes)
                .map_err(|e| MyfsError::io(format!("writing {}", tmp_path.display()), e))?;
            tmp.sync_all()
                .map_err(|e| MyfsError::io(format!("syncing {}", tmp_path.display()), e))?;
        }
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| self.io_err("replacing", e))?;

        // The old inode (and its lock) died with the rename; reacquire both.
        let was_locked = self.locked;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| self.io_err("reopening", e))?;
        self.file = file;
        self.locked = false;
        if was_locked {
            self.lock_exclusive()?;
        }
        self.file.sync_all().map_err(|e| self.io_err("syncing", e))
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if self.locked {
            let _ = self.file.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("myfs-store-{}.bin", Uuid::new_v4()));
        path
    }

    #[test]
    fn test_create_append_read() {
        let path = temp_path();
        let mut store = FileStore::create(&path).unwrap();
        assert!(store.is_empty().unwrap());

        let off = store.append(b"hello").unwrap();
        assert_eq!(off, 0);
        let off = store.append(b" world").unwrap();
        assert_eq!(off, 5);

        assert_eq!(store.read_at(0, 11).unwrap(), b"hello world");
        assert_eq!(store.read_at(6, 5).unwrap(), b"world");

        drop(store);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_write_at_and_truncate() {
        let path = temp_path();
        let mut store = FileStore::create(&path).unwrap();
        store.append(b"abcdef").unwrap();
        store.write_at(2, b"XY").unwrap();
        assert_eq!(store.read_at(0, 6).unwrap(), b"abXYef");

        store.set_len(3).unwrap();
        assert_eq!(store.len().unwrap(), 3);

        drop(store);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_read_past_end_fails() {
        let path = temp_path();
        let mut store = FileStore::create(&path).unwrap();
        store.append(b"abc").unwrap();
        assert!(store.read_at(1, 10).is_err());

        drop(store);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let path = temp_path();
        let mut store_a = FileStore::create(&path).unwrap();
        store_a.lock_exclusive().unwrap();

        let mut store_b = FileStore::open(&path, false).unwrap();
        assert!(matches!(store_b.lock_exclusive(), Err(MyfsError::Locked)));

        drop(store_a);
        let mut store_c = FileStore::open(&path, false).unwrap();
        store_c.lock_exclusive().unwrap();

        drop(store_c);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_replace_contents_swaps_and_keeps_lock() {
        let path = temp_path();
        let mut store = FileStore::create(&path).unwrap();
        store.lock_exclusive().unwrap();
        store.append(b"old contents").unwrap();

        store.replace_contents(b"new").unwrap();
        assert_eq!(store.len().unwrap(), 3);
        assert_eq!(store.read_at(0, 3).unwrap(), b"new");

        // Lock survives the swap.
        let mut other = FileStore::open(&path, false).unwrap();
        assert!(matches!(other.lock_exclusive(), Err(MyfsError::Locked)));

        drop(other);
        drop(store);
        let _ = std::fs::remove_file(path);
    }
}
