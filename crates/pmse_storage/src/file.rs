//! File-based storage backend for persistent pools.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based storage backend.
///
/// One pool lives in one file. The file is exclusively locked (advisory,
/// via `fs2`) for as long as the backend is alive, so two handles can never
/// map the same pool at once.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_data()` so data is on disk
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
/// Internal locking keeps seek-then-read pairs consistent.
///
/// # Example
///
/// ```no_run
/// use pmse_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::create(Path::new("orders.pool")).unwrap();
/// backend.set_len(8 * 1024 * 1024).unwrap();
/// backend.write_at(0, b"header").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Creates a new, empty pool file.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a file is already present at `path`,
    /// `Locked` if the lock cannot be taken, or an I/O error.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => {
                    StorageError::AlreadyExists(path.display().to_string())
                }
                _ => StorageError::Io(e),
            })?;

        Self::from_file(path, file)
    }

    /// Opens an existing pool file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no file at `path`, `Locked` if another
    /// handle holds it, or an I/O error.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
                _ => StorageError::Io(e),
            })?;

        Self::from_file(path, file)
    }

    /// Creates a pool file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be created.
    pub fn create_with_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::create(path)
    }

    fn from_file(path: &Path, file: File) -> StorageResult<Self> {
        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let size = *self.size.read();
        let end = offset.saturating_add(data.len() as u64);

        if offset > size || end > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size,
            });
        }

        if data.is_empty() {
            return Ok(());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn set_len(&mut self, new_len: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();

        file.set_len(new_len)?;
        file.sync_all()?;
        *size = new_len;

        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let file = self.file.write();
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pool");

        let backend = FileBackend::create(&path).unwrap();
        assert_eq!(backend.len().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_create_existing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pool");
        std::fs::write(&path, b"x").unwrap();

        let result = FileBackend::create(&path);
        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
    }

    #[test]
    fn file_open_missing_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.pool");

        let result = FileBackend::open(&path);
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert!(result.unwrap_err().is_not_found());
    }

    #[test]
    fn file_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pool");

        let mut backend = FileBackend::create(&path).unwrap();
        backend.set_len(64).unwrap();

        backend.write_at(10, b"hello").unwrap();
        backend.write_at(15, b" world").unwrap();

        assert_eq!(&backend.read_at(10, 11).unwrap(), b"hello world");
        assert_eq!(backend.read_at(0, 4).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn file_write_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pool");

        let mut backend = FileBackend::create(&path).unwrap();
        backend.set_len(8).unwrap();

        let result = backend.write_at(6, b"abc");
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
        assert_eq!(backend.len().unwrap(), 8);
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pool");

        let mut backend = FileBackend::create(&path).unwrap();
        backend.set_len(5).unwrap();

        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pool");

        {
            let mut backend = FileBackend::create(&path).unwrap();
            backend.set_len(32).unwrap();
            backend.write_at(0, b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        {
            let backend = FileBackend::open(&path).unwrap();
            assert_eq!(backend.len().unwrap(), 32);
            assert_eq!(&backend.read_at(0, 15).unwrap(), b"persistent data");
        }
    }

    #[test]
    fn file_second_handle_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pool");

        let _first = FileBackend::create(&path).unwrap();
        let second = FileBackend::open(&path);
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn file_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pool");

        {
            let _first = FileBackend::create(&path).unwrap();
        }

        assert!(FileBackend::open(&path).is_ok());
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("path").join("test.pool");

        let backend = FileBackend::create_with_dirs(&path).unwrap();
        assert_eq!(backend.len().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }
}
