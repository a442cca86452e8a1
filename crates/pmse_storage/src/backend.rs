//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level, random-access storage backend for a pool.
///
/// Backends are **opaque byte regions** of a fixed length. They provide
/// positioned reads and writes plus a durability barrier. The pool layer
/// owns all format interpretation.
///
/// # Invariants
///
/// - `read_at` returns exactly the bytes most recently written at that range
/// - `write_at` never extends the region; writes past `len()` fail
/// - after `sync` returns, every previous `write_at` survives process death
/// - backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent pools
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current length
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The write would extend beyond the current length
    /// - An I/O error occurs
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Returns the current length of the region in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the length cannot be determined.
    fn len(&self) -> StorageResult<u64>;

    /// Returns true if the region has zero length.
    ///
    /// # Errors
    ///
    /// Returns an error if the length cannot be determined.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Resizes the region to exactly `new_len` bytes.
    ///
    /// New bytes read as zero. Pools call this once, at creation, to reserve
    /// their fixed capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize fails (for example, the device is full).
    fn set_len(&mut self, new_len: u64) -> StorageResult<()>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes every previous write durable.
    ///
    /// This is the ordering barrier the redo log relies on: data written
    /// before a `sync` is on media before anything written after it.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;
}
