//! Persistent pools.
//!
//! A pool is one fixed-size file holding a heap of typed blocks, a root
//! object and a redo log. All mutation happens inside
//! [`Pool::transaction`], which either commits every change or none.

mod alloc;
mod header;
mod log;
mod transaction;

pub use alloc::MAX_BLOCK_PAYLOAD;
pub use header::{
    BlockHeader, BlockKind, BlockState, Geometry, PoolHeader, BLOCK_ALIGN, BLOCK_HEADER_SIZE,
    HEADER_SIZE, MAX_LAYOUT_LEN, MIN_POOL_SIZE, POOL_FORMAT_VERSION,
};
pub use transaction::{PoolRead, Snapshot, Transaction};

use crate::error::{CoreError, CoreResult};
use crate::types::{PoolOffset, TransactionId};
use header::{validate_layout, Superblock};
use parking_lot::RwLock;
use pmse_storage::{FileBackend, StorageBackend};
use std::fs;
use std::path::{Path, PathBuf};
use transaction::PoolState;

/// Suffix of a pool file that is still being created.
pub const STAGING_SUFFIX: &str = ".creating";

/// Usage statistics of an open pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total pool size in bytes.
    pub capacity: u64,
    /// Size of the redo log region.
    pub log_capacity: u64,
    /// Bytes of heap carved into blocks so far.
    pub heap_used: u64,
    /// Bytes of heap never carved.
    pub heap_remaining: u64,
    /// Number of free blocks available for reuse.
    pub free_blocks: usize,
    /// Payload bytes held by free blocks.
    pub free_bytes: u64,
    /// Transactions committed since the pool was opened.
    pub committed_transactions: u64,
    /// ID of the last committed transaction.
    pub last_txid: TransactionId,
}

/// An open persistent pool.
///
/// A pool is safe to share between threads. Transactions are serialized by
/// an internal writer lock; readers see only committed state.
pub struct Pool {
    path: Option<PathBuf>,
    layout: String,
    geometry: Geometry,
    state: RwLock<Option<PoolState>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("capacity", &self.geometry.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Pool {
    /// Creates a new pool file and runs `init` to install its root object.
    ///
    /// The file is built under a staging name and only renamed to `path`
    /// once the root is committed and the header written, so a crash never
    /// leaves a half-created pool at `path`.
    ///
    /// # Errors
    ///
    /// - `PoolExists` if a file is already present at `path`
    /// - `AllocationError` if `capacity` is below [`MIN_POOL_SIZE`]
    /// - any error returned by `init`
    pub fn create<F>(path: &Path, layout: &str, capacity: u64, mode: u32, init: F) -> CoreResult<Self>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<()>,
    {
        validate_layout(layout)?;
        let geometry = Geometry::for_capacity(capacity)?;
        if path.exists() {
            return Err(CoreError::PoolExists {
                path: path.display().to_string(),
            });
        }

        let staging = staging_path(path);
        if staging.exists() {
            tracing::warn!(path = %staging.display(), "removing stale staging file");
            fs::remove_file(&staging)?;
        }

        let result = Self::create_staged(path, &staging, layout, geometry, mode, init);
        if result.is_err() {
            let _ = fs::remove_file(&staging);
        }
        result
    }

    fn create_staged<F>(
        path: &Path,
        staging: &Path,
        layout: &str,
        geometry: Geometry,
        mode: u32,
        init: F,
    ) -> CoreResult<Self>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<()>,
    {
        let backend = FileBackend::create(staging)?;
        set_mode(staging, mode)?;
        let state = format(Box::new(backend), layout, geometry, init)?;

        fs::rename(staging, path)?;
        sync_parent_dir(path)?;
        tracing::info!(path = %path.display(), layout, capacity = geometry.capacity, "pool created");

        Ok(Self {
            path: Some(path.to_path_buf()),
            layout: layout.to_string(),
            geometry,
            state: RwLock::new(Some(state)),
        })
    }

    /// Creates a pool on an empty backend. Used for in-memory pools.
    ///
    /// # Errors
    ///
    /// Returns `PoolExists` if the backend already holds data, otherwise the
    /// same errors as [`create`](Self::create).
    pub fn create_in<F>(
        backend: Box<dyn StorageBackend>,
        layout: &str,
        capacity: u64,
        init: F,
    ) -> CoreResult<Self>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<()>,
    {
        validate_layout(layout)?;
        let geometry = Geometry::for_capacity(capacity)?;
        if !backend.is_empty()? {
            return Err(CoreError::PoolExists {
                path: "<backend>".to_string(),
            });
        }

        let state = format(backend, layout, geometry, init)?;
        Ok(Self {
            path: None,
            layout: layout.to_string(),
            geometry,
            state: RwLock::new(Some(state)),
        })
    }

    /// Opens an existing pool file, replaying its redo log if needed.
    ///
    /// # Errors
    ///
    /// - `NotFound` if there is no file at `path`
    /// - `CorruptPool` if the header is invalid or `layout` does not match
    /// - a storage `Locked` error if the pool is open elsewhere
    pub fn open(path: &Path, layout: &str) -> CoreResult<Self> {
        let backend = FileBackend::open(path).map_err(|e| {
            if e.is_not_found() {
                CoreError::not_found(format!("pool {}", path.display()))
            } else {
                CoreError::from(e)
            }
        })?;

        let mut pool = Self::open_in(Box::new(backend), layout)?;
        pool.path = Some(path.to_path_buf());
        tracing::debug!(path = %path.display(), layout, "pool opened");
        Ok(pool)
    }

    /// Opens a pool stored in an arbitrary backend.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open), minus the file-level errors.
    pub fn open_in(backend: Box<dyn StorageBackend>, layout: &str) -> CoreResult<Self> {
        let len = backend.len()?;
        if len < HEADER_SIZE {
            return Err(CoreError::corrupt_pool(format!(
                "file of {len} bytes is too small to be a pool"
            )));
        }

        let raw = backend.read_at(0, PoolHeader::encoded_len())?;
        let header = PoolHeader::decode(&raw)?;
        if header.layout != layout {
            return Err(CoreError::corrupt_pool(format!(
                "layout mismatch: expected {layout:?}, found {:?}",
                header.layout
            )));
        }
        if header.geometry.capacity != len {
            return Err(CoreError::corrupt_pool(format!(
                "pool header says {} bytes, file has {len}",
                header.geometry.capacity
            )));
        }

        let state = PoolState::recover(backend, header.geometry)?;
        Ok(Self {
            path: None,
            layout: header.layout,
            geometry: header.geometry,
            state: RwLock::new(Some(state)),
        })
    }

    /// Runs `f` as one atomic transaction.
    ///
    /// If `f` returns an error every change it made is discarded; typed
    /// errors (not found, duplicate key, out of space, corruption) are
    /// returned as-is and anything else as `WriteFailed`.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, `Closed` if the pool was closed, or
    /// `WriteFailed` if the commit itself failed.
    pub fn transaction<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        let mut guard = self.state.write();
        let state = guard.as_mut().ok_or_else(|| self.closed_error())?;
        check_poisoned(state)?;

        let mut tx = Transaction::begin(state);
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tracing::debug!(txid = %tx.id(), error = %err, "transaction aborted");
                Err(err.into_aborted())
            }
        }
    }

    /// Runs `f` against the committed state of the pool.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or `Closed` if the pool was closed.
    pub fn read<T, F>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Snapshot<'_>) -> CoreResult<T>,
    {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.closed_error())?;
        check_poisoned(state)?;
        f(&Snapshot::new(state))
    }

    /// Returns the pool's root object.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the pool was closed.
    pub fn root(&self) -> CoreResult<PoolOffset> {
        self.read(|snap| Ok(snap.root()))
    }

    /// Returns usage statistics.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the pool was closed.
    pub fn stats(&self) -> CoreResult<PoolStats> {
        let guard = self.state.read();
        let state = guard.as_ref().ok_or_else(|| self.closed_error())?;
        let heap_end = state.superblock.heap_end;
        Ok(PoolStats {
            capacity: self.geometry.capacity,
            log_capacity: self.geometry.log_capacity,
            heap_used: heap_end - self.geometry.heap_offset,
            heap_remaining: self.geometry.capacity - heap_end,
            free_blocks: state.allocator.free_blocks(),
            free_bytes: state.allocator.free_bytes(),
            committed_transactions: state.committed,
            last_txid: state.last_txid,
        })
    }

    /// Syncs and releases the pool. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> CoreResult<()> {
        let Some(mut state) = self.state.write().take() else {
            return Ok(());
        };
        if !state.poisoned {
            state.backend.sync()?;
        }
        tracing::debug!(layout = %self.layout, path = ?self.path, "pool closed");
        Ok(())
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.read().is_none()
    }

    /// Path of the pool file, if the pool is file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Layout tag the pool was created with.
    #[must_use]
    pub fn layout(&self) -> &str {
        &self.layout
    }

    /// Total pool size in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.geometry.capacity
    }

    /// Region layout of the pool.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn closed_error(&self) -> CoreError {
        match &self.path {
            Some(path) => CoreError::closed(format!("pool {}", path.display())),
            None => CoreError::closed(format!("pool {}", self.layout)),
        }
    }
}

fn check_poisoned(state: &PoolState) -> CoreResult<()> {
    if state.poisoned {
        return Err(CoreError::write_failed(CoreError::invalid_operation(
            "pool is unusable after a failed commit; reopen it to recover",
        )));
    }
    Ok(())
}

/// Formats an empty backend: superblock, root transaction, then header.
fn format<F>(
    mut backend: Box<dyn StorageBackend>,
    layout: &str,
    geometry: Geometry,
    init: F,
) -> CoreResult<PoolState>
where
    F: FnOnce(&mut Transaction<'_>) -> CoreResult<()>,
{
    backend.set_len(geometry.capacity)?;
    let superblock = Superblock {
        root: PoolOffset::NULL,
        heap_end: geometry.first_block(),
    };
    backend.write_at(geometry.heap_offset, &superblock.encode())?;
    backend.sync()?;

    let mut state = PoolState::new(backend, geometry, superblock);
    let mut tx = Transaction::begin(&mut state);
    init(&mut tx).map_err(CoreError::into_aborted)?;
    tx.commit()?;

    if state.superblock.root.is_null() {
        return Err(CoreError::invalid_operation(
            "pool initializer did not install a root object",
        ));
    }

    let header = PoolHeader::new(layout, geometry)?;
    state.backend.write_at(0, &header.encode())?;
    state.backend.sync()?;
    Ok(state)
}

/// Returns the staging path used while `path` is being created.
#[must_use]
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> CoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> CoreResult<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> CoreResult<()> {
    Ok(())
}
