//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the region.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current region size.
        size: u64,
    },

    /// Attempted to write beyond the end of the region.
    #[error("write beyond end of storage: offset {offset}, len {len}, size {size}")]
    WritePastEnd {
        /// The requested write offset.
        offset: u64,
        /// The requested write length.
        len: usize,
        /// The current region size.
        size: u64,
    },

    /// Another handle holds the exclusive lock on this file.
    #[error("storage locked: {0}")]
    Locked(String),

    /// The storage file does not exist.
    #[error("storage not found: {0}")]
    NotFound(String),

    /// The storage file already exists.
    #[error("storage already exists: {0}")]
    AlreadyExists(String),
}

impl StorageError {
    /// Returns true if this error means "the bytes are not there".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
