//! Error types for pmse core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in pmse core operations.
///
/// The variants follow one taxonomy:
/// - out of space: [`CoreError::AllocationError`], [`CoreError::OutOfDiskSpace`]
/// - logical, caller-recoverable: [`CoreError::NotFound`], [`CoreError::DuplicateKey`]
/// - integrity: [`CoreError::CorruptPool`], [`CoreError::StructuralCorruption`]
/// - aborted and rolled back, safe to retry: [`CoreError::WriteFailed`]
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] pmse_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The pool has no room for the requested allocation.
    #[error("allocation failed: {message}")]
    AllocationError {
        /// Description of what did not fit.
        message: String,
    },

    /// Storage for a collection or index could not be set up.
    #[error("out of disk space: {message}")]
    OutOfDiskSpace {
        /// Description of the underlying failure.
        message: String,
    },

    /// A key, identifier or pool was not found.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A key or identifier already exists.
    #[error("duplicate key: {what}")]
    DuplicateKey {
        /// The duplicated key.
        what: String,
    },

    /// A pool file already exists where a new one was to be created.
    #[error("pool already exists: {path}")]
    PoolExists {
        /// Path of the existing file.
        path: String,
    },

    /// The pool header is invalid or was written by an incompatible layout.
    #[error("corrupt pool: {message}")]
    CorruptPool {
        /// Description of the corruption.
        message: String,
    },

    /// A persistent structure violates one of its invariants.
    #[error("structural corruption: {message}")]
    StructuralCorruption {
        /// Description of the violation.
        message: String,
    },

    /// A transaction was aborted and rolled back.
    #[error("write failed: {source}")]
    WriteFailed {
        /// The failure that aborted the transaction.
        #[source]
        source: Box<CoreError>,
    },

    /// An index key exceeds the maximum supported length.
    #[error("key too large: {len} bytes exceeds maximum of {max} bytes")]
    KeyTooLarge {
        /// Length of the rejected key.
        len: usize,
        /// Maximum key length.
        max: usize,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The pool or engine has been closed.
    #[error("{what} is closed")]
    Closed {
        /// What was closed.
        what: String,
    },
}

impl CoreError {
    /// Creates an allocation error.
    pub fn allocation(message: impl Into<String>) -> Self {
        Self::AllocationError {
            message: message.into(),
        }
    }

    /// Creates an out-of-disk-space error.
    pub fn out_of_disk_space(message: impl Into<String>) -> Self {
        Self::OutOfDiskSpace {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a duplicate key error.
    pub fn duplicate_key(what: impl Into<String>) -> Self {
        Self::DuplicateKey { what: what.into() }
    }

    /// Creates a corrupt pool error.
    pub fn corrupt_pool(message: impl Into<String>) -> Self {
        Self::CorruptPool {
            message: message.into(),
        }
    }

    /// Creates a structural corruption error.
    pub fn structural(message: impl Into<String>) -> Self {
        Self::StructuralCorruption {
            message: message.into(),
        }
    }

    /// Wraps an error as an aborted write.
    ///
    /// An error that already is `WriteFailed` is returned unchanged.
    pub fn write_failed(source: CoreError) -> Self {
        match source {
            Self::WriteFailed { .. } => source,
            other => Self::WriteFailed {
                source: Box::new(other),
            },
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a closed error.
    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed { what: what.into() }
    }

    /// Returns true for logical outcomes the caller is expected to handle.
    #[must_use]
    pub fn is_logical(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::DuplicateKey { .. })
    }

    /// Returns true if the pool ran out of room.
    #[must_use]
    pub fn is_out_of_space(&self) -> bool {
        matches!(
            self,
            Self::AllocationError { .. } | Self::OutOfDiskSpace { .. }
        )
    }

    /// Returns true if the operation was rolled back and may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteFailed { .. })
    }

    /// Returns true for data-integrity failures.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptPool { .. } | Self::StructuralCorruption { .. }
        )
    }

    /// Classifies an error raised inside a transaction body.
    ///
    /// Typed outcomes keep their identity; anything else is reported as a
    /// rolled-back write.
    pub(crate) fn into_aborted(self) -> Self {
        if self.is_logical()
            || self.is_out_of_space()
            || self.is_corruption()
            || matches!(
                self,
                Self::KeyTooLarge { .. } | Self::InvalidOperation { .. } | Self::Closed { .. }
            )
        {
            self
        } else {
            Self::write_failed(self)
        }
    }

    /// Converts a failure during collection or index construction into a
    /// storage-level error for the host.
    pub(crate) fn into_storage_failure(self) -> Self {
        if self.is_logical() || self.is_out_of_space() {
            self
        } else {
            Self::out_of_disk_space(self.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_failed_does_not_nest() {
        let inner = CoreError::write_failed(CoreError::invalid_operation("boom"));
        let outer = CoreError::write_failed(inner);
        match outer {
            CoreError::WriteFailed { source } => {
                assert!(matches!(*source, CoreError::InvalidOperation { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn aborted_keeps_typed_outcomes() {
        assert!(CoreError::duplicate_key("k").into_aborted().is_logical());
        assert!(CoreError::allocation("full").into_aborted().is_out_of_space());

        let io = CoreError::Io(io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(io.into_aborted().is_retryable());
    }

    #[test]
    fn storage_failure_mapping() {
        let err = CoreError::structural("bad node").into_storage_failure();
        assert!(matches!(err, CoreError::OutOfDiskSpace { .. }));

        let err = CoreError::not_found("ns").into_storage_failure();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }
}
