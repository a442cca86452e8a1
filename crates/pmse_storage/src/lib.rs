//! # pmse Storage
//!
//! Storage backends for pmse persistent pools.
//!
//! A backend is a **fixed-size, byte-addressable region**. It knows nothing
//! about pool headers, redo logs or heap blocks; `pmse_core` owns every byte
//! of interpretation.
//!
//! ## Design Principles
//!
//! - Backends are random-access byte stores (read, write, sync)
//! - A backend never grows on its own: capacity is reserved once with `set_len`
//! - Must be `Send + Sync` so a pool handle can be shared across threads
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing; clones share the same bytes
//! - [`FileBackend`] - One pool file on disk, exclusively locked while open
//!
//! ## Example
//!
//! ```rust
//! use pmse_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.set_len(16).unwrap();
//! backend.write_at(4, b"pool").unwrap();
//! assert_eq!(&backend.read_at(4, 4).unwrap(), b"pool");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
