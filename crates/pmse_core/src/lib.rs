//! # pmse Core
//!
//! Crash-consistent storage engine on persistent memory pools.
//!
//! This crate provides:
//! - Pools: fixed-size files with a typed block heap and a redo log, mutated
//!   only through all-or-nothing transactions
//! - A persistent hash map of records keyed by [`RecordId`]
//! - A persistent B+tree for secondary indexes
//! - The ident list: metadata naming every collection and index, plus the
//!   clean shutdown flag
//! - The [`Engine`]: pool registry, collection and index lifecycle, and a
//!   repair pass after an unclean shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use pmse_core::{CollectionOptions, Engine, IndexDescriptor, RecordId};
//! use std::path::Path;
//!
//! let engine = Engine::open(Path::new("data")).unwrap();
//! let options = CollectionOptions::default();
//! engine.create_collection("shop.orders", "collection-1", &options).unwrap();
//! engine.create_index("index-1", &IndexDescriptor::new("shop.orders")).unwrap();
//!
//! let orders = engine.get_collection("shop.orders", "collection-1", &options).unwrap();
//! let id = orders.insert_record(b"order #1").unwrap();
//! let by_name = engine.get_index("index-1", &IndexDescriptor::new("shop.orders")).unwrap();
//! by_name.insert(b"order #1", id).unwrap();
//! assert_eq!(by_name.find(b"order #1").unwrap(), vec![id]);
//!
//! engine.close().unwrap();
//! # let _ = RecordId::MIN;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod dir;
mod engine;
mod error;
mod handles;
mod identlist;
mod registry;
mod repair;
mod root;
mod types;
mod unit;

pub mod map;
pub mod pool;
pub mod tree;

pub use config::{is_system_namespace, Config};
pub use dir::{validate_ident, DataDir, POOL_EXTENSION};
pub use engine::{CollectionOptions, Engine, IndexDescriptor, RecoveryState};
pub use error::{CoreError, CoreResult};
pub use handles::{IndexHandle, RecordStoreHandle};
pub use identlist::{IdentList, IDENTLIST_FILE, IDENTLIST_LAYOUT};
pub use map::{MapIter, PersistentMap, DEFAULT_BUCKETS};
pub use pool::{Pool, PoolRead, PoolStats, Snapshot, Transaction, MIN_POOL_SIZE};
pub use registry::{PoolHandle, PoolRegistry, RegistryGuard, TreeInfo, COLLECTION_LAYOUT};
pub use repair::{repair_identlist, repair_pool, RepairReport};
pub use tree::{
    builtin_comparator, BytewiseComparator, KeyComparator, PersistentTree, ReverseBytewiseComparator,
    TreeScan, MAX_KEY_LEN,
};
pub use types::{Direction, PoolOffset, RecordId, TransactionId};
pub use unit::{Change, IndexChange, InsertChange, RemoveChange, UpdateChange, WriteUnit};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
