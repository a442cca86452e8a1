//! Record store and index handles given out by the engine.
//!
//! Both are thin views over a registered [`PoolHandle`]; the pool stays
//! open for as long as the engine keeps it registered, not for as long as a
//! handle lives.

use crate::error::CoreResult;
use crate::map::{MapIter, PersistentMap};
use crate::registry::PoolHandle;
use crate::tree::{PersistentTree, TreeScan};
use crate::types::{Direction, RecordId};
use std::ops::Bound;
use std::sync::Arc;

/// A collection's record store.
#[derive(Debug, Clone)]
pub struct RecordStoreHandle {
    ns: String,
    ident: String,
    pool: Arc<PoolHandle>,
}

impl RecordStoreHandle {
    pub(crate) fn new(ns: &str, ident: &str, pool: Arc<PoolHandle>) -> Self {
        Self {
            ns: ns.to_string(),
            ident: ident.to_string(),
            pool,
        }
    }

    /// Namespace of the collection.
    #[must_use]
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Identifier of the collection.
    #[must_use]
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// The backing record map.
    #[must_use]
    pub fn map(&self) -> &Arc<PersistentMap> {
        self.pool.map()
    }

    /// The pool handle shared with the collection's indexes.
    #[must_use]
    pub fn pool_handle(&self) -> &Arc<PoolHandle> {
        &self.pool
    }

    /// Stores a new record and returns its id.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if the pool is full.
    pub fn insert_record(&self, payload: &[u8]) -> CoreResult<RecordId> {
        self.map().insert_auto(payload)
    }

    /// Replaces a record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is absent.
    pub fn update_record(&self, id: RecordId, payload: &[u8]) -> CoreResult<()> {
        self.map().update(id, payload)
    }

    /// Deletes a record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is absent.
    pub fn delete_record(&self, id: RecordId) -> CoreResult<()> {
        self.map().remove(id)
    }

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the map is damaged.
    pub fn find_record(&self, id: RecordId) -> CoreResult<Option<Vec<u8>>> {
        self.map().get(id)
    }

    /// Iterates every record.
    pub fn records(&self) -> MapIter<'_> {
        self.map().iter()
    }

    /// Number of records.
    #[must_use]
    pub fn num_records(&self) -> u64 {
        self.map().len()
    }

    /// Total payload bytes.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.map().data_size()
    }

    /// Deletes every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn truncate(&self) -> CoreResult<()> {
        self.map().truncate()
    }
}

/// An index over a collection.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    ident: String,
    collection: String,
    tree: Arc<PersistentTree>,
}

impl IndexHandle {
    pub(crate) fn new(ident: &str, collection: &str, tree: Arc<PersistentTree>) -> Self {
        Self {
            ident: ident.to_string(),
            collection: collection.to_string(),
            tree,
        }
    }

    /// Identifier of the index.
    #[must_use]
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Identifier of the collection the index lives in.
    #[must_use]
    pub fn collection_ident(&self) -> &str {
        &self.collection
    }

    /// The backing tree.
    #[must_use]
    pub fn tree(&self) -> &Arc<PersistentTree> {
        &self.tree
    }

    /// Returns true if the index rejects duplicate keys.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.tree.is_unique()
    }

    /// Adds `(key, rid)`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` for a taken key in a unique index.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> CoreResult<()> {
        self.tree.insert(key, rid)
    }

    /// Removes `(key, rid)`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the entry is absent.
    pub fn unindex(&self, key: &[u8], rid: RecordId) -> CoreResult<()> {
        self.tree.remove(key, rid)
    }

    /// Record ids stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the tree is damaged.
    pub fn find(&self, key: &[u8]) -> CoreResult<Vec<RecordId>> {
        self.tree.find(key)
    }

    /// Scans entries between two key bounds.
    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>, direction: Direction) -> TreeScan<'_> {
        self.tree.scan(lower, upper, direction)
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the pool was closed.
    pub fn num_entries(&self) -> CoreResult<u64> {
        self.tree.len()
    }
}
