//! Open pool handles shared by record stores and indexes.
//!
//! A collection pool holds one record map plus every index tree created on
//! that collection. The first caller to need a pool opens it and parks a
//! [`PoolHandle`] in the engine's [`PoolRegistry`]; later callers get the same
//! handle back, so a pool file is attached at most once per engine.

use crate::error::{CoreError, CoreResult};
use crate::map::PersistentMap;
use crate::pool::{Pool, PoolRead, Transaction};
use crate::root::CollectionRoot;
use crate::tree::{KeyComparator, PersistentTree, TreeHeader};
use crate::types::PoolOffset;
use parking_lot::{Mutex, MutexGuard};
use pmse_storage::StorageBackend;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Layout tag of collection pools.
pub const COLLECTION_LAYOUT: &str = "pmse_mapper";

/// Stored description of an index tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeInfo {
    /// Name of the comparator the tree is ordered by.
    pub comparator: String,
    /// Whether keys are unique.
    pub unique: bool,
    /// Stored entry count.
    pub entries: u64,
}

/// One attached collection pool.
pub struct PoolHandle {
    ident: String,
    pool: Arc<Pool>,
    root_at: PoolOffset,
    map: Arc<PersistentMap>,
    trees: Mutex<HashMap<String, Arc<PersistentTree>>>,
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("ident", &self.ident)
            .field("pool", &self.pool)
            .field("root", &self.root_at)
            .field("cached_trees", &self.trees.lock().len())
            .finish()
    }
}

impl PoolHandle {
    /// Creates a collection pool file with an empty record map.
    ///
    /// # Errors
    ///
    /// Returns `PoolExists`, `AllocationError` or an I/O failure.
    pub fn create(path: &Path, ident: &str, capacity: u64, mode: u32, buckets: u32) -> CoreResult<Self> {
        let pool = Pool::create(path, COLLECTION_LAYOUT, capacity, mode, |tx| {
            init_collection(tx, buckets)
        })?;
        Self::attach(ident, Arc::new(pool))
    }

    /// Creates a collection pool on an empty backend.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub fn create_in(
        backend: Box<dyn StorageBackend>,
        ident: &str,
        capacity: u64,
        buckets: u32,
    ) -> CoreResult<Self> {
        let pool = Pool::create_in(backend, COLLECTION_LAYOUT, capacity, |tx| {
            init_collection(tx, buckets)
        })?;
        Self::attach(ident, Arc::new(pool))
    }

    /// Opens an existing collection pool file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `CorruptPool` or `StructuralCorruption`.
    pub fn open(path: &Path, ident: &str) -> CoreResult<Self> {
        let pool = Pool::open(path, COLLECTION_LAYOUT)?;
        Self::attach(ident, Arc::new(pool))
    }

    /// Wraps an already opened collection pool.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the root or map header is invalid.
    pub fn attach(ident: &str, pool: Arc<Pool>) -> CoreResult<Self> {
        let (root_at, root) = pool.read(|snap| {
            let at = snap.root();
            Ok((at, CollectionRoot::read(snap, at)?))
        })?;
        let map = PersistentMap::attach(Arc::clone(&pool), root.map)?;
        Ok(Self {
            ident: ident.to_string(),
            pool,
            root_at,
            map: Arc::new(map),
            trees: Mutex::new(HashMap::new()),
        })
    }

    /// The collection identifier.
    #[must_use]
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// The collection's record map.
    #[must_use]
    pub fn map(&self) -> &Arc<PersistentMap> {
        &self.map
    }

    /// Creates the index tree `ident`, or returns it if it already exists.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if the pool is full, or `InvalidOperation`
    /// if an existing tree uses a different comparator.
    pub fn create_tree(
        &self,
        ident: &str,
        unique: bool,
        comparator: Arc<dyn KeyComparator>,
    ) -> CoreResult<Arc<PersistentTree>> {
        let mut trees = self.trees.lock();
        if let Some(tree) = trees.get(ident) {
            check_comparator(ident, tree, comparator.as_ref())?;
            return Ok(Arc::clone(tree));
        }

        let header_at = self.pool.transaction(|tx| {
            let mut root = CollectionRoot::read(tx, self.root_at)?;
            let mut table = root.indexes(tx)?;
            if let Some(&existing) = table.get(ident) {
                return Ok(existing);
            }
            let at = PersistentTree::create_in(tx, unique, comparator.as_ref())?;
            table.insert(ident.to_string(), at);
            root.store_indexes(tx, self.root_at, &table)?;
            Ok(at)
        })?;
        tracing::debug!(collection = %self.ident, index = ident, header = %header_at, "index tree ready");

        let tree = Arc::new(PersistentTree::attach(
            Arc::clone(&self.pool),
            header_at,
            comparator,
        )?);
        trees.insert(ident.to_string(), Arc::clone(&tree));
        Ok(tree)
    }

    /// Returns the index tree `ident`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the collection has no such index, or
    /// `InvalidOperation` on a comparator mismatch.
    pub fn tree(&self, ident: &str, comparator: Arc<dyn KeyComparator>) -> CoreResult<Arc<PersistentTree>> {
        let mut trees = self.trees.lock();
        if let Some(tree) = trees.get(ident) {
            check_comparator(ident, tree, comparator.as_ref())?;
            return Ok(Arc::clone(tree));
        }

        let header_at = self
            .tree_offset(ident)?
            .ok_or_else(|| CoreError::not_found(format!("index {ident}")))?;
        let tree = Arc::new(PersistentTree::attach(
            Arc::clone(&self.pool),
            header_at,
            comparator,
        )?);
        trees.insert(ident.to_string(), Arc::clone(&tree));
        Ok(tree)
    }

    /// Returns true if the collection has an index named `ident`.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` for an unreadable index table.
    pub fn has_tree(&self, ident: &str) -> CoreResult<bool> {
        Ok(self.tree_offset(ident)?.is_some())
    }

    /// Removes index `ident` and frees its nodes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the collection has no such index.
    pub fn drop_tree(&self, ident: &str) -> CoreResult<()> {
        let mut trees = self.trees.lock();
        let attached = trees.get(ident).cloned();
        let dropped = self.pool.transaction(|tx| {
            let mut root = CollectionRoot::read(tx, self.root_at)?;
            let mut table = root.indexes(tx)?;
            let header_at = table
                .remove(ident)
                .ok_or_else(|| CoreError::not_found(format!("index {ident}")))?;
            PersistentTree::destroy_in(tx, header_at)?;
            root.store_indexes(tx, self.root_at, &table)?;
            // Handed-out trees must not touch the freed header once the
            // pool lock is released.
            if let Some(tree) = &attached {
                tree.set_dropped(true);
            }
            Ok(())
        });
        if let Err(err) = dropped {
            if let Some(tree) = &attached {
                tree.set_dropped(false);
            }
            return Err(err);
        }
        trees.remove(ident);
        tracing::debug!(collection = %self.ident, index = ident, "index tree dropped");
        Ok(())
    }

    /// Names of every index stored in this collection, sorted.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` for an unreadable index table.
    pub fn index_names(&self) -> CoreResult<Vec<String>> {
        self.pool.read(|snap| {
            let root = CollectionRoot::read(snap, self.root_at)?;
            Ok(root.indexes(snap)?.into_keys().collect())
        })
    }

    /// Reads the header of index `ident` without attaching it, so trees
    /// with an unregistered comparator can still be described.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the collection has no such index.
    pub fn tree_info(&self, ident: &str) -> CoreResult<TreeInfo> {
        let header_at = self
            .tree_offset(ident)?
            .ok_or_else(|| CoreError::not_found(format!("index {ident}")))?;
        let header = self.pool.read(|snap| TreeHeader::read(snap, header_at))?;
        Ok(TreeInfo {
            comparator: header.comparator,
            unique: header.unique,
            entries: header.count,
        })
    }

    fn tree_offset(&self, ident: &str) -> CoreResult<Option<PoolOffset>> {
        self.pool.read(|snap| {
            let root = CollectionRoot::read(snap, self.root_at)?;
            Ok(root.indexes(snap)?.get(ident).copied())
        })
    }

    /// Persists the map counters and closes the pool. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns the first failure of storing counters or syncing the pool;
    /// the pool is closed either way.
    pub fn close(&self) -> CoreResult<()> {
        if self.pool.is_closed() {
            return Ok(());
        }
        self.trees.lock().clear();
        let stored = self.map.store_counters();
        if let Err(err) = &stored {
            tracing::warn!(collection = %self.ident, error = %err, "could not store map counters");
        }
        let closed = self.pool.close();
        stored.and(closed)
    }

    /// Closes the pool without storing counters.
    ///
    /// Used when the handle is abandoned, for example after the engine was
    /// dropped without a clean close.
    pub fn release(&self) {
        self.trees.lock().clear();
        if let Err(err) = self.pool.close() {
            tracing::warn!(collection = %self.ident, error = %err, "pool release failed");
        }
    }
}

fn init_collection(tx: &mut Transaction<'_>, buckets: u32) -> CoreResult<()> {
    CollectionRoot::create_in(tx, buckets).map(|_| ())
}

fn check_comparator(ident: &str, tree: &PersistentTree, comparator: &dyn KeyComparator) -> CoreResult<()> {
    if tree.comparator().name() == comparator.name() {
        Ok(())
    } else {
        Err(CoreError::invalid_operation(format!(
            "index {ident} is ordered by {:?}, not {:?}",
            tree.comparator().name(),
            comparator.name()
        )))
    }
}

/// Identifier to pool handle map, guarded by a single lock.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    handles: Mutex<HashMap<String, Arc<PoolHandle>>>,
}

/// Exclusive access to a [`PoolRegistry`].
///
/// Holding the guard serializes every handle creation, lookup and removal,
/// so a caller can check, create and register a pool as one step.
pub struct RegistryGuard<'a> {
    handles: MutexGuard<'a, HashMap<String, Arc<PoolHandle>>>,
}

impl PoolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the registry.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            handles: self.handles.lock(),
        }
    }

    /// Returns the handle registered for `ident`.
    #[must_use]
    pub fn get(&self, ident: &str) -> Option<Arc<PoolHandle>> {
        self.lock().get(ident)
    }

    /// Returns the handle for `ident`, opening it with `open` if absent.
    ///
    /// The lock is held while `open` runs.
    ///
    /// # Errors
    ///
    /// Returns the error of `open`; nothing is registered then.
    pub fn get_or_try_insert_with<F>(&self, ident: &str, open: F) -> CoreResult<Arc<PoolHandle>>
    where
        F: FnOnce() -> CoreResult<PoolHandle>,
    {
        let mut guard = self.lock();
        if let Some(handle) = guard.get(ident) {
            return Ok(handle);
        }
        let handle = Arc::new(open()?);
        guard.insert(Arc::clone(&handle));
        Ok(handle)
    }

    /// Unregisters `ident` and returns its handle.
    pub fn remove(&self, ident: &str) -> Option<Arc<PoolHandle>> {
        self.lock().remove(ident)
    }

    /// Registered identifiers, sorted.
    #[must_use]
    pub fn idents(&self) -> Vec<String> {
        let mut idents: Vec<String> = self.handles.lock().keys().cloned().collect();
        idents.sort();
        idents
    }

    /// Snapshot of every registered handle.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<PoolHandle>> {
        self.handles.lock().values().cloned().collect()
    }

    /// Number of registered handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Closes and unregisters every handle.
    ///
    /// # Errors
    ///
    /// Returns the first close failure; every handle is closed regardless.
    pub fn close_all(&self) -> CoreResult<()> {
        let handles: Vec<_> = self.handles.lock().drain().collect();
        let mut first_err = None;
        for (ident, handle) in handles {
            if let Err(err) = handle.close() {
                tracing::error!(ident = %ident, error = %err, "failed to close pool");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Releases and unregisters every handle without storing counters.
    pub fn release_all(&self) {
        for (_, handle) in self.handles.lock().drain() {
            handle.release();
        }
    }
}

impl RegistryGuard<'_> {
    /// Returns the handle registered for `ident`.
    #[must_use]
    pub fn get(&self, ident: &str) -> Option<Arc<PoolHandle>> {
        self.handles.get(ident).cloned()
    }

    /// Returns true if `ident` is registered.
    #[must_use]
    pub fn contains(&self, ident: &str) -> bool {
        self.handles.contains_key(ident)
    }

    /// Registers `handle`, returning the one it replaced.
    pub fn insert(&mut self, handle: Arc<PoolHandle>) -> Option<Arc<PoolHandle>> {
        self.handles.insert(handle.ident().to_string(), handle)
    }

    /// Unregisters `ident`.
    pub fn remove(&mut self, ident: &str) -> Option<Arc<PoolHandle>> {
        self.handles.remove(ident)
    }

    /// Snapshot of every registered handle.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<PoolHandle>> {
        self.handles.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MIN_POOL_SIZE;
    use crate::tree::{BytewiseComparator, ReverseBytewiseComparator};
    use crate::types::RecordId;
    use pmse_storage::InMemoryBackend;
    use tempfile::tempdir;

    fn handle(ident: &str) -> (InMemoryBackend, PoolHandle) {
        let backend = InMemoryBackend::new();
        let handle = PoolHandle::create_in(Box::new(backend.clone()), ident, MIN_POOL_SIZE, 16).unwrap();
        (backend, handle)
    }

    #[test]
    fn create_tree_is_idempotent() {
        let (_, handle) = handle("coll-1");
        let a = handle.create_tree("idx-1", true, Arc::new(BytewiseComparator)).unwrap();
        a.insert(b"k", RecordId(1)).unwrap();

        let b = handle.create_tree("idx-1", true, Arc::new(BytewiseComparator)).unwrap();
        assert_eq!(a.header_offset(), b.header_offset());
        assert_eq!(b.len().unwrap(), 1);
        assert_eq!(handle.index_names().unwrap(), vec!["idx-1".to_string()]);
    }

    #[test]
    fn trees_survive_reattach() {
        let (backend, handle) = handle("coll-1");
        handle.create_tree("idx-a", false, Arc::new(BytewiseComparator)).unwrap();
        handle
            .create_tree("idx-b", false, Arc::new(ReverseBytewiseComparator))
            .unwrap()
            .insert(b"x", RecordId(9))
            .unwrap();
        handle.map().insert(RecordId(9), b"doc").unwrap();
        handle.close().unwrap();

        let pool = Pool::open_in(Box::new(backend), COLLECTION_LAYOUT).unwrap();
        let reopened = PoolHandle::attach("coll-1", Arc::new(pool)).unwrap();
        assert_eq!(reopened.index_names().unwrap().len(), 2);
        let tree = reopened.tree("idx-b", Arc::new(ReverseBytewiseComparator)).unwrap();
        assert_eq!(tree.find(b"x").unwrap(), vec![RecordId(9)]);
        assert_eq!(reopened.map().get(RecordId(9)).unwrap().as_deref(), Some(&b"doc"[..]));
    }

    #[test]
    fn tree_comparator_mismatch_is_rejected() {
        let (_, handle) = handle("coll-1");
        handle.create_tree("idx", false, Arc::new(BytewiseComparator)).unwrap();
        let err = handle.tree("idx", Arc::new(ReverseBytewiseComparator)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn tree_info_needs_no_comparator() {
        let (_, handle) = handle("coll-1");
        let tree = handle
            .create_tree("idx-rev", true, Arc::new(ReverseBytewiseComparator))
            .unwrap();
        tree.insert(b"a", RecordId(1)).unwrap();
        tree.insert(b"b", RecordId(2)).unwrap();

        let info = handle.tree_info("idx-rev").unwrap();
        assert_eq!(info.comparator, ReverseBytewiseComparator.name());
        assert!(info.unique);
        assert_eq!(info.entries, 2);
        assert!(matches!(handle.tree_info("nope"), Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn drop_tree_frees_nodes() {
        let (_, handle) = handle("coll-1");
        let before = handle.pool().stats().unwrap();
        let tree = handle.create_tree("idx", false, Arc::new(BytewiseComparator)).unwrap();
        for i in 0..500u64 {
            tree.insert(format!("key-{i:05}").as_bytes(), RecordId(i)).unwrap();
        }
        handle.drop_tree("idx").unwrap();

        assert!(!handle.has_tree("idx").unwrap());
        assert!(matches!(
            handle.tree("idx", Arc::new(BytewiseComparator)),
            Err(CoreError::NotFound { .. })
        ));
        assert!(matches!(handle.drop_tree("idx"), Err(CoreError::NotFound { .. })));
        let after = handle.pool().stats().unwrap();
        assert!(after.free_bytes > before.free_bytes);
    }

    #[test]
    fn dropped_tree_rejects_stale_handles() {
        let (_, handle) = handle("coll-1");
        let stale = handle.create_tree("idx-old", false, Arc::new(BytewiseComparator)).unwrap();
        stale.insert(b"a", RecordId(1)).unwrap();
        handle.drop_tree("idx-old").unwrap();
        assert!(stale.is_dropped());

        // The freed header block is free for the next tree to reuse.
        let fresh = handle.create_tree("idx-new", false, Arc::new(BytewiseComparator)).unwrap();
        fresh.insert(b"z", RecordId(7)).unwrap();

        assert!(matches!(stale.insert(b"b", RecordId(2)), Err(CoreError::NotFound { .. })));
        assert!(matches!(stale.remove(b"a", RecordId(1)), Err(CoreError::NotFound { .. })));
        assert!(matches!(stale.len(), Err(CoreError::NotFound { .. })));
        assert!(matches!(stale.find(b"z"), Err(CoreError::NotFound { .. })));
        assert!(matches!(stale.clear(), Err(CoreError::NotFound { .. })));

        assert!(!fresh.is_dropped());
        assert_eq!(fresh.len().unwrap(), 1);
        assert_eq!(fresh.find(b"z").unwrap(), vec![RecordId(7)]);
    }

    #[test]
    fn failed_drop_keeps_tree_usable() {
        let (_, handle) = handle("coll-1");
        let tree = handle.create_tree("idx", false, Arc::new(BytewiseComparator)).unwrap();
        assert!(matches!(handle.drop_tree("other"), Err(CoreError::NotFound { .. })));
        tree.insert(b"k", RecordId(1)).unwrap();
        assert!(!tree.is_dropped());
    }

    #[test]
    fn missing_tree_is_not_found() {
        let (_, handle) = handle("coll-1");
        let err = handle.tree("nope", Arc::new(BytewiseComparator)).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn close_stores_counters() {
        let (backend, handle) = handle("coll-1");
        handle.map().insert_auto(b"one").unwrap();
        handle.map().insert_auto(b"two").unwrap();
        handle.close().unwrap();
        handle.close().unwrap();

        let pool = Pool::open_in(Box::new(backend), COLLECTION_LAYOUT).unwrap();
        let reopened = PoolHandle::attach("coll-1", Arc::new(pool)).unwrap();
        assert_eq!(reopened.map().len(), 2);
        assert_eq!(reopened.map().next_id(), RecordId(3));
    }

    #[test]
    fn registry_opens_each_ident_once() {
        let registry = PoolRegistry::new();
        let mut opened = 0;
        let first = registry
            .get_or_try_insert_with("coll-1", || {
                opened += 1;
                Ok(handle("coll-1").1)
            })
            .unwrap();
        let second = registry
            .get_or_try_insert_with("coll-1", || {
                opened += 1;
                Ok(handle("coll-1").1)
            })
            .unwrap();

        assert_eq!(opened, 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.idents(), vec!["coll-1".to_string()]);
    }

    #[test]
    fn registry_failed_open_registers_nothing() {
        let registry = PoolRegistry::new();
        let err = registry
            .get_or_try_insert_with("coll-1", || Err(CoreError::not_found("pool coll-1")))
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_close_all_closes_pools() {
        let registry = PoolRegistry::new();
        {
            let mut guard = registry.lock();
            guard.insert(Arc::new(handle("a").1));
            guard.insert(Arc::new(handle("b").1));
            assert!(guard.contains("a"));
        }
        let handles = registry.handles();
        registry.close_all().unwrap();

        assert!(registry.is_empty());
        assert!(handles.iter().all(|h| h.pool().is_closed()));
    }

    #[test]
    fn file_pool_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("coll.pool");
        let handle = PoolHandle::create(&path, "coll", MIN_POOL_SIZE, 0o664, 8).unwrap();
        handle.map().insert(RecordId(1), b"a").unwrap();
        handle.close().unwrap();

        let reopened = PoolHandle::open(&path, "coll").unwrap();
        assert_eq!(reopened.map().get(RecordId(1)).unwrap().as_deref(), Some(&b"a"[..]));
        assert!(matches!(
            PoolHandle::open(&dir.path().join("missing.pool"), "missing"),
            Err(CoreError::NotFound { .. })
        ));
    }
}
