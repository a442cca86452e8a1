//! Engine lifecycle and recovery.
//!
//! The engine owns a data directory holding one metadata pool (the ident
//! list) and one pool per collection. Opening the engine reads the clean
//! shutdown flag from the ident list and clears it; if the previous session
//! did not close cleanly, every registered pool is repaired before the
//! engine is handed out.

use crate::config::Config;
use crate::dir::{validate_ident, DataDir};
use crate::error::{CoreError, CoreResult};
use crate::handles::{IndexHandle, RecordStoreHandle};
use crate::identlist::IdentList;
use crate::pool::Pool;
use crate::registry::{PoolHandle, PoolRegistry, RegistryGuard, COLLECTION_LAYOUT};
use crate::repair::{self, RepairReport};
use crate::tree::{BytewiseComparator, KeyComparator};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether the engine's pools were checked after the last session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// The previous session did not shut down cleanly and repair has not
    /// finished.
    Unverified,
    /// The previous session shut down cleanly, or repair completed.
    Verified,
}

/// Options applied when a collection is created.
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    /// Pool capacity; defaults to the configured size for the namespace.
    pub pool_size: Option<u64>,
    /// Record map buckets; defaults to [`Config::map_buckets`].
    pub buckets: Option<u32>,
}

/// Describes an index.
#[derive(Clone)]
pub struct IndexDescriptor {
    /// Namespace of the collection being indexed.
    pub parent_namespace: String,
    /// Whether keys must be unique.
    pub unique: bool,
    /// Key order.
    pub comparator: Arc<dyn KeyComparator>,
}

impl std::fmt::Debug for IndexDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexDescriptor")
            .field("parent_namespace", &self.parent_namespace)
            .field("unique", &self.unique)
            .field("comparator", &self.comparator.name())
            .finish()
    }
}

impl IndexDescriptor {
    /// A non-unique, bytewise-ordered index on `parent_namespace`.
    #[must_use]
    pub fn new(parent_namespace: impl Into<String>) -> Self {
        Self {
            parent_namespace: parent_namespace.into(),
            unique: false,
            comparator: Arc::new(BytewiseComparator),
        }
    }

    /// Sets uniqueness.
    #[must_use]
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Sets the key comparator.
    #[must_use]
    pub fn comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparator = comparator;
        self
    }
}

/// The storage engine.
///
/// # Example
///
/// ```rust,ignore
/// use pmse_core::{CollectionOptions, Engine};
///
/// let engine = Engine::open(Path::new("data"))?;
/// engine.create_collection("db.users", "collection-1", &CollectionOptions::default())?;
/// let users = engine.get_collection("db.users", "collection-1", &CollectionOptions::default())?;
/// let id = users.insert_record(b"{...}")?;
/// engine.close()?;
/// ```
pub struct Engine {
    config: Config,
    dir: DataDir,
    identlist: IdentList,
    registry: PoolRegistry,
    recovery: RecoveryState,
    clean_start: bool,
    last_repair: Option<RepairReport>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.dir.path())
            .field("recovery", &self.recovery)
            .field("open_pools", &self.registry.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Engine {
    /// Opens the engine in `path` with the default configuration.
    ///
    /// # Errors
    ///
    /// See [`open_with_config`](Self::open_with_config).
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens the engine in `path`, creating the directory and metadata pool
    /// if allowed, and repairs every pool after an unclean shutdown.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the directory or metadata pool is missing and
    ///   `create_if_missing` is off
    /// - a storage `Locked` error if another engine has the directory open
    /// - `CorruptPool` if the metadata pool cannot be opened
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        let dir = DataDir::open(path, config.create_if_missing)?;
        dir.clean_staging()?;

        let list_path = dir.identlist_path();
        let identlist = if list_path.exists() {
            IdentList::open(&list_path)?
        } else if config.create_if_missing {
            let list = IdentList::create(&list_path, config.identlist_pool_size, config.file_mode)?;
            tracing::info!(path = %list_path.display(), "metadata pool created");
            list
        } else {
            return Err(CoreError::not_found(format!(
                "metadata pool {}",
                list_path.display()
            )));
        };

        let clean_start = identlist.is_after_safe_shutdown()?;
        identlist.reset_state()?;

        let mut engine = Self {
            config,
            dir,
            identlist,
            registry: PoolRegistry::new(),
            recovery: if clean_start {
                RecoveryState::Verified
            } else {
                RecoveryState::Unverified
            },
            clean_start,
            last_repair: None,
            closed: AtomicBool::new(false),
        };

        if !clean_start {
            tracing::warn!(path = %path.display(), "previous shutdown was not clean, repairing");
            let report = engine.repair()?;
            engine.last_repair = Some(report);
            engine.recovery = RecoveryState::Verified;
        }

        tracing::info!(path = %path.display(), clean_start, "engine opened");
        Ok(engine)
    }

    /// Repairs the ident list and every collection it names.
    fn repair(&self) -> CoreResult<RepairReport> {
        let (entries, mut report) = repair::repair_identlist(&self.identlist)?;
        let listed: HashSet<String> = entries.iter().map(|(ident, _)| ident.clone()).collect();
        let listed_indexes: HashSet<String> = entries
            .iter()
            .filter(|(_, ns)| ns.is_empty())
            .map(|(ident, _)| ident.clone())
            .collect();

        let mut found_indexes = HashSet::new();
        let mut skipped = false;
        for (ident, ns) in entries.iter().filter(|(_, ns)| !ns.is_empty()) {
            let path = match self.dir.pool_path(ident) {
                Ok(path) if path.exists() => path,
                _ => {
                    report.finding(format!("collection {ident} ({ns}) has no pool file, unlisted"));
                    self.identlist.delete(ident)?;
                    continue;
                }
            };
            match self.repair_collection(ident, &path, &listed_indexes, &mut found_indexes) {
                Ok(collection) => report.merge(collection),
                Err(err) => {
                    tracing::error!(ident = %ident, error = %err, "collection pool left unrepaired");
                    report.finding(format!("collection {ident} skipped: {err}"));
                    skipped = true;
                }
            }
        }

        // With a collection skipped, an index entry might belong to it.
        if !skipped {
            for ident in listed_indexes.difference(&found_indexes) {
                report.finding(format!("index {ident} has no tree, unlisted"));
                self.identlist.delete(ident)?;
            }
        }

        for ident in self.dir.pool_files()? {
            if !listed.contains(&ident) {
                report.finding(format!("pool file of unlisted collection {ident} removed"));
                self.dir.remove_pool(&ident)?;
            }
        }

        tracing::info!(%report, "repair finished");
        Ok(report)
    }

    fn repair_collection(
        &self,
        ident: &str,
        path: &Path,
        listed_indexes: &HashSet<String>,
        found_indexes: &mut HashSet<String>,
    ) -> CoreResult<RepairReport> {
        let pool = Arc::new(Pool::open(path, COLLECTION_LAYOUT)?);
        let mut report = repair::repair_pool(&pool, &self.config)?;
        let handle = PoolHandle::attach(ident, pool)?;

        for name in handle.index_names()? {
            if listed_indexes.contains(&name) {
                found_indexes.insert(name);
            } else {
                report.finding(format!("index {name} of {ident} is not listed, dropped"));
                handle.drop_tree(&name)?;
            }
        }
        self.registry.lock().insert(Arc::new(handle));
        Ok(report)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CoreError::closed("engine"))
        } else {
            Ok(())
        }
    }

    /// Returns the registered handle of collection `ident`, opening its
    /// pool if needed.
    fn handle_locked(&self, guard: &mut RegistryGuard<'_>, ident: &str) -> CoreResult<Arc<PoolHandle>> {
        if let Some(handle) = guard.get(ident) {
            return Ok(handle);
        }
        let handle = Arc::new(PoolHandle::open(&self.dir.pool_path(ident)?, ident)?);
        guard.insert(Arc::clone(&handle));
        Ok(handle)
    }

    /// Creates collection `ident` for namespace `ns`.
    ///
    /// An existing pool file for an unlisted `ident` is adopted instead of
    /// recreated.
    ///
    /// # Errors
    ///
    /// - `DuplicateKey` if `ident` is already listed
    /// - `InvalidOperation` if `ident` is not a valid file name
    /// - `AllocationError` if the pool size is too small
    /// - `OutOfDiskSpace` for any other failure
    pub fn create_collection(&self, ns: &str, ident: &str, options: &CollectionOptions) -> CoreResult<()> {
        self.ensure_open()?;
        validate_ident(ident)?;
        let mut guard = self.registry.lock();
        self.create_collection_locked(&mut guard, ns, ident, options)
            .map_err(CoreError::into_storage_failure)?;
        tracing::info!(ns, ident, "collection created");
        Ok(())
    }

    fn create_collection_locked(
        &self,
        guard: &mut RegistryGuard<'_>,
        ns: &str,
        ident: &str,
        options: &CollectionOptions,
    ) -> CoreResult<()> {
        if self.identlist.get(ident)?.is_some() {
            return Err(CoreError::duplicate_key(format!("ident {ident}")));
        }

        let path = self.dir.pool_path(ident)?;
        let created = guard.get(ident).is_none() && !path.exists();
        let handle = if created {
            let capacity = options
                .pool_size
                .unwrap_or_else(|| self.config.pool_size_for(ns));
            let buckets = options.buckets.unwrap_or(self.config.map_buckets);
            let handle = PoolHandle::create(&path, ident, capacity, self.config.file_mode, buckets)?;
            guard.insert(Arc::new(handle));
            guard.get(ident)
        } else {
            tracing::warn!(ident, "adopting existing pool for new collection");
            Some(self.handle_locked(guard, ident)?)
        };

        if let Err(err) = self.identlist.insert(ident, ns) {
            if created {
                if let Some(handle) = guard.remove(ident).or(handle) {
                    handle.release();
                }
                self.dir.remove_pool(ident)?;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Returns the record store of collection `ident`.
    ///
    /// Stores the map counters and records `ns` as the collection's
    /// namespace. `_options` only apply at creation.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the collection has no pool file.
    pub fn get_collection(
        &self,
        ns: &str,
        ident: &str,
        _options: &CollectionOptions,
    ) -> CoreResult<RecordStoreHandle> {
        self.ensure_open()?;
        let handle = self.registry.get_or_try_insert_with(ident, || {
            PoolHandle::open(&self.dir.pool_path(ident)?, ident)
        })?;
        handle.map().store_counters()?;
        self.identlist.update(ident, ns)?;
        Ok(RecordStoreHandle::new(ns, ident, handle))
    }

    /// Creates index `ident` on the collection of `desc.parent_namespace`.
    ///
    /// # Errors
    ///
    /// - `DuplicateKey` if `ident` is already listed
    /// - `NotFound` if no collection has the parent namespace
    /// - `OutOfDiskSpace` for any other failure
    pub fn create_index(&self, ident: &str, desc: &IndexDescriptor) -> CoreResult<()> {
        self.ensure_open()?;
        validate_ident(ident)?;
        let mut guard = self.registry.lock();
        self.create_index_locked(&mut guard, ident, desc)
            .map_err(CoreError::into_storage_failure)?;
        tracing::info!(ident, parent = %desc.parent_namespace, unique = desc.unique, "index created");
        Ok(())
    }

    fn create_index_locked(
        &self,
        guard: &mut RegistryGuard<'_>,
        ident: &str,
        desc: &IndexDescriptor,
    ) -> CoreResult<()> {
        if self.identlist.get(ident)?.is_some() {
            return Err(CoreError::duplicate_key(format!("ident {ident}")));
        }
        let collection = self.parent_ident(&desc.parent_namespace)?;
        let handle = self.handle_locked(guard, &collection)?;
        handle.create_tree(ident, desc.unique, Arc::clone(&desc.comparator))?;

        if let Err(err) = self.identlist.insert(ident, "") {
            if let Err(undo) = handle.drop_tree(ident) {
                tracing::warn!(ident, error = %undo, "could not undo index tree creation");
            }
            return Err(err);
        }
        Ok(())
    }

    fn parent_ident(&self, parent_namespace: &str) -> CoreResult<String> {
        self.identlist
            .find_first_value(parent_namespace)?
            .ok_or_else(|| CoreError::not_found(format!("collection for namespace {parent_namespace}")))
    }

    /// Returns index `ident`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the parent collection or the index is missing,
    /// or `InvalidOperation` if `desc` names a different comparator.
    pub fn get_index(&self, ident: &str, desc: &IndexDescriptor) -> CoreResult<IndexHandle> {
        self.ensure_open()?;
        let collection = self.parent_ident(&desc.parent_namespace)?;
        let handle = self.registry.get_or_try_insert_with(&collection, || {
            PoolHandle::open(&self.dir.pool_path(&collection)?, &collection)
        })?;
        let tree = handle.tree(ident, Arc::clone(&desc.comparator))?;
        Ok(IndexHandle::new(ident, &collection, tree))
    }

    /// Drops a collection or index.
    ///
    /// Dropping a collection deletes its pool file together with every index
    /// inside it. Dropping an unknown identifier succeeds, so a drop
    /// interrupted by a crash can be retried.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata update or file removal fails.
    pub fn drop_ident(&self, ident: &str) -> CoreResult<()> {
        self.ensure_open()?;
        validate_ident(ident)?;
        let mut guard = self.registry.lock();
        match self.identlist.get(ident)? {
            Some(ns) if ns.is_empty() => self.drop_index_locked(&mut guard, ident),
            _ => self.drop_collection_locked(&mut guard, ident),
        }
    }

    fn drop_collection_locked(&self, guard: &mut RegistryGuard<'_>, ident: &str) -> CoreResult<()> {
        // The pool may not be attached yet in this session; its index table
        // is the only record of which index idents go with it.
        let indexes = if guard.contains(ident) || self.dir.pool_path(ident)?.exists() {
            self.handle_locked(guard, ident)?.index_names()?
        } else {
            Vec::new()
        };

        self.identlist.delete(ident)?;
        for index in &indexes {
            self.identlist.delete(index)?;
        }
        if let Some(handle) = guard.remove(ident) {
            handle.release();
        }
        self.dir.remove_pool(ident)?;
        tracing::info!(ident, indexes = indexes.len(), "collection dropped");
        Ok(())
    }

    fn drop_index_locked(&self, guard: &mut RegistryGuard<'_>, ident: &str) -> CoreResult<()> {
        self.identlist.delete(ident)?;

        for (collection, ns) in self.identlist.entries()? {
            if ns.is_empty() || !self.dir.pool_path(&collection)?.exists() {
                continue;
            }
            let handle = self.handle_locked(guard, &collection)?;
            if handle.has_tree(ident)? {
                handle.drop_tree(ident)?;
                tracing::info!(ident, collection = %collection, "index dropped");
                return Ok(());
            }
        }
        tracing::debug!(ident, "dropped index had no tree");
        Ok(())
    }

    /// Closes every pool and records a clean shutdown. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns the first close failure; the shutdown is then not marked
    /// clean.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let marked = self
            .registry
            .close_all()
            .and_then(|()| self.identlist.mark_safe_shutdown());
        let closed = self.identlist.close();
        marked.and(closed)?;
        tracing::info!(path = %self.dir.path().display(), "engine closed");
        Ok(())
    }

    /// Recovery state of this session.
    #[must_use]
    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery
    }

    /// Returns true if the previous session closed cleanly.
    #[must_use]
    pub fn was_clean_start(&self) -> bool {
        self.clean_start
    }

    /// Report of the repair run at open, if one was needed.
    #[must_use]
    pub fn last_repair_report(&self) -> Option<&RepairReport> {
        self.last_repair.as_ref()
    }

    /// Every listed `(ident, namespace)` pair; indexes have an empty
    /// namespace.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after [`close`](Self::close).
    pub fn list_idents(&self) -> CoreResult<Vec<(String, String)>> {
        self.ensure_open()?;
        self.identlist.entries()
    }

    /// Returns true if `ident` is listed.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after [`close`](Self::close).
    pub fn has_ident(&self, ident: &str) -> CoreResult<bool> {
        self.ensure_open()?;
        Ok(self.identlist.get(ident)?.is_some())
    }

    /// The data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        self.dir.path()
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Identifiers of the collections whose pools are open.
    #[must_use]
    pub fn open_collections(&self) -> Vec<String> {
        self.registry.idents()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(path = %self.dir.path().display(), "engine dropped without close");
        self.registry.release_all();
        if let Err(err) = self.identlist.close() {
            tracing::warn!(error = %err, "metadata pool release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MIN_POOL_SIZE;
    use crate::tree::ReverseBytewiseComparator;
    use crate::types::{Direction, RecordId};
    use std::ops::Bound;
    use tempfile::tempdir;

    fn config() -> Config {
        Config::new()
            .identlist_pool_size(MIN_POOL_SIZE)
            .collection_pool_size(2 * MIN_POOL_SIZE)
            .system_collection_pool_size(MIN_POOL_SIZE)
            .map_buckets(32)
    }

    fn open(path: &Path) -> Engine {
        Engine::open_with_config(path, config()).unwrap()
    }

    fn opts() -> CollectionOptions {
        CollectionOptions::default()
    }

    #[test]
    fn fresh_engine_is_verified() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        assert_eq!(engine.recovery_state(), RecoveryState::Verified);
        assert!(engine.was_clean_start());
        assert!(engine.last_repair_report().is_none());
        assert!(engine.list_idents().unwrap().is_empty());
        engine.close().unwrap();
    }

    #[test]
    fn missing_directory_without_create() {
        let dir = tempdir().unwrap();
        let result = Engine::open_with_config(
            &dir.path().join("absent"),
            config().create_if_missing(false),
        );
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }

    #[test]
    fn records_survive_clean_restart() {
        let dir = tempdir().unwrap();
        let id = {
            let engine = open(dir.path());
            engine.create_collection("db.users", "coll-1", &opts()).unwrap();
            let store = engine.get_collection("db.users", "coll-1", &opts()).unwrap();
            let id = store.insert_record(b"alice").unwrap();
            engine.close().unwrap();
            id
        };

        let engine = open(dir.path());
        assert!(engine.was_clean_start());
        let store = engine.get_collection("db.users", "coll-1", &opts()).unwrap();
        assert_eq!(store.find_record(id).unwrap().as_deref(), Some(&b"alice"[..]));
        assert_eq!(store.num_records(), 1);
        assert_eq!(store.insert_record(b"bob").unwrap(), RecordId(id.as_u64() + 1));
        engine.close().unwrap();
    }

    #[test]
    fn unclean_restart_runs_repair() {
        let dir = tempdir().unwrap();
        {
            let engine = open(dir.path());
            engine.create_collection("db.users", "coll-1", &opts()).unwrap();
            let store = engine.get_collection("db.users", "coll-1", &opts()).unwrap();
            store.insert_record(b"one").unwrap();
            store.insert_record(b"two").unwrap();
        }

        let engine = open(dir.path());
        assert!(!engine.was_clean_start());
        assert_eq!(engine.recovery_state(), RecoveryState::Verified);
        let report = engine.last_repair_report().unwrap();
        assert_eq!(report.maps, 1);
        assert_eq!(report.entries, 2);

        let store = engine.get_collection("db.users", "coll-1", &opts()).unwrap();
        assert_eq!(store.num_records(), 2);
        assert_eq!(store.insert_record(b"three").unwrap(), RecordId(3));
        engine.close().unwrap();

        let engine = open(dir.path());
        assert!(engine.was_clean_start());
        engine.close().unwrap();
    }

    #[test]
    fn duplicate_collection_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        engine.create_collection("db.a", "coll-1", &opts()).unwrap();
        let err = engine.create_collection("db.b", "coll-1", &opts()).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateKey { .. }));
        engine.close().unwrap();
    }

    #[test]
    fn failed_creation_leaves_nothing() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        let options = CollectionOptions {
            pool_size: Some(4096),
            buckets: None,
        };
        let err = engine.create_collection("db.a", "coll-1", &options).unwrap_err();
        assert!(err.is_out_of_space());
        assert!(!engine.has_ident("coll-1").unwrap());
        assert!(!dir.path().join("coll-1.pool").exists());
        assert!(engine.open_collections().is_empty());
        engine.close().unwrap();
    }

    #[test]
    fn system_namespaces_get_small_pools() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        engine.create_collection("admin.system.users", "sys-1", &opts()).unwrap();
        engine.create_collection("db.users", "coll-1", &opts()).unwrap();

        let sys = engine.get_collection("admin.system.users", "sys-1", &opts()).unwrap();
        let user = engine.get_collection("db.users", "coll-1", &opts()).unwrap();
        assert_eq!(sys.pool_handle().pool().capacity(), MIN_POOL_SIZE);
        assert_eq!(user.pool_handle().pool().capacity(), 2 * MIN_POOL_SIZE);
        engine.close().unwrap();
    }

    #[test]
    fn index_lifecycle() {
        let dir = tempdir().unwrap();
        let desc = IndexDescriptor::new("db.users")
            .unique(true)
            .comparator(Arc::new(ReverseBytewiseComparator));
        {
            let engine = open(dir.path());
            engine.create_collection("db.users", "coll-1", &opts()).unwrap();
            engine.create_index("idx-name", &desc).unwrap();
            let index = engine.get_index("idx-name", &desc).unwrap();
            assert_eq!(index.collection_ident(), "coll-1");
            for (i, key) in ["a", "b", "c"].iter().enumerate() {
                index.insert(key.as_bytes(), RecordId(i as u64)).unwrap();
            }
            assert!(matches!(
                index.insert(b"a", RecordId(9)),
                Err(CoreError::DuplicateKey { .. })
            ));
            assert!(matches!(
                engine.create_index("idx-name", &desc),
                Err(CoreError::DuplicateKey { .. })
            ));
            engine.close().unwrap();
        }

        let engine = open(dir.path());
        let index = engine.get_index("idx-name", &desc).unwrap();
        let keys: Vec<_> = index
            .scan(Bound::Unbounded, Bound::Unbounded, Direction::Forward)
            .map(|item| item.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);

        let wrong = IndexDescriptor::new("db.users");
        assert!(matches!(
            engine.get_index("idx-name", &wrong),
            Err(CoreError::InvalidOperation { .. })
        ));
        engine.close().unwrap();
    }

    #[test]
    fn index_needs_parent_collection() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        let err = engine
            .create_index("idx", &IndexDescriptor::new("db.missing"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
        assert!(!engine.has_ident("idx").unwrap());
        engine.close().unwrap();
    }

    #[test]
    fn drop_index_and_collection() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        let desc = IndexDescriptor::new("db.users");
        engine.create_collection("db.users", "coll-1", &opts()).unwrap();
        engine.create_index("idx-1", &desc).unwrap();
        engine.create_index("idx-2", &desc).unwrap();

        engine.drop_ident("idx-1").unwrap();
        assert!(!engine.has_ident("idx-1").unwrap());
        assert!(matches!(
            engine.get_index("idx-1", &desc),
            Err(CoreError::NotFound { .. })
        ));
        engine.get_index("idx-2", &desc).unwrap();

        engine.drop_ident("coll-1").unwrap();
        assert!(!engine.has_ident("coll-1").unwrap());
        assert!(!engine.has_ident("idx-2").unwrap());
        assert!(!dir.path().join("coll-1.pool").exists());

        engine.drop_ident("coll-1").unwrap();
        engine.drop_ident("never-existed").unwrap();
        engine.close().unwrap();
    }

    #[test]
    fn drop_unopened_collection_unlists_its_indexes() {
        let dir = tempdir().unwrap();
        let desc = IndexDescriptor::new("db.users");
        let engine = open(dir.path());
        engine.create_collection("db.users", "coll-1", &opts()).unwrap();
        engine.create_index("idx-1", &desc).unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = open(dir.path());
        assert!(engine.open_collections().is_empty());
        engine.drop_ident("coll-1").unwrap();
        assert!(engine.list_idents().unwrap().is_empty());
        assert!(engine.open_collections().is_empty());
        assert!(!dir.path().join("coll-1.pool").exists());

        engine.create_collection("db.users", "coll-2", &opts()).unwrap();
        engine.create_index("idx-1", &desc).unwrap();
        assert!(engine.get_index("idx-1", &desc).unwrap().find(b"k").unwrap().is_empty());
        engine.close().unwrap();
    }

    #[test]
    fn unknown_collection_is_not_found() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        let err = engine.get_collection("db.x", "nope", &opts()).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
        engine.close().unwrap();
    }

    #[test]
    fn second_engine_is_locked_out() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        assert!(Engine::open_with_config(dir.path(), config()).is_err());
        engine.close().unwrap();
        open(dir.path()).close().unwrap();
    }

    #[test]
    fn closed_engine_rejects_calls() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        engine.close().unwrap();
        engine.close().unwrap();
        assert!(matches!(
            engine.create_collection("db.a", "a", &opts()),
            Err(CoreError::Closed { .. })
        ));
        assert!(matches!(engine.list_idents(), Err(CoreError::Closed { .. })));
    }

    #[test]
    fn repair_removes_orphans() {
        let dir = tempdir().unwrap();
        {
            let engine = open(dir.path());
            engine.create_collection("db.kept", "kept", &opts()).unwrap();
            engine.create_collection("db.lost", "lost", &opts()).unwrap();
        }
        // A listed collection whose file vanished and a file nobody lists.
        std::fs::remove_file(dir.path().join("lost.pool")).unwrap();
        PoolHandle::create(&dir.path().join("stray.pool"), "stray", MIN_POOL_SIZE, 0o664, 4)
            .unwrap()
            .close()
            .unwrap();

        let engine = open(dir.path());
        let report = engine.last_repair_report().unwrap().clone();
        assert_eq!(report.findings.len(), 2, "{report:?}");
        assert!(engine.has_ident("kept").unwrap());
        assert!(!engine.has_ident("lost").unwrap());
        assert!(!dir.path().join("stray.pool").exists());
        drop(engine);

        let engine = open(dir.path());
        assert!(engine.last_repair_report().unwrap().findings.is_empty());
        engine.close().unwrap();
    }

    #[test]
    fn find_first_value_is_stable() {
        let dir = tempdir().unwrap();
        let engine = open(dir.path());
        engine.create_collection("db.same", "coll-a", &opts()).unwrap();
        engine.create_collection("db.same", "coll-b", &opts()).unwrap();
        let desc = IndexDescriptor::new("db.same");
        engine.create_index("idx", &desc).unwrap();
        let first = engine.get_index("idx", &desc).unwrap().collection_ident().to_string();
        for _ in 0..5 {
            assert_eq!(engine.get_index("idx", &desc).unwrap().collection_ident(), first);
        }
        engine.close().unwrap();
    }
}
