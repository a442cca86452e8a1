//! Test fixtures and engine helpers.
//!
//! Provides convenience functions for setting up scratch engines, in-memory
//! collection pools and common test scenarios.

use pmse_core::{
    BytewiseComparator, CollectionOptions, Config, CoreResult, Engine, PoolHandle, RecordId,
    MIN_POOL_SIZE,
};
use pmse_storage::InMemoryBackend;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Name of the index tree the fixtures create.
pub const INDEX: &str = "index-0";

/// A configuration with minimum-size pools, for fast tests.
pub fn small_config() -> Config {
    Config::new()
        .identlist_pool_size(MIN_POOL_SIZE)
        .collection_pool_size(MIN_POOL_SIZE)
        .system_collection_pool_size(MIN_POOL_SIZE)
        .map_buckets(64)
}

/// An engine in a temporary directory.
pub struct TestEngine {
    engine: Option<Engine>,
    dir: TempDir,
}

impl TestEngine {
    /// Opens an engine with [`small_config`] in a new temporary directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let engine = Engine::open_with_config(dir.path(), small_config())
            .expect("Failed to open engine");
        Self {
            engine: Some(engine),
            dir,
        }
    }

    /// Directory holding the engine's pools.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Closes the engine cleanly and opens it again.
    pub fn restart(&mut self) -> &Engine {
        if let Some(engine) = self.engine.take() {
            engine.close().expect("Failed to close engine");
        }
        self.reopen()
    }

    /// Drops the engine without closing it, as a killed process would, and
    /// opens it again.
    pub fn crash_and_restart(&mut self) -> &Engine {
        drop(self.engine.take());
        self.reopen()
    }

    /// Closes the engine cleanly and leaves it closed. The data directory
    /// lives on until the fixture is dropped.
    pub fn shut_down(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.close().expect("Failed to close engine");
        }
    }

    fn reopen(&mut self) -> &Engine {
        let engine = Engine::open_with_config(self.dir.path(), small_config())
            .expect("Failed to reopen engine");
        self.engine.insert(engine)
    }

    /// Path of a file inside the data directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_ref().expect("engine is open")
    }
}

impl Drop for TestEngine {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            let _ = engine.close();
        }
    }
}

/// Runs a test against a scratch engine that is closed afterwards.
///
/// # Example
///
/// ```rust,ignore
/// use pmse_testkit::with_temp_engine;
///
/// #[test]
/// fn my_test() {
///     with_temp_engine(|engine| {
///         engine.create_collection("db.c", "c", &Default::default()).unwrap();
///     });
/// }
/// ```
pub fn with_temp_engine<F, R>(f: F) -> R
where
    F: FnOnce(&Engine) -> R,
{
    let engine = TestEngine::new();
    f(&engine)
}

/// A collection pool in memory with [`INDEX`] created, bytewise ordered
/// and non-unique.
pub fn memory_collection() -> PoolHandle {
    let handle = PoolHandle::create_in(Box::new(InMemoryBackend::new()), "memory", MIN_POOL_SIZE, 64)
        .expect("Failed to create in-memory pool");
    handle
        .create_tree(INDEX, false, Arc::new(BytewiseComparator))
        .expect("Failed to create index tree");
    handle
}

/// Every record of the collection's map, in id order.
///
/// # Errors
///
/// Returns the first map read failure.
pub fn map_contents(handle: &PoolHandle) -> CoreResult<BTreeMap<RecordId, Vec<u8>>> {
    handle.map().iter().collect()
}

/// Every entry of [`INDEX`], in scan order.
///
/// # Errors
///
/// Returns an error if the tree is missing or unreadable.
pub fn tree_contents(handle: &PoolHandle) -> CoreResult<Vec<(Vec<u8>, RecordId)>> {
    let tree = handle.tree(INDEX, Arc::new(BytewiseComparator))?;
    tree.scan(Bound::Unbounded, Bound::Unbounded, pmse_core::Direction::Forward)
        .collect()
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a collection with `count` records whose payloads are
    /// `"record-<i>"`.
    pub fn populated_engine(count: u64) -> (TestEngine, Vec<RecordId>) {
        let engine = TestEngine::new();
        let options = CollectionOptions::default();
        engine
            .create_collection("test.records", "records", &options)
            .expect("Failed to create collection");
        let store = engine
            .get_collection("test.records", "records", &options)
            .expect("Failed to open collection");
        let ids = (0..count)
            .map(|i| {
                store
                    .insert_record(format!("record-{i}").as_bytes())
                    .expect("Failed to insert")
            })
            .collect();
        (engine, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_restarts() {
        let mut engine = TestEngine::new();
        engine.create_collection("db.a", "a", &CollectionOptions::default()).unwrap();
        assert!(engine.restart().was_clean_start());
        assert!(engine.has_ident("a").unwrap());
        assert!(!engine.crash_and_restart().was_clean_start());
    }

    #[test]
    fn with_temp_engine_works() {
        let idents = with_temp_engine(|engine| engine.list_idents().unwrap());
        assert!(idents.is_empty());
    }

    #[test]
    fn memory_collection_has_index() {
        let handle = memory_collection();
        assert!(handle.has_tree(INDEX).unwrap());
        assert!(tree_contents(&handle).unwrap().is_empty());
        assert!(map_contents(&handle).unwrap().is_empty());
    }

    #[test]
    fn populated_engine_holds_records() {
        let (engine, ids) = scenarios::populated_engine(25);
        let store = engine
            .get_collection("test.records", "records", &CollectionOptions::default())
            .unwrap();
        assert_eq!(store.num_records(), 25);
        assert_eq!(
            store.find_record(ids[7]).unwrap().as_deref(),
            Some(&b"record-7"[..])
        );
    }
}
