//! Cross-crate integration test helpers.
//!
//! [`IntegrationHarness`] drives an engine through collection and index
//! writes while tracking what every record and index should hold, so a
//! test can restart or crash the engine and verify nothing was lost or
//! invented.

use crate::fixtures::TestEngine;
use pmse_core::{
    CollectionOptions, CoreResult, Direction, Engine, IndexDescriptor, RecordId, WriteUnit,
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

const NS: &str = "test.people";
const COLLECTION: &str = "people";
const BY_NAME: &str = "people-by-name";

/// An engine with one collection and one non-unique index, plus the
/// expected contents of both.
pub struct IntegrationHarness {
    engine: TestEngine,
    records: BTreeMap<RecordId, Vec<u8>>,
    index: BTreeSet<(Vec<u8>, RecordId)>,
}

impl IntegrationHarness {
    /// Creates the harness with an empty collection and index.
    pub fn new() -> Self {
        let engine = TestEngine::new();
        engine
            .create_collection(NS, COLLECTION, &CollectionOptions::default())
            .expect("Failed to create collection");
        engine
            .create_index(BY_NAME, &IndexDescriptor::new(NS))
            .expect("Failed to create index");
        Self {
            engine,
            records: BTreeMap::new(),
            index: BTreeSet::new(),
        }
    }

    /// The engine under test.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Stores `name` as a record and indexes it, in one write unit.
    pub fn put(&mut self, name: &str) -> RecordId {
        let id = self.write(name).expect("Failed to write record");
        self.records.insert(id, name.as_bytes().to_vec());
        self.index.insert((name.as_bytes().to_vec(), id));
        id
    }

    /// Starts the same write as [`put`](Self::put) but rolls it back.
    pub fn put_and_abandon(&mut self, name: &str) {
        let store = self.store();
        let index = self.index_handle();
        let mut unit = WriteUnit::new();
        let id = unit
            .insert(store.map(), name.as_bytes())
            .expect("Failed to insert");
        unit.index_insert(index.tree(), name.as_bytes(), id)
            .expect("Failed to index");
        unit.rollback().expect("Failed to roll back");
    }

    fn write(&self, name: &str) -> CoreResult<RecordId> {
        let store = self.store();
        let index = self.index_handle();
        let mut unit = WriteUnit::new();
        let id = unit.insert(store.map(), name.as_bytes())?;
        unit.index_insert(index.tree(), name.as_bytes(), id)?;
        unit.commit()?;
        Ok(id)
    }

    /// Deletes a record and its index entry.
    pub fn delete(&mut self, id: RecordId) {
        let name = self.records.remove(&id).expect("Record is not tracked");
        let store = self.store();
        let index = self.index_handle();
        let mut unit = WriteUnit::new();
        unit.index_remove(index.tree(), &name, id)
            .expect("Failed to unindex");
        unit.remove(store.map(), id).expect("Failed to remove");
        unit.commit().expect("Failed to commit");
        self.index.remove(&(name, id));
    }

    /// Closes the engine cleanly and reopens it.
    pub fn restart(&mut self) {
        self.engine.restart();
    }

    /// Drops the engine without closing it and reopens it.
    pub fn crash(&mut self) {
        self.engine.crash_and_restart();
    }

    /// Checks the collection and index against the tracked state.
    pub fn verify(&self) {
        let store = self.store();
        let stored: BTreeMap<RecordId, Vec<u8>> = store
            .records()
            .collect::<CoreResult<_>>()
            .expect("Failed to read records");
        assert_eq!(stored, self.records, "record contents diverged");

        let index = self.index_handle();
        let entries: BTreeSet<(Vec<u8>, RecordId)> = index
            .scan(Bound::Unbounded, Bound::Unbounded, Direction::Forward)
            .collect::<CoreResult<_>>()
            .expect("Failed to scan index");
        assert_eq!(entries, self.index, "index contents diverged");
        assert_eq!(index.num_entries().unwrap(), self.index.len() as u64);
    }

    fn store(&self) -> pmse_core::RecordStoreHandle {
        self.engine
            .get_collection(NS, COLLECTION, &CollectionOptions::default())
            .expect("Failed to open collection")
    }

    fn index_handle(&self) -> pmse_core::IndexHandle {
        self.engine
            .get_index(BY_NAME, &IndexDescriptor::new(NS))
            .expect("Failed to open index")
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}
