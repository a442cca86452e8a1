//! Write units: logical writes spanning several structures.
//!
//! Each map or tree operation is atomic on its own. A host write that
//! touches a record and its index entries needs all of them or none, so a
//! [`WriteUnit`] performs each step immediately and remembers how to undo
//! it. Rolling back undoes the steps newest first.

use crate::error::{CoreError, CoreResult};
use crate::map::PersistentMap;
use crate::tree::PersistentTree;
use crate::types::RecordId;
use std::sync::Arc;

/// A reversible step of a write unit.
pub trait Change: Send {
    /// Called once the unit commits.
    fn commit(&mut self) {}

    /// Undoes the step.
    ///
    /// # Errors
    ///
    /// Returns the error of the compensating operation.
    fn rollback(&mut self) -> CoreResult<()>;
}

/// Undoes a record insert.
pub struct InsertChange {
    map: Arc<PersistentMap>,
    id: RecordId,
}

impl Change for InsertChange {
    fn rollback(&mut self) -> CoreResult<()> {
        self.map.remove(self.id)
    }
}

/// Restores a record's previous payload.
pub struct UpdateChange {
    map: Arc<PersistentMap>,
    id: RecordId,
    previous: Vec<u8>,
}

impl Change for UpdateChange {
    fn rollback(&mut self) -> CoreResult<()> {
        self.map.update(self.id, &self.previous)
    }
}

/// Re-inserts a removed record under its old id.
pub struct RemoveChange {
    map: Arc<PersistentMap>,
    id: RecordId,
    cached: Vec<u8>,
}

impl Change for RemoveChange {
    fn rollback(&mut self) -> CoreResult<()> {
        self.map.insert(self.id, &self.cached)
    }
}

/// Undoes an index insert or remove.
pub struct IndexChange {
    tree: Arc<PersistentTree>,
    key: Vec<u8>,
    rid: RecordId,
    inserted: bool,
}

impl Change for IndexChange {
    fn rollback(&mut self) -> CoreResult<()> {
        if self.inserted {
            self.tree.remove(&self.key, self.rid)
        } else {
            self.tree.insert(&self.key, self.rid)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Active,
    Committed,
    RolledBack,
}

/// A group of changes committed or rolled back together.
pub struct WriteUnit {
    changes: Vec<Box<dyn Change>>,
    state: UnitState,
}

impl std::fmt::Debug for WriteUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteUnit")
            .field("changes", &self.changes.len())
            .field("state", &self.state)
            .finish()
    }
}

impl Default for WriteUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteUnit {
    /// Starts an empty unit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
            state: UnitState::Active,
        }
    }

    fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            UnitState::Active => Ok(()),
            UnitState::Committed => Err(CoreError::invalid_operation("write unit already committed")),
            UnitState::RolledBack => Err(CoreError::invalid_operation("write unit already rolled back")),
        }
    }

    /// Registers a custom change.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the unit is finished.
    pub fn register_change(&mut self, change: Box<dyn Change>) -> CoreResult<()> {
        self.ensure_active()?;
        self.changes.push(change);
        Ok(())
    }

    /// Inserts a record under the map's next id.
    ///
    /// # Errors
    ///
    /// Returns the map's error; nothing is registered then.
    pub fn insert(&mut self, map: &Arc<PersistentMap>, payload: &[u8]) -> CoreResult<RecordId> {
        self.ensure_active()?;
        let id = map.insert_auto(payload)?;
        self.changes.push(Box::new(InsertChange {
            map: Arc::clone(map),
            id,
        }));
        Ok(id)
    }

    /// Inserts a record under `id`.
    ///
    /// # Errors
    ///
    /// Returns the map's error; nothing is registered then.
    pub fn insert_with_id(&mut self, map: &Arc<PersistentMap>, id: RecordId, payload: &[u8]) -> CoreResult<()> {
        self.ensure_active()?;
        map.insert(id, payload)?;
        self.changes.push(Box::new(InsertChange {
            map: Arc::clone(map),
            id,
        }));
        Ok(())
    }

    /// Replaces a record's payload.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is absent, or the map's error.
    pub fn update(&mut self, map: &Arc<PersistentMap>, id: RecordId, payload: &[u8]) -> CoreResult<()> {
        self.ensure_active()?;
        let previous = map
            .get(id)?
            .ok_or_else(|| CoreError::not_found(id.to_string()))?;
        map.update(id, payload)?;
        self.changes.push(Box::new(UpdateChange {
            map: Arc::clone(map),
            id,
            previous,
        }));
        Ok(())
    }

    /// Removes a record, keeping its payload for rollback.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is absent.
    pub fn remove(&mut self, map: &Arc<PersistentMap>, id: RecordId) -> CoreResult<()> {
        self.ensure_active()?;
        let cached = map
            .get(id)?
            .ok_or_else(|| CoreError::not_found(id.to_string()))?;
        map.remove(id)?;
        self.changes.push(Box::new(RemoveChange {
            map: Arc::clone(map),
            id,
            cached,
        }));
        Ok(())
    }

    /// Adds an index entry.
    ///
    /// # Errors
    ///
    /// Returns the tree's error; nothing is registered then.
    pub fn index_insert(&mut self, tree: &Arc<PersistentTree>, key: &[u8], rid: RecordId) -> CoreResult<()> {
        self.ensure_active()?;
        if !tree.is_unique() && tree.contains(key, rid)? {
            return Ok(());
        }
        tree.insert(key, rid)?;
        self.changes.push(Box::new(IndexChange {
            tree: Arc::clone(tree),
            key: key.to_vec(),
            rid,
            inserted: true,
        }));
        Ok(())
    }

    /// Removes an index entry.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the entry is absent.
    pub fn index_remove(&mut self, tree: &Arc<PersistentTree>, key: &[u8], rid: RecordId) -> CoreResult<()> {
        self.ensure_active()?;
        tree.remove(key, rid)?;
        self.changes.push(Box::new(IndexChange {
            tree: Arc::clone(tree),
            key: key.to_vec(),
            rid,
            inserted: false,
        }));
        Ok(())
    }

    /// Number of registered changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if no change was registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Commits the unit.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the unit is finished.
    pub fn commit(&mut self) -> CoreResult<()> {
        self.ensure_active()?;
        for change in &mut self.changes {
            change.commit();
        }
        self.changes.clear();
        self.state = UnitState::Committed;
        Ok(())
    }

    /// Undoes every change, newest first.
    ///
    /// Every change is attempted even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first failure, or `InvalidOperation` if the unit is
    /// finished.
    pub fn rollback(&mut self) -> CoreResult<()> {
        self.ensure_active()?;
        self.state = UnitState::RolledBack;
        let mut first_err = None;
        while let Some(mut change) = self.changes.pop() {
            if let Err(err) = change.rollback() {
                tracing::error!(error = %err, "write unit rollback step failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for WriteUnit {
    fn drop(&mut self) {
        if self.state == UnitState::Active && !self.changes.is_empty() {
            tracing::debug!(changes = self.changes.len(), "rolling back abandoned write unit");
            let _ = self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MIN_POOL_SIZE;
    use crate::registry::PoolHandle;
    use crate::tree::BytewiseComparator;
    use pmse_storage::InMemoryBackend;
    use std::sync::Mutex;

    fn handle() -> PoolHandle {
        PoolHandle::create_in(Box::new(InMemoryBackend::new()), "coll", MIN_POOL_SIZE, 16).unwrap()
    }

    #[test]
    fn commit_keeps_changes() {
        let handle = handle();
        let map = handle.map();
        let tree = handle.create_tree("idx", true, Arc::new(BytewiseComparator)).unwrap();

        let mut unit = WriteUnit::new();
        let id = unit.insert(map, b"doc").unwrap();
        unit.index_insert(&tree, b"name", id).unwrap();
        unit.commit().unwrap();

        assert_eq!(map.get(id).unwrap().as_deref(), Some(&b"doc"[..]));
        assert_eq!(tree.find(b"name").unwrap(), vec![id]);
        assert!(matches!(unit.rollback(), Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn rollback_restores_everything() {
        let handle = handle();
        let map = handle.map();
        let tree = handle.create_tree("idx", false, Arc::new(BytewiseComparator)).unwrap();
        map.insert(RecordId(1), b"old").unwrap();
        map.insert(RecordId(2), b"gone").unwrap();
        tree.insert(b"k2", RecordId(2)).unwrap();

        let mut unit = WriteUnit::new();
        let id = unit.insert(map, b"new").unwrap();
        unit.index_insert(&tree, b"k", id).unwrap();
        unit.update(map, RecordId(1), b"changed").unwrap();
        unit.remove(map, RecordId(2)).unwrap();
        unit.index_remove(&tree, b"k2", RecordId(2)).unwrap();
        assert_eq!(unit.len(), 5);
        unit.rollback().unwrap();

        assert_eq!(map.get(id).unwrap(), None);
        assert_eq!(map.get(RecordId(1)).unwrap().as_deref(), Some(&b"old"[..]));
        assert_eq!(map.get(RecordId(2)).unwrap().as_deref(), Some(&b"gone"[..]));
        assert_eq!(tree.find(b"k").unwrap(), Vec::<RecordId>::new());
        assert_eq!(tree.find(b"k2").unwrap(), vec![RecordId(2)]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn drop_rolls_back() {
        let handle = handle();
        let map = handle.map();
        let id = {
            let mut unit = WriteUnit::new();
            unit.insert(map, b"temp").unwrap()
        };
        assert_eq!(map.get(id).unwrap(), None);
    }

    #[test]
    fn failed_step_is_not_registered() {
        let handle = handle();
        let map = handle.map();
        map.insert(RecordId(7), b"x").unwrap();

        let mut unit = WriteUnit::new();
        assert!(matches!(
            unit.insert_with_id(map, RecordId(7), b"y"),
            Err(CoreError::DuplicateKey { .. })
        ));
        assert!(unit.is_empty());
        unit.rollback().unwrap();
        assert_eq!(map.get(RecordId(7)).unwrap().as_deref(), Some(&b"x"[..]));
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Change for Recorder {
        fn commit(&mut self) {
            self.log.lock().unwrap().push(format!("commit {}", self.name));
        }

        fn rollback(&mut self) -> CoreResult<()> {
            self.log.lock().unwrap().push(format!("rollback {}", self.name));
            if self.fail {
                Err(CoreError::invalid_operation("injected"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn rollback_runs_in_reverse_and_continues_past_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut unit = WriteUnit::new();
        for (name, fail) in [("a", false), ("b", true), ("c", false)] {
            unit.register_change(Box::new(Recorder {
                name,
                log: Arc::clone(&log),
                fail,
            }))
            .unwrap();
        }

        assert!(unit.rollback().is_err());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["rollback c", "rollback b", "rollback a"]
        );
    }

    #[test]
    fn commit_runs_hooks_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut unit = WriteUnit::new();
        for name in ["a", "b"] {
            unit.register_change(Box::new(Recorder {
                name,
                log: Arc::clone(&log),
                fail: false,
            }))
            .unwrap();
        }
        unit.commit().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["commit a", "commit b"]);
        assert!(unit.register_change(Box::new(Recorder {
            name: "late",
            log: Arc::clone(&log),
            fail: false,
        }))
        .is_err());
    }
}
