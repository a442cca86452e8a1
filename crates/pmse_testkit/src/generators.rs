//! Property-based test generators using proptest.
//!
//! Provides strategies for record ids, payloads, index keys and operation
//! sequences, plus reference models that replay those sequences in memory.

use pmse_core::{CoreError, CoreResult, PersistentMap, PersistentTree, RecordId, MAX_KEY_LEN};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Strategy for record ids drawn from a small range, so operations collide.
pub fn record_id_strategy(max: u64) -> impl Strategy<Value = RecordId> {
    (1..=max).prop_map(RecordId)
}

/// Strategy for record payloads, empty ones included.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..600)
}

/// Strategy for index keys within the tree's size limit.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        4 => prop::collection::vec(any::<u8>(), 1..24),
        1 => prop::collection::vec(any::<u8>(), 200..MAX_KEY_LEN),
    ]
}

/// Strategy for valid collection identifiers.
pub fn ident_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,31}").expect("Invalid regex")
}

/// A map operation.
#[derive(Debug, Clone)]
pub enum MapOp {
    /// Insert a record.
    Insert {
        /// Record id
        id: RecordId,
        /// Record payload
        payload: Vec<u8>,
    },
    /// Replace a record.
    Update {
        /// Record id
        id: RecordId,
        /// New payload
        payload: Vec<u8>,
    },
    /// Remove a record.
    Remove {
        /// Record id
        id: RecordId,
    },
}

/// Strategy for map operations over ids `1..=max_id`.
pub fn map_op_strategy(max_id: u64) -> impl Strategy<Value = MapOp> {
    prop_oneof![
        3 => (record_id_strategy(max_id), payload_strategy())
            .prop_map(|(id, payload)| MapOp::Insert { id, payload }),
        2 => (record_id_strategy(max_id), payload_strategy())
            .prop_map(|(id, payload)| MapOp::Update { id, payload }),
        1 => record_id_strategy(max_id).prop_map(|id| MapOp::Remove { id }),
    ]
}

/// An index operation.
#[derive(Debug, Clone)]
pub enum TreeOp {
    /// Add an entry.
    Insert {
        /// Index key
        key: Vec<u8>,
        /// Record id
        rid: RecordId,
    },
    /// Remove an entry.
    Remove {
        /// Index key
        key: Vec<u8>,
        /// Record id
        rid: RecordId,
    },
}

/// Strategy for tree operations on short keys and a few record ids.
pub fn tree_op_strategy() -> impl Strategy<Value = TreeOp> {
    let key = prop::collection::vec(0u8..8, 1..4);
    prop_oneof![
        3 => (key.clone(), record_id_strategy(4)).prop_map(|(key, rid)| TreeOp::Insert { key, rid }),
        1 => (key, record_id_strategy(4)).prop_map(|(key, rid)| TreeOp::Remove { key, rid }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy<S: Strategy>(
    op: S,
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<S::Value>> {
    prop::collection::vec(op, min_ops..max_ops)
}

/// Reference model of a record map: last writer wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapModel {
    /// Records by id.
    pub records: BTreeMap<RecordId, Vec<u8>>,
}

impl MapModel {
    /// Applies `op` to the model and to `map`, and checks both agree on
    /// the outcome.
    ///
    /// # Errors
    ///
    /// Returns the map's error if it differs from the model's expectation.
    pub fn apply(&mut self, map: &PersistentMap, op: &MapOp) -> CoreResult<()> {
        let (result, present) = match op {
            MapOp::Insert { id, payload } => {
                let present = self.records.contains_key(id);
                if !present {
                    self.records.insert(*id, payload.clone());
                }
                (map.insert(*id, payload), present)
            }
            MapOp::Update { id, payload } => {
                let present = self.records.contains_key(id);
                if present {
                    self.records.insert(*id, payload.clone());
                }
                (map.update(*id, payload), present)
            }
            MapOp::Remove { id } => (map.remove(*id), self.records.remove(id).is_some()),
        };

        match (op, result) {
            (MapOp::Insert { .. }, Err(CoreError::DuplicateKey { .. })) if present => Ok(()),
            (MapOp::Update { .. } | MapOp::Remove { .. }, Err(CoreError::NotFound { .. }))
                if !present =>
            {
                Ok(())
            }
            (MapOp::Insert { .. }, Ok(())) if !present => Ok(()),
            (MapOp::Update { .. } | MapOp::Remove { .. }, Ok(())) if present => Ok(()),
            (_, Err(err)) => Err(err),
            (op, Ok(())) => Err(CoreError::invalid_operation(format!(
                "{op:?} succeeded against the model"
            ))),
        }
    }
}

/// Reference model of a non-unique index: an ordered set of
/// `(key, rid)` pairs under bytewise order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeModel {
    /// Entries in scan order.
    pub entries: BTreeSet<(Vec<u8>, RecordId)>,
}

impl TreeModel {
    /// Applies `op` to the model and to `tree`.
    ///
    /// # Errors
    ///
    /// Returns the tree's error if it differs from the model's expectation.
    pub fn apply(&mut self, tree: &PersistentTree, op: &TreeOp) -> CoreResult<()> {
        match op {
            TreeOp::Insert { key, rid } => {
                // Re-adding a present pair is a no-op on both sides.
                self.entries.insert((key.clone(), *rid));
                tree.insert(key, *rid)
            }
            TreeOp::Remove { key, rid } => {
                let present = self.entries.remove(&(key.clone(), *rid));
                match tree.remove(key, *rid) {
                    Ok(()) if present => Ok(()),
                    Err(CoreError::NotFound { .. }) if !present => Ok(()),
                    Ok(()) => Err(CoreError::invalid_operation(format!(
                        "removed absent entry {key:?}/{rid}"
                    ))),
                    Err(err) => Err(err),
                }
            }
        }
    }
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
