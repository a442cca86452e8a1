//! Benchmark utilities.

use pmse_core::{BytewiseComparator, PoolHandle, RecordId, MIN_POOL_SIZE};
use pmse_storage::InMemoryBackend;
use rand::Rng;
use std::sync::Arc;

/// Ident of the index tree created by [`memory_collection`].
pub const INDEX: &str = "bench-index";

/// Generate random payload bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` index keys of `len` random printable bytes.
pub fn random_keys(count: usize, len: usize) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect())
        .collect()
}

/// An in-memory collection pool of `capacity` bytes with one bytewise index.
///
/// # Panics
///
/// Panics if the pool cannot be created.
pub fn memory_collection(capacity: u64, buckets: u32) -> PoolHandle {
    let handle = PoolHandle::create_in(
        Box::new(InMemoryBackend::new()),
        "bench",
        capacity.max(MIN_POOL_SIZE),
        buckets,
    )
    .expect("create bench pool");
    handle
        .create_tree(INDEX, false, Arc::new(BytewiseComparator))
        .expect("create bench index");
    handle
}

/// Fills the collection's map with `count` records of `size` bytes.
///
/// # Panics
///
/// Panics if an insert fails.
pub fn fill_map(handle: &PoolHandle, count: usize, size: usize) -> Vec<RecordId> {
    let payload = random_data(size);
    (0..count)
        .map(|_| handle.map().insert_auto(&payload).expect("fill map"))
        .collect()
}
