//! Stress tests for pmse.
//!
//! These helpers hammer one collection pool from several threads and
//! report throughput. Map and tree operations on the same pool are expected
//! to run concurrently without losing or duplicating writes.

use pmse_core::{PoolHandle, RecordId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Size of record payloads in bytes.
    pub payload_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            payload_size: 128,
        }
    }
}

/// Inserts records with generated ids from every thread at once.
///
/// Returns the result and every id handed out.
pub fn concurrent_inserts(handle: &Arc<PoolHandle>, config: &StressConfig) -> (StressTestResult, Vec<RecordId>) {
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let workers: Vec<_> = (0..config.threads)
        .map(|t| {
            let handle = Arc::clone(handle);
            let failed = Arc::clone(&failed);
            let operations = config.operations;
            let payload = vec![t as u8; config.payload_size];
            thread::spawn(move || {
                let mut ids = Vec::with_capacity(operations);
                for _ in 0..operations {
                    match handle.map().insert_auto(&payload) {
                        Ok(id) => ids.push(id),
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                ids
            })
        })
        .collect();

    let mut ids = Vec::new();
    for worker in workers {
        ids.extend(worker.join().expect("stress worker panicked"));
    }
    let failed = failed.load(Ordering::Relaxed);
    (StressTestResult::new(ids.len(), failed, start.elapsed()), ids)
}

/// Inserts distinct index entries from every thread while one more thread
/// scans the index.
///
/// Every scan must observe keys in ascending order.
pub fn concurrent_index_writes(handle: &Arc<PoolHandle>, index: &str, config: &StressConfig) -> StressTestResult {
    let failed = Arc::new(AtomicUsize::new(0));
    let succeeded = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let comparator: Arc<dyn pmse_core::KeyComparator> = Arc::new(pmse_core::BytewiseComparator);

    let tree = match handle.tree(index, Arc::clone(&comparator)) {
        Ok(tree) => tree,
        Err(_) => return StressTestResult::new(0, 1, start.elapsed()),
    };

    let writers: Vec<_> = (0..config.threads)
        .map(|t| {
            let tree = Arc::clone(&tree);
            let failed = Arc::clone(&failed);
            let succeeded = Arc::clone(&succeeded);
            let operations = config.operations;
            thread::spawn(move || {
                for i in 0..operations {
                    let key = format!("{i:08}-{t:02}");
                    match tree.insert(key.as_bytes(), RecordId((t * operations + i) as u64)) {
                        Ok(()) => succeeded.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    let reader = {
        let tree = Arc::clone(&tree);
        let failed = Arc::clone(&failed);
        thread::spawn(move || {
            for _ in 0..20 {
                let mut previous: Option<Vec<u8>> = None;
                for item in tree.scan(
                    std::ops::Bound::Unbounded,
                    std::ops::Bound::Unbounded,
                    pmse_core::Direction::Forward,
                ) {
                    match item {
                        Ok((key, _)) => {
                            if previous.as_ref().is_some_and(|p| *p > key) {
                                failed.fetch_add(1, Ordering::Relaxed);
                            }
                            previous = Some(key);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }
        })
    };

    for writer in writers {
        writer.join().expect("stress writer panicked");
    }
    reader.join().expect("stress reader panicked");

    StressTestResult::new(
        succeeded.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}
