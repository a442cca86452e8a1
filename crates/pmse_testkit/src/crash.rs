//! Crash injection for pools.
//!
//! [`CrashableBackend`] wraps an [`InMemoryBackend`] and stops accepting
//! writes after a byte budget, optionally tearing the write that crosses
//! it. Everything written before the crash stays on the shared media, so
//! reopening a pool on [`CrashableBackend::media`] shows exactly what a
//! process killed at that point would leave behind.
//!
//! [`CrashHarness`] drives one operation through every crash point and
//! checks the atomicity law: after reopening, the observed state is either
//! the state before the operation or the state after it, and an operation
//! that reported success is never lost.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pmse_testkit::crash::CrashHarness;
//!
//! let sweep = CrashHarness::new()
//!     .run(
//!         |handle| { handle.map().insert_auto(b"seed")?; Ok(()) },
//!         |handle| { handle.map().insert_auto(b"next")?; Ok(()) },
//!         |handle| map_contents(handle),
//!     )
//!     .unwrap();
//! sweep.assert_atomic();
//! ```

use pmse_core::{
    repair_pool, Config, CoreResult, Pool, PoolHandle, RepairReport, COLLECTION_LAYOUT,
    MIN_POOL_SIZE,
};
use pmse_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const IDENT: &str = "crash-target";

#[derive(Debug, Default)]
struct CrashState {
    crash_after_bytes: AtomicU64,
    bytes_written: AtomicU64,
    crashed: AtomicBool,
    fail_on_sync: AtomicBool,
    torn_writes: AtomicBool,
}

/// A storage backend that can simulate a process crash.
///
/// Clones share both the media and the crash state, so a test can hand one
/// clone to a pool and keep another to arm the crash.
#[derive(Debug, Clone)]
pub struct CrashableBackend {
    media: InMemoryBackend,
    state: Arc<CrashState>,
}

impl CrashableBackend {
    /// Creates an empty backend that never crashes until armed.
    pub fn new() -> Self {
        Self::over(InMemoryBackend::new())
    }

    /// Wraps existing media.
    pub fn over(media: InMemoryBackend) -> Self {
        let state = CrashState {
            crash_after_bytes: AtomicU64::new(u64::MAX),
            ..CrashState::default()
        };
        Self {
            media,
            state: Arc::new(state),
        }
    }

    /// Crashes once `bytes` more bytes have been written.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.bytes_written();
        self.state
            .crash_after_bytes
            .store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Makes the next `sync` crash.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.state.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Whether the write crossing the budget lands partially.
    pub fn set_torn_writes(&self, torn: bool) {
        self.state.torn_writes.store(torn, Ordering::SeqCst);
    }

    /// Total bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.state.bytes_written.load(Ordering::SeqCst)
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// A copy of the bytes that reached media, detached from the crash
    /// state.
    pub fn media(&self) -> InMemoryBackend {
        self.media.snapshot()
    }

    fn crash(&self, what: &str) -> StorageError {
        self.state.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::other(format!("simulated crash during {what}")))
    }
}

impl Default for CrashableBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.media.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(self.crash("write"));
        }

        let len = data.len() as u64;
        let current = self.state.bytes_written.fetch_add(len, Ordering::SeqCst);
        let threshold = self.state.crash_after_bytes.load(Ordering::SeqCst);

        if current.saturating_add(len) > threshold {
            if self.state.torn_writes.load(Ordering::SeqCst) {
                let partial = threshold.saturating_sub(current) as usize;
                if partial > 0 {
                    let _ = self.media.write_at(offset, &data[..partial]);
                }
            }
            return Err(self.crash("write"));
        }

        self.media.write_at(offset, data)
    }

    fn len(&self) -> StorageResult<u64> {
        self.media.len()
    }

    fn set_len(&mut self, new_len: u64) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(self.crash("resize"));
        }
        self.media.set_len(new_len)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(self.crash("flush"));
        }
        self.media.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.has_crashed() || self.state.fail_on_sync.load(Ordering::SeqCst) {
            return Err(self.crash("sync"));
        }
        self.media.sync()
    }
}

/// How one crash point turned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashOutcome {
    /// The reopened pool shows the state before the operation.
    RolledBack,
    /// The reopened pool shows the state after the operation.
    Committed,
    /// The reopened pool shows neither; holds a description.
    Violation(String),
}

/// Outcomes of a full crash sweep.
#[derive(Debug, Clone, Default)]
pub struct CrashSweep {
    /// Bytes the operation writes when nothing crashes.
    pub bytes_per_operation: u64,
    /// `(crash point, outcome)` for every point tried.
    pub outcomes: Vec<(u64, CrashOutcome)>,
}

impl CrashSweep {
    /// Crash points that rolled back.
    pub fn rolled_back(&self) -> usize {
        self.count(|o| *o == CrashOutcome::RolledBack)
    }

    /// Crash points that committed.
    pub fn committed(&self) -> usize {
        self.count(|o| *o == CrashOutcome::Committed)
    }

    /// Descriptions of every violation.
    pub fn violations(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter_map(|(at, o)| match o {
                CrashOutcome::Violation(msg) => Some(format!("crash after {at} bytes: {msg}")),
                _ => None,
            })
            .collect()
    }

    /// Panics with every violation if the sweep found any.
    pub fn assert_atomic(&self) {
        let violations = self.violations();
        assert!(
            violations.is_empty(),
            "{} of {} crash points broke atomicity:\n{}",
            violations.len(),
            self.outcomes.len(),
            violations.join("\n")
        );
    }

    fn count(&self, f: impl Fn(&CrashOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| f(o)).count()
    }
}

/// Runs an operation against a collection pool once per crash point.
#[derive(Debug, Clone)]
pub struct CrashHarness {
    capacity: u64,
    buckets: u32,
    stride: u64,
    torn_writes: bool,
    repair: bool,
}

impl Default for CrashHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashHarness {
    /// A harness over minimum-size pools with 16 buckets, trying every
    /// byte offset.
    pub fn new() -> Self {
        Self {
            capacity: MIN_POOL_SIZE,
            buckets: 16,
            stride: 1,
            torn_writes: true,
            repair: true,
        }
    }

    /// Tries every `stride`-th crash point instead of every one.
    #[must_use]
    pub fn stride(mut self, stride: u64) -> Self {
        self.stride = stride.max(1);
        self
    }

    /// Sets the map bucket count of the pool under test.
    #[must_use]
    pub fn buckets(mut self, buckets: u32) -> Self {
        self.buckets = buckets;
        self
    }

    /// Whether the write crossing the crash point lands partially.
    #[must_use]
    pub fn torn_writes(mut self, torn: bool) -> Self {
        self.torn_writes = torn;
        self
    }

    /// Whether to run a repair pass after each reopen and require it to
    /// find nothing.
    #[must_use]
    pub fn repair(mut self, repair: bool) -> Self {
        self.repair = repair;
        self
    }

    /// Creates a pool on fresh crashable media and runs `setup` on it.
    ///
    /// # Errors
    ///
    /// Returns any pool creation or `setup` failure.
    pub fn prepare<S>(&self, setup: &S) -> CoreResult<(CrashableBackend, PoolHandle)>
    where
        S: Fn(&PoolHandle) -> CoreResult<()>,
    {
        let backend = CrashableBackend::new();
        backend.set_torn_writes(self.torn_writes);
        let handle = PoolHandle::create_in(Box::new(backend.clone()), IDENT, self.capacity, self.buckets)?;
        setup(&handle)?;
        Ok((backend, handle))
    }

    /// Reopens whatever reached media, as a restarted process would.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be opened.
    pub fn reopen(backend: &CrashableBackend) -> CoreResult<PoolHandle> {
        let pool = Pool::open_in(Box::new(backend.media()), COLLECTION_LAYOUT)?;
        PoolHandle::attach(IDENT, Arc::new(pool))
    }

    /// Sweeps `op` through every crash point.
    ///
    /// `observe` must capture the logical state that `op` changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the uncrashed reference run fails.
    pub fn run<S, O, V, T>(&self, setup: S, op: O, observe: V) -> CoreResult<CrashSweep>
    where
        S: Fn(&PoolHandle) -> CoreResult<()>,
        O: Fn(&PoolHandle) -> CoreResult<()>,
        V: Fn(&PoolHandle) -> CoreResult<T>,
        T: PartialEq + Debug,
    {
        let (backend, handle) = self.prepare(&setup)?;
        let before = observe(&handle)?;
        let start = backend.bytes_written();
        op(&handle)?;
        let after = observe(&handle)?;
        let total = backend.bytes_written() - start;
        drop(handle);

        let mut sweep = CrashSweep {
            bytes_per_operation: total,
            outcomes: Vec::new(),
        };

        let mut at = 0;
        while at < total {
            let outcome = self.crash_once(at, &setup, &op, &observe, &before, &after);
            sweep.outcomes.push((at, outcome));
            at += self.stride;
        }
        tracing::debug!(
            total,
            points = sweep.outcomes.len(),
            rolled_back = sweep.rolled_back(),
            committed = sweep.committed(),
            "crash sweep finished"
        );
        Ok(sweep)
    }

    fn crash_once<S, O, V, T>(
        &self,
        at: u64,
        setup: &S,
        op: &O,
        observe: &V,
        before: &T,
        after: &T,
    ) -> CrashOutcome
    where
        S: Fn(&PoolHandle) -> CoreResult<()>,
        O: Fn(&PoolHandle) -> CoreResult<()>,
        V: Fn(&PoolHandle) -> CoreResult<T>,
        T: PartialEq + Debug,
    {
        let (backend, handle) = match self.prepare(setup) {
            Ok(prepared) => prepared,
            Err(err) => return CrashOutcome::Violation(format!("setup failed: {err}")),
        };
        backend.crash_after(at);
        let reported = op(&handle);
        drop(handle);

        let reopened = match Self::reopen(&backend) {
            Ok(reopened) => reopened,
            Err(err) => return CrashOutcome::Violation(format!("reopen failed: {err}")),
        };
        let state = match observe(&reopened) {
            Ok(state) => state,
            Err(err) => return CrashOutcome::Violation(format!("observe failed: {err}")),
        };

        let outcome = if state == *after {
            CrashOutcome::Committed
        } else if state == *before && reported.is_err() {
            CrashOutcome::RolledBack
        } else if state == *before {
            return CrashOutcome::Violation("operation reported success but was lost".into());
        } else {
            return CrashOutcome::Violation(format!("torn state {state:?}"));
        };

        if self.repair {
            match repair_pool(reopened.pool(), &Config::default()) {
                Ok(report) if report.is_clean() => {}
                Ok(report) => return CrashOutcome::Violation(format!("repair was needed: {report}")),
                Err(err) => return CrashOutcome::Violation(format!("repair failed: {err}")),
            }
        }
        outcome
    }
}

/// Runs `repair_pool` twice and returns both reports.
///
/// # Errors
///
/// Returns the first repair failure.
pub fn repair_twice(pool: &Pool) -> CoreResult<(RepairReport, RepairReport)> {
    let config = Config::default();
    let first = repair_pool(pool, &config)?;
    let second = repair_pool(pool, &config)?;
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{map_contents, tree_contents, INDEX};
    use pmse_core::{BytewiseComparator, CoreError, RecordId};

    #[test]
    fn crashable_backend_stops_at_budget() {
        let mut backend = CrashableBackend::new();
        backend.set_len(16).unwrap();
        backend.crash_after(4);
        backend.set_torn_writes(true);

        assert!(backend.write_at(0, b"abcdef").is_err());
        assert!(backend.has_crashed());
        assert!(backend.write_at(8, b"x").is_err());
        assert!(backend.sync().is_err());
        assert_eq!(&backend.media().read_at(0, 6).unwrap(), b"abcd\0\0");
    }

    #[test]
    fn clean_writes_pass_through() {
        let mut backend = CrashableBackend::new();
        backend.set_len(8).unwrap();
        backend.write_at(2, b"ok").unwrap();
        backend.sync().unwrap();
        assert_eq!(backend.bytes_written(), 2);
        assert!(!backend.has_crashed());
    }

    #[test]
    fn failed_sync_crashes() {
        let mut backend = CrashableBackend::new();
        backend.set_fail_on_sync(true);
        assert!(backend.sync().is_err());
        assert!(backend.has_crashed());
    }

    #[test]
    fn map_insert_is_atomic() {
        let sweep = CrashHarness::new()
            .stride(7)
            .run(
                |handle| handle.map().insert(RecordId(1), b"seed"),
                |handle| handle.map().insert(RecordId(2), &[7u8; 300]),
                map_contents,
            )
            .unwrap();
        sweep.assert_atomic();
        assert!(sweep.rolled_back() > 0);
        assert!(sweep.committed() > 0);
    }

    #[test]
    fn map_update_and_remove_are_atomic() {
        let setup = |handle: &PoolHandle| {
            for i in 1..=20u64 {
                handle.map().insert(RecordId(i), &i.to_le_bytes())?;
            }
            Ok(())
        };
        CrashHarness::new()
            .stride(5)
            .run(setup, |h| h.map().update(RecordId(3), &[1u8; 500]), map_contents)
            .unwrap()
            .assert_atomic();
        CrashHarness::new()
            .stride(5)
            .run(setup, |h| h.map().remove(RecordId(4)), map_contents)
            .unwrap()
            .assert_atomic();
    }

    #[test]
    fn tree_split_is_atomic() {
        let setup = |handle: &PoolHandle| {
            let tree = handle.create_tree(INDEX, false, Arc::new(BytewiseComparator))?;
            for i in 0..150u32 {
                tree.insert(format!("key-{i:05}").as_bytes(), RecordId(u64::from(i)))?;
            }
            Ok(())
        };
        // A long key forces a leaf split.
        let sweep = CrashHarness::new()
            .stride(13)
            .run(
                setup,
                |h| h.tree(INDEX, Arc::new(BytewiseComparator))?.insert(&[b'z'; 900], RecordId(9)),
                tree_contents,
            )
            .unwrap();
        sweep.assert_atomic();
        assert!(sweep.committed() > 0);
    }

    #[test]
    fn failed_operation_leaves_no_trace() {
        let backend = CrashableBackend::new();
        let handle = PoolHandle::create_in(Box::new(backend.clone()), IDENT, MIN_POOL_SIZE, 8).unwrap();
        handle.map().insert(RecordId(1), b"kept").unwrap();

        backend.set_fail_on_sync(true);
        let err = handle.map().insert(RecordId(2), b"lost").unwrap_err();
        assert!(err.is_retryable(), "{err}");
        assert!(matches!(
            handle.map().insert(RecordId(3), b"poisoned"),
            Err(CoreError::WriteFailed { .. })
        ));
        drop(handle);

        let reopened = CrashHarness::reopen(&backend).unwrap();
        assert_eq!(reopened.map().get(RecordId(1)).unwrap().as_deref(), Some(&b"kept"[..]));
        assert!(reopened.map().get(RecordId(3)).unwrap().is_none());
    }

    #[test]
    fn repair_is_idempotent_after_crash() {
        let harness = CrashHarness::new();
        let (backend, handle) = harness
            .prepare(&|h: &PoolHandle| {
                for i in 1..=50u64 {
                    h.map().insert(RecordId(i), &[i as u8; 40])?;
                }
                Ok(())
            })
            .unwrap();
        backend.crash_after(100);
        let _ = handle.map().insert(RecordId(99), &[0u8; 1000]);
        drop(handle);

        let reopened = CrashHarness::reopen(&backend).unwrap();
        let (first, second) = repair_twice(reopened.pool()).unwrap();
        assert_eq!(first.entries, 50);
        assert_eq!(second.entries, first.entries);
        assert!(second.is_clean());
    }
}
