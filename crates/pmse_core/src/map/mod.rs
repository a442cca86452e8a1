//! Persistent transactional map backing a record store.
//!
//! The map is a fixed-size hash table of singly linked entry chains. Every
//! mutation is one pool transaction; updates are copy-on-write, so the old
//! payload's block is only reclaimed once the new one is committed.

mod iter;
pub(crate) mod layout;

pub use iter::MapIter;

use crate::error::{CoreError, CoreResult};
use crate::pool::{BlockKind, Pool, PoolRead, Transaction};
use crate::types::{PoolOffset, RecordId};
use layout::{EntryHead, MapHeader, COUNTERS_AT};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default number of hash buckets of a new map.
pub const DEFAULT_BUCKETS: u32 = 1024;

/// Where the pointer to an entry lives.
#[derive(Debug, Clone, Copy)]
enum Link {
    Bucket(u32),
    Entry(PoolOffset),
}

#[derive(Debug, Clone, Copy)]
struct Located {
    link: Link,
    at: PoolOffset,
    head: EntryHead,
}

/// A persistent map from [`RecordId`] to payload bytes.
///
/// Record count, data size and the next-id generator are cached in memory
/// and written back by [`store_counters`](Self::store_counters).
pub struct PersistentMap {
    pool: Arc<Pool>,
    header_at: PoolOffset,
    header: MapHeader,
    next_id: AtomicU64,
    len: AtomicU64,
    data_size: AtomicU64,
}

impl std::fmt::Debug for PersistentMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentMap")
            .field("header", &self.header_at)
            .field("buckets", &self.header.bucket_count)
            .field("len", &self.len())
            .finish()
    }
}

impl PersistentMap {
    /// Builds an empty map inside `tx` and returns its header offset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for zero buckets, or `AllocationError`.
    pub fn create_in(tx: &mut Transaction<'_>, buckets: u32) -> CoreResult<PoolOffset> {
        if buckets == 0 {
            return Err(CoreError::invalid_operation("a map needs at least one bucket"));
        }
        let array = tx.alloc(BlockKind::MapBuckets, &vec![0u8; buckets as usize * 8])?;
        let header = MapHeader {
            bucket_count: buckets,
            buckets: array,
            next_id: 1,
            len: 0,
            data_size: 0,
        };
        tx.alloc(BlockKind::MapHeader, &header.encode())
    }

    /// Attaches to the map whose header lives at `header_at`.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the header or bucket array is invalid.
    pub fn attach(pool: Arc<Pool>, header_at: PoolOffset) -> CoreResult<Self> {
        let header = pool.read(|snap| {
            let header = MapHeader::read(snap, header_at)?;
            layout::check_buckets(snap, &header)?;
            Ok(header)
        })?;

        Ok(Self {
            pool,
            header_at,
            header,
            next_id: AtomicU64::new(header.next_id.max(1)),
            len: AtomicU64::new(header.len),
            data_size: AtomicU64::new(header.data_size),
        })
    }

    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if `id` is present, or `AllocationError`.
    pub fn insert(&self, id: RecordId, payload: &[u8]) -> CoreResult<()> {
        self.pool.transaction(|tx| self.insert_in(tx, id, payload))?;
        self.note_insert(id, payload.len());
        Ok(())
    }

    /// Inserts a record under the next generated id and returns the id.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if the pool is full.
    pub fn insert_auto(&self, payload: &[u8]) -> CoreResult<RecordId> {
        let id = self.pool.transaction(|tx| {
            let id = RecordId::new(self.next_id.load(Ordering::Acquire));
            self.insert_in(tx, id, payload)?;
            Ok(id)
        })?;
        self.note_insert(id, payload.len());
        Ok(id)
    }

    fn insert_in(&self, tx: &mut Transaction<'_>, id: RecordId, payload: &[u8]) -> CoreResult<()> {
        if self.locate(tx, id)?.is_some() {
            return Err(CoreError::duplicate_key(id.to_string()));
        }
        let bucket = layout::bucket_of(id, self.header.bucket_count);
        let head = layout::read_bucket(tx, &self.header, bucket)?;
        let entry = tx.alloc(BlockKind::MapEntry, &layout::encode_entry(head, id, payload)?)?;
        self.relink(tx, Link::Bucket(bucket), entry)?;
        // Bumped under the pool lock. A failed commit leaves a gap.
        self.next_id
            .fetch_max(id.as_u64().saturating_add(1), Ordering::AcqRel);
        Ok(())
    }

    fn note_insert(&self, id: RecordId, size: usize) {
        self.len.fetch_add(1, Ordering::AcqRel);
        self.data_size.fetch_add(size as u64, Ordering::AcqRel);
        self.next_id
            .fetch_max(id.as_u64().saturating_add(1), Ordering::AcqRel);
    }

    /// Replaces the payload of an existing record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is absent, or `AllocationError`.
    pub fn update(&self, id: RecordId, payload: &[u8]) -> CoreResult<()> {
        let old_len = self.pool.transaction(|tx| {
            let found = self.locate(tx, id)?.ok_or_else(|| not_found(id))?;
            let entry = tx.alloc(
                BlockKind::MapEntry,
                &layout::encode_entry(found.head.next, id, payload)?,
            )?;
            self.relink(tx, found.link, entry)?;
            tx.free(found.at, BlockKind::MapEntry)?;
            Ok(u64::from(found.head.len))
        })?;

        self.data_size.fetch_add(payload.len() as u64, Ordering::AcqRel);
        self.data_size.fetch_sub(old_len, Ordering::AcqRel);
        Ok(())
    }

    /// Removes a record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `id` is absent.
    pub fn remove(&self, id: RecordId) -> CoreResult<()> {
        let old_len = self.pool.transaction(|tx| {
            let found = self.locate(tx, id)?.ok_or_else(|| not_found(id))?;
            self.relink(tx, found.link, found.head.next)?;
            tx.free(found.at, BlockKind::MapEntry)?;
            Ok(u64::from(found.head.len))
        })?;

        self.len.fetch_sub(1, Ordering::AcqRel);
        self.data_size.fetch_sub(old_len, Ordering::AcqRel);
        Ok(())
    }

    /// Returns the payload of a record, if present.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the chain is damaged.
    pub fn get(&self, id: RecordId) -> CoreResult<Option<Vec<u8>>> {
        self.pool.read(|snap| match self.locate(snap, id)? {
            Some(found) => Ok(Some(layout::read_payload(snap, found.at, &found.head)?)),
            None => Ok(None),
        })
    }

    /// Returns true if a record with `id` exists.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the chain is damaged.
    pub fn contains(&self, id: RecordId) -> CoreResult<bool> {
        self.pool.read(|snap| Ok(self.locate(snap, id)?.is_some()))
    }

    /// Removes every record in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if the redo log cannot hold the change.
    pub fn truncate(&self) -> CoreResult<()> {
        let next_id = self.next_id.load(Ordering::Acquire);
        self.pool.transaction(|tx| {
            let limit = layout::chain_limit(tx);
            for bucket in 0..self.header.bucket_count {
                let mut at = layout::read_bucket(tx, &self.header, bucket)?;
                let mut steps = 0;
                while !at.is_null() {
                    steps += 1;
                    if steps > limit {
                        return Err(cycle(bucket));
                    }
                    let head = layout::read_entry_head(tx, at)?;
                    tx.free(at, BlockKind::MapEntry)?;
                    at = head.next;
                }
            }
            let zeros = vec![0u8; self.header.bucket_count as usize * 8];
            tx.write(self.header.buckets, BlockKind::MapBuckets, 0, &zeros)?;
            tx.write(
                self.header_at,
                BlockKind::MapHeader,
                COUNTERS_AT,
                &layout::encode_counters(next_id, 0, 0),
            )
        })?;

        self.len.store(0, Ordering::Release);
        self.data_size.store(0, Ordering::Release);
        Ok(())
    }

    /// Writes the cached counters back to the map header.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub fn store_counters(&self) -> CoreResult<()> {
        let counters = layout::encode_counters(
            self.next_id.load(Ordering::Acquire),
            self.len(),
            self.data_size(),
        );
        self.pool.transaction(|tx| {
            tx.write(self.header_at, BlockKind::MapHeader, COUNTERS_AT, &counters)
        })
    }

    /// Returns a lazy iterator over all records.
    ///
    /// Each call starts a fresh pass. Order is by bucket, then chain.
    #[must_use]
    pub fn iter(&self) -> MapIter<'_> {
        MapIter::new(self)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    /// Returns true if the map has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload bytes stored.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Acquire)
    }

    /// The id [`insert_auto`](Self::insert_auto) hands out next.
    #[must_use]
    pub fn next_id(&self) -> RecordId {
        RecordId::new(self.next_id.load(Ordering::Acquire))
    }

    /// Number of hash buckets.
    #[must_use]
    pub fn bucket_count(&self) -> u32 {
        self.header.bucket_count
    }

    /// Offset of the map header inside its pool.
    #[must_use]
    pub fn header_offset(&self) -> PoolOffset {
        self.header_at
    }

    /// The pool holding this map.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub(crate) fn header(&self) -> &MapHeader {
        &self.header
    }

    fn locate<R: PoolRead + ?Sized>(&self, r: &R, id: RecordId) -> CoreResult<Option<Located>> {
        let bucket = layout::bucket_of(id, self.header.bucket_count);
        let limit = layout::chain_limit(r);
        let mut link = Link::Bucket(bucket);
        let mut at = layout::read_bucket(r, &self.header, bucket)?;
        let mut steps = 0;

        while !at.is_null() {
            steps += 1;
            if steps > limit {
                return Err(cycle(bucket));
            }
            let head = layout::read_entry_head(r, at)?;
            if head.id == id {
                return Ok(Some(Located { link, at, head }));
            }
            link = Link::Entry(at);
            at = head.next;
        }
        Ok(None)
    }

    fn relink(&self, tx: &mut Transaction<'_>, link: Link, target: PoolOffset) -> CoreResult<()> {
        let bytes = target.as_u64().to_le_bytes();
        match link {
            Link::Bucket(bucket) => tx.write(
                self.header.buckets,
                BlockKind::MapBuckets,
                u64::from(bucket) * 8,
                &bytes,
            ),
            Link::Entry(entry) => tx.write(entry, BlockKind::MapEntry, 0, &bytes),
        }
    }
}

fn not_found(id: RecordId) -> CoreError {
    CoreError::not_found(format!("record {id}"))
}

fn cycle(bucket: u32) -> CoreError {
    CoreError::structural(format!("map bucket {bucket} chain does not terminate"))
}
