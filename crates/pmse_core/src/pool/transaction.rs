//! Transactions and read snapshots over one pool.

use super::alloc::Allocator;
use super::header::{
    BlockHeader, BlockKind, BlockState, Geometry, Superblock, BLOCK_ALIGN, BLOCK_HEADER_SIZE,
};
use super::log::{self, LOG_HEADER_SIZE};
use crate::error::{CoreError, CoreResult};
use crate::types::{PoolOffset, TransactionId};
use pmse_storage::StorageBackend;

/// Live state of an open pool, guarded by the pool's lock.
pub(crate) struct PoolState {
    pub(crate) backend: Box<dyn StorageBackend>,
    pub(crate) geometry: Geometry,
    pub(crate) superblock: Superblock,
    pub(crate) allocator: Allocator,
    pub(crate) last_txid: TransactionId,
    pub(crate) committed: u64,
    /// Set when a commit failed midway; media may disagree with memory
    /// until the pool is reopened and the log replayed.
    pub(crate) poisoned: bool,
}

impl PoolState {
    pub(crate) fn new(
        backend: Box<dyn StorageBackend>,
        geometry: Geometry,
        superblock: Superblock,
    ) -> Self {
        Self {
            backend,
            geometry,
            superblock,
            allocator: Allocator::new(superblock.heap_end, geometry.capacity),
            last_txid: TransactionId::default(),
            committed: 0,
            poisoned: false,
        }
    }

    /// Brings a pool back to its last committed state and rebuilds the
    /// volatile allocator.
    pub(crate) fn recover(
        mut backend: Box<dyn StorageBackend>,
        geometry: Geometry,
    ) -> CoreResult<Self> {
        let mut last_txid = TransactionId::default();
        match log::read_batch(&*backend, &geometry)? {
            Some(batch) => {
                tracing::info!(
                    txid = %batch.txid,
                    records = batch.records.len(),
                    "replaying committed redo log"
                );
                for (offset, data) in &batch.records {
                    backend.write_at(*offset, data)?;
                }
                backend.sync()?;
                clear_log(&mut *backend, &geometry)?;
                last_txid = batch.txid;
            }
            None => {
                let header = backend.read_at(geometry.log_offset, LOG_HEADER_SIZE as usize)?;
                if header.iter().any(|&b| b != 0) {
                    clear_log(&mut *backend, &geometry)?;
                }
            }
        }

        let raw = backend.read_at(geometry.heap_offset, 24)?;
        let superblock = Superblock::decode(&raw)?;
        if superblock.heap_end < geometry.first_block() || superblock.heap_end > geometry.capacity
        {
            return Err(CoreError::corrupt_pool(format!(
                "heap end {:#x} outside the heap",
                superblock.heap_end
            )));
        }

        let mut state = Self::new(backend, geometry, superblock);
        state.last_txid = last_txid;

        let blocks = Snapshot::new(&state)
            .walk_blocks()
            .map_err(|e| CoreError::corrupt_pool(format!("heap walk failed: {e}")))?;
        for (payload, header) in &blocks {
            state
                .allocator
                .observe(payload.as_u64() - BLOCK_HEADER_SIZE, header);
        }

        Ok(state)
    }
}

fn clear_log(backend: &mut dyn StorageBackend, geometry: &Geometry) -> CoreResult<()> {
    backend.write_at(geometry.log_offset, &[0u8; LOG_HEADER_SIZE as usize])?;
    backend.sync()?;
    Ok(())
}

/// Read access to the committed (or, inside a transaction, pending) state
/// of a pool.
pub trait PoolRead {
    /// Reads raw bytes at an absolute pool offset.
    fn read_bytes(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>>;

    /// Region layout of the pool.
    fn geometry(&self) -> &Geometry;

    /// First byte past the last carved block.
    fn heap_end(&self) -> u64;

    /// The pool's root object, or [`PoolOffset::NULL`] if none was set.
    fn root(&self) -> PoolOffset;

    /// Reads and validates the header of the block owning `payload`.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if `payload` does not address a block
    /// payload inside the heap.
    fn block_header(&self, payload: PoolOffset) -> CoreResult<BlockHeader> {
        let offset = payload.as_u64();
        if offset % BLOCK_ALIGN != 0
            || offset < self.geometry().first_block() + BLOCK_HEADER_SIZE
            || offset >= self.heap_end()
        {
            return Err(CoreError::structural(format!(
                "object offset {payload} is outside the heap"
            )));
        }

        let block = offset - BLOCK_HEADER_SIZE;
        let raw = self.read_bytes(block, BLOCK_HEADER_SIZE as usize)?;
        let header = BlockHeader::decode(block, &raw)?;
        if block + header.span() > self.heap_end() {
            return Err(CoreError::structural(format!(
                "block at {block:#x} runs past the heap end"
            )));
        }
        Ok(header)
    }

    /// Validates that `payload` is a live object of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the block is free or of another kind.
    fn object_header(&self, payload: PoolOffset, kind: BlockKind) -> CoreResult<BlockHeader> {
        let header = self.block_header(payload)?;
        if header.state != BlockState::Allocated {
            return Err(CoreError::structural(format!(
                "{kind:?} at {payload} points into a free block"
            )));
        }
        if header.kind != kind {
            return Err(CoreError::structural(format!(
                "expected {kind:?} at {payload}, found {:?}",
                header.kind
            )));
        }
        Ok(header)
    }

    /// Reads the whole payload of a live object.
    ///
    /// # Errors
    ///
    /// Same as [`object_header`](Self::object_header).
    fn object(&self, payload: PoolOffset, kind: BlockKind) -> CoreResult<Vec<u8>> {
        let header = self.object_header(payload, kind)?;
        self.read_bytes(payload.as_u64(), header.capacity as usize)
    }

    /// Lists every block in the heap as (payload offset, header).
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` on the first unreadable block header.
    fn walk_blocks(&self) -> CoreResult<Vec<(PoolOffset, BlockHeader)>> {
        let end = self.heap_end();
        let mut at = self.geometry().first_block();
        let mut blocks = Vec::new();
        while at < end {
            let raw = self.read_bytes(at, BLOCK_HEADER_SIZE as usize)?;
            let header = BlockHeader::decode(at, &raw)?;
            if at + header.span() > end {
                return Err(CoreError::structural(format!(
                    "block at {at:#x} runs past the heap end"
                )));
            }
            blocks.push((PoolOffset::new(at + BLOCK_HEADER_SIZE), header));
            at += header.span();
        }
        Ok(blocks)
    }
}

/// A read-only view of the committed state of a pool.
pub struct Snapshot<'a> {
    state: &'a PoolState,
}

impl<'a> Snapshot<'a> {
    pub(crate) fn new(state: &'a PoolState) -> Self {
        Self { state }
    }
}

impl PoolRead for Snapshot<'_> {
    fn read_bytes(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        Ok(self.state.backend.read_at(offset, len)?)
    }

    fn geometry(&self) -> &Geometry {
        &self.state.geometry
    }

    fn heap_end(&self) -> u64 {
        self.state.superblock.heap_end
    }

    fn root(&self) -> PoolOffset {
        self.state.superblock.root
    }
}

/// An atomic unit of change to one pool.
///
/// Nothing a transaction does is visible on media as committed state until
/// [`Pool::transaction`](super::Pool::transaction) commits it. Objects
/// allocated inside the transaction are written in place, since their blocks
/// stay free if the transaction never commits. Every other write is buffered
/// and goes through the redo log at commit. Freed blocks only become
/// reusable after commit.
pub struct Transaction<'a> {
    state: &'a mut PoolState,
    txid: TransactionId,
    allocator: Allocator,
    superblock: Superblock,
    writes: Vec<(u64, Vec<u8>)>,
    fresh: Vec<(u64, u64)>,
    pending_free: Vec<(u64, u32)>,
    direct: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(state: &'a mut PoolState) -> Self {
        let txid = state.last_txid.next();
        let allocator = state.allocator.clone();
        let superblock = state.superblock;
        Self {
            state,
            txid,
            allocator,
            superblock,
            writes: Vec::new(),
            fresh: Vec::new(),
            pending_free: Vec::new(),
            direct: false,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.txid
    }

    /// Allocates a new object holding `data` and returns its payload offset.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if the pool has no room left.
    pub fn alloc(&mut self, kind: BlockKind, data: &[u8]) -> CoreResult<PoolOffset> {
        let placement = self.allocator.allocate(data.len())?;

        let header = BlockHeader {
            capacity: placement.capacity,
            state: BlockState::Allocated,
            kind,
        };
        self.buffer(placement.block, header.encode().to_vec());

        if let Some((rest, capacity)) = placement.remainder {
            let free = BlockHeader {
                capacity,
                state: BlockState::Free,
                kind: BlockKind::Raw,
            };
            self.buffer(rest, free.encode().to_vec());
        }

        let payload = placement.block + BLOCK_HEADER_SIZE;
        self.fresh
            .push((payload, payload + u64::from(placement.capacity)));
        if !data.is_empty() {
            self.write_bytes(payload, data)?;
        }
        Ok(PoolOffset::new(payload))
    }

    /// Writes `data` at byte `at` of a live object's payload.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the object is not live or of a
    /// different kind, and `InvalidOperation` if the write overruns it.
    pub fn write(
        &mut self,
        payload: PoolOffset,
        kind: BlockKind,
        at: u64,
        data: &[u8],
    ) -> CoreResult<()> {
        let header = self.object_header(payload, kind)?;
        if at + data.len() as u64 > u64::from(header.capacity) {
            return Err(CoreError::invalid_operation(format!(
                "write of {} bytes at +{at} overruns {kind:?} at {payload} ({} bytes)",
                data.len(),
                header.capacity
            )));
        }
        self.write_bytes(payload.as_u64() + at, data)
    }

    /// Frees a live object. Its block becomes reusable once this
    /// transaction commits.
    ///
    /// # Errors
    ///
    /// Returns `StructuralCorruption` if the object is not live or of a
    /// different kind.
    pub fn free(&mut self, payload: PoolOffset, kind: BlockKind) -> CoreResult<()> {
        let header = self.object_header(payload, kind)?;
        self.free_block(payload, header);
        Ok(())
    }

    /// Frees any allocated block regardless of kind.
    pub(crate) fn free_block(&mut self, payload: PoolOffset, header: BlockHeader) {
        let block = payload.as_u64() - BLOCK_HEADER_SIZE;
        let freed = BlockHeader {
            state: BlockState::Free,
            ..header
        };
        self.buffer(block, freed.encode().to_vec());
        self.pending_free.push((block, header.capacity));
    }

    /// Installs `root` as the pool's root object.
    pub fn set_root(&mut self, root: PoolOffset) {
        self.superblock.root = root;
    }

    fn write_bytes(&mut self, offset: u64, data: &[u8]) -> CoreResult<()> {
        let end = offset + data.len() as u64;
        let in_fresh = self
            .fresh
            .iter()
            .any(|&(start, stop)| offset >= start && end <= stop);
        if in_fresh {
            self.state.backend.write_at(offset, data)?;
            self.direct = true;
        } else {
            self.buffer(offset, data.to_vec());
        }
        Ok(())
    }

    fn buffer(&mut self, offset: u64, data: Vec<u8>) {
        if let Some(existing) = self
            .writes
            .iter_mut()
            .find(|(at, old)| *at == offset && old.len() == data.len())
        {
            existing.1 = data;
        } else {
            self.writes.push((offset, data));
        }
    }

    /// Makes every change of this transaction durable.
    pub(crate) fn commit(mut self) -> CoreResult<TransactionId> {
        self.superblock.heap_end = self.allocator.heap_end();
        if self.superblock != self.state.superblock {
            let offset = self.state.geometry.heap_offset;
            let encoded = self.superblock.encode();
            self.buffer(offset, encoded);
        }

        if !self.writes.is_empty() {
            let geometry = self.state.geometry;
            let needed = log::required_len(&self.writes);
            if needed > geometry.log_capacity {
                return Err(CoreError::allocation(format!(
                    "transaction needs {needed} bytes of redo log, pool has {}",
                    geometry.log_capacity
                )));
            }

            let body = log::encode_body(&self.writes)?;
            let header = log::encode_header(self.txid, self.writes.len(), &body)?;
            if let Err(err) = self.persist(&geometry, &header, &body) {
                self.state.poisoned = true;
                tracing::error!(txid = %self.txid, error = %err, "commit failed, pool needs reopen");
                return Err(CoreError::write_failed(err));
            }
        } else if self.direct {
            self.state.backend.sync()?;
        }

        Ok(self.install())
    }

    fn persist(&mut self, geometry: &Geometry, header: &[u8], body: &[u8]) -> CoreResult<()> {
        let backend = &mut self.state.backend;
        if self.direct {
            backend.sync()?;
        }
        backend.write_at(geometry.log_offset + LOG_HEADER_SIZE, body)?;
        backend.write_at(geometry.log_offset, header)?;
        backend.sync()?;

        for (offset, data) in &self.writes {
            backend.write_at(*offset, data)?;
        }
        backend.sync()?;

        clear_log(&mut **backend, geometry)
    }

    fn install(self) -> TransactionId {
        let Self {
            state,
            txid,
            mut allocator,
            superblock,
            pending_free,
            ..
        } = self;

        for (block, capacity) in pending_free {
            allocator.release(block, capacity);
        }
        state.allocator = allocator;
        state.superblock = superblock;
        state.last_txid = txid;
        state.committed += 1;
        txid
    }
}

impl PoolRead for Transaction<'_> {
    fn read_bytes(&self, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        let mut buf = self.state.backend.read_at(offset, len)?;
        let end = offset + len as u64;
        for (at, data) in &self.writes {
            let stop = at + data.len() as u64;
            if *at < end && stop > offset {
                let from = (*at).max(offset);
                let to = stop.min(end);
                buf[(from - offset) as usize..(to - offset) as usize]
                    .copy_from_slice(&data[(from - at) as usize..(to - at) as usize]);
            }
        }
        Ok(buf)
    }

    fn geometry(&self) -> &Geometry {
        &self.state.geometry
    }

    fn heap_end(&self) -> u64 {
        self.allocator.heap_end()
    }

    fn root(&self) -> PoolOffset {
        self.superblock.root
    }
}
