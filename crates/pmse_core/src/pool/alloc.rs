//! Heap allocator.
//!
//! The heap is a sequence of blocks, each with a [`BlockHeader`]. Free
//! blocks are indexed by capacity; new space is carved from the end of the
//! heap when no free block is large enough. The index is volatile and is
//! rebuilt from the block headers every time a pool is opened.

use super::header::{BlockHeader, BLOCK_ALIGN, BLOCK_HEADER_SIZE};
use crate::error::{CoreError, CoreResult};
use std::collections::BTreeMap;

/// A free block is split only if the remainder can hold at least this
/// many payload bytes.
const MIN_SPLIT_PAYLOAD: u64 = 64;

/// Largest payload a single block can hold.
pub const MAX_BLOCK_PAYLOAD: u64 = u32::MAX as u64 - (BLOCK_ALIGN - 1);

/// Where an allocation was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Offset of the block header.
    pub(crate) block: u64,
    /// Payload capacity of the block.
    pub(crate) capacity: u32,
    /// Free remainder split off the reused block, as (block offset, capacity).
    pub(crate) remainder: Option<(u64, u32)>,
}

/// Volatile free-space index of one pool.
#[derive(Debug, Clone, Default)]
pub(crate) struct Allocator {
    free: BTreeMap<u32, Vec<u64>>,
    free_blocks: usize,
    free_bytes: u64,
    heap_end: u64,
    limit: u64,
}

impl Allocator {
    pub(crate) fn new(heap_end: u64, limit: u64) -> Self {
        Self {
            heap_end,
            limit,
            ..Self::default()
        }
    }

    /// Rounds a requested payload size to a valid block capacity.
    pub(crate) fn block_capacity(size: usize) -> CoreResult<u32> {
        let size = (size as u64).max(BLOCK_ALIGN);
        if size > MAX_BLOCK_PAYLOAD {
            return Err(CoreError::allocation(format!(
                "object of {size} bytes exceeds the largest block"
            )));
        }
        Ok((size.div_ceil(BLOCK_ALIGN) * BLOCK_ALIGN) as u32)
    }

    /// Reserves a block able to hold `size` payload bytes.
    pub(crate) fn allocate(&mut self, size: usize) -> CoreResult<Placement> {
        let wanted = Self::block_capacity(size)?;

        let found = self
            .free
            .range(wanted..)
            .next()
            .map(|(&cap, _)| cap);

        if let Some(cap) = found {
            let block = self.take_free(cap);
            let spare = u64::from(cap) - u64::from(wanted);
            if spare >= BLOCK_HEADER_SIZE + MIN_SPLIT_PAYLOAD {
                let rest_block = block + BLOCK_HEADER_SIZE + u64::from(wanted);
                let rest_cap = (spare - BLOCK_HEADER_SIZE) as u32;
                self.release(rest_block, rest_cap);
                return Ok(Placement {
                    block,
                    capacity: wanted,
                    remainder: Some((rest_block, rest_cap)),
                });
            }
            return Ok(Placement {
                block,
                capacity: cap,
                remainder: None,
            });
        }

        let block = self.heap_end;
        let end = block + BLOCK_HEADER_SIZE + u64::from(wanted);
        if end > self.limit {
            return Err(CoreError::allocation(format!(
                "pool full: {wanted} bytes requested, {} bytes left",
                self.limit.saturating_sub(block).saturating_sub(BLOCK_HEADER_SIZE)
            )));
        }
        self.heap_end = end;
        Ok(Placement {
            block,
            capacity: wanted,
            remainder: None,
        })
    }

    /// Returns a block to the free index.
    pub(crate) fn release(&mut self, block: u64, capacity: u32) {
        self.free.entry(capacity).or_default().push(block);
        self.free_blocks += 1;
        self.free_bytes += u64::from(capacity);
    }

    /// Records a block found while walking the heap on open.
    pub(crate) fn observe(&mut self, block: u64, header: &BlockHeader) {
        if header.state == super::header::BlockState::Free {
            self.release(block, header.capacity);
        }
    }

    fn take_free(&mut self, cap: u32) -> u64 {
        let (block, now_empty) = match self.free.get_mut(&cap) {
            Some(list) => (list.pop().unwrap_or_default(), list.is_empty()),
            None => (0, false),
        };
        if now_empty {
            self.free.remove(&cap);
        }
        self.free_blocks -= 1;
        self.free_bytes -= u64::from(cap);
        block
    }

    pub(crate) fn heap_end(&self) -> u64 {
        self.heap_end
    }

    pub(crate) fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    pub(crate) fn free_bytes(&self) -> u64 {
        self.free_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: u64 = 0x1_0040;
    const LIMIT: u64 = 0x2_0000;

    #[test]
    fn bump_allocation_is_aligned() {
        let mut alloc = Allocator::new(START, LIMIT);
        let a = alloc.allocate(1).unwrap();
        let b = alloc.allocate(100).unwrap();

        assert_eq!(a.block, START);
        assert_eq!(a.capacity, 16);
        assert_eq!(b.block, START + 32);
        assert_eq!(b.capacity, 112);
        assert_eq!(alloc.heap_end(), START + 32 + 128);
    }

    #[test]
    fn freed_block_is_reused_best_fit() {
        let mut alloc = Allocator::new(START, LIMIT);
        let small = alloc.allocate(32).unwrap();
        let large = alloc.allocate(96).unwrap();
        alloc.release(large.block, large.capacity);
        alloc.release(small.block, small.capacity);

        let again = alloc.allocate(20).unwrap();
        assert_eq!(again.block, small.block);
        assert_eq!(alloc.free_blocks(), 1);
    }

    #[test]
    fn large_free_block_is_split() {
        let mut alloc = Allocator::new(START, LIMIT);
        let big = alloc.allocate(1024).unwrap();
        alloc.release(big.block, big.capacity);

        let part = alloc.allocate(64).unwrap();
        assert_eq!(part.block, big.block);
        assert_eq!(part.capacity, 64);
        let (rest, rest_cap) = part.remainder.unwrap();
        assert_eq!(rest, big.block + 16 + 64);
        assert_eq!(u64::from(rest_cap), 1024 - 64 - 16);
        assert_eq!(alloc.free_bytes(), u64::from(rest_cap));
    }

    #[test]
    fn exhausted_heap_reports_allocation_error() {
        let mut alloc = Allocator::new(START, START + 256);
        alloc.allocate(200).unwrap();
        let err = alloc.allocate(200).unwrap_err();
        assert!(matches!(err, CoreError::AllocationError { .. }));
    }

    #[test]
    fn oversized_request_is_rejected() {
        assert!(Allocator::block_capacity(usize::MAX).is_err());
    }
}
