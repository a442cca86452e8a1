//! On-media encoding of the persistent map.
//!
//! ```text
//! header (MapHeader block):
//! | "PMAP" | bucket_count u32 | buckets u64 | next_id u64 | len u64 | data_size u64 |
//!
//! bucket array (MapBuckets block): bucket_count x u64 entry offsets
//!
//! entry (MapEntry block):
//! | next u64 | id u64 | len u32 | payload[len] |
//! ```

use crate::codec::Decoder;
use crate::error::{CoreError, CoreResult};
use crate::pool::{BlockKind, PoolRead, BLOCK_HEADER_SIZE};
use crate::types::{PoolOffset, RecordId};
use bytes::BufMut;

const MAP_MAGIC: [u8; 4] = *b"PMAP";

/// Byte offset of the counters inside the header payload.
pub(crate) const COUNTERS_AT: u64 = 16;

/// Bytes in front of the payload of every entry.
pub(crate) const ENTRY_HEAD_LEN: usize = 20;

/// Persistent map header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MapHeader {
    pub(crate) bucket_count: u32,
    pub(crate) buckets: PoolOffset,
    pub(crate) next_id: u64,
    pub(crate) len: u64,
    pub(crate) data_size: u64,
}

impl MapHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40);
        buf.put_slice(&MAP_MAGIC);
        buf.put_u32_le(self.bucket_count);
        buf.put_u64_le(self.buckets.as_u64());
        buf.put_slice(&encode_counters(self.next_id, self.len, self.data_size));
        buf
    }

    pub(crate) fn read<R: PoolRead + ?Sized>(r: &R, at: PoolOffset) -> CoreResult<Self> {
        let raw = r.object(at, BlockKind::MapHeader)?;
        let mut dec = Decoder::new(&raw, "map header");
        dec.magic(&MAP_MAGIC)?;
        let header = Self {
            bucket_count: dec.u32()?,
            buckets: dec.offset()?,
            next_id: dec.u64()?,
            len: dec.u64()?,
            data_size: dec.u64()?,
        };
        if header.bucket_count == 0 {
            return Err(CoreError::structural(format!("map at {at} has no buckets")));
        }
        Ok(header)
    }
}

pub(crate) fn encode_counters(next_id: u64, len: u64, data_size: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.put_u64_le(next_id);
    buf.put_u64_le(len);
    buf.put_u64_le(data_size);
    buf
}

/// Fixed part of a map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryHead {
    pub(crate) next: PoolOffset,
    pub(crate) id: RecordId,
    pub(crate) len: u32,
}

pub(crate) fn encode_entry(next: PoolOffset, id: RecordId, payload: &[u8]) -> CoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::allocation(format!("payload of {} bytes", payload.len())))?;
    let mut buf = Vec::with_capacity(ENTRY_HEAD_LEN + payload.len());
    buf.put_u64_le(next.as_u64());
    buf.put_u64_le(id.as_u64());
    buf.put_u32_le(len);
    buf.put_slice(payload);
    Ok(buf)
}

pub(crate) fn read_entry_head<R: PoolRead + ?Sized>(r: &R, at: PoolOffset) -> CoreResult<EntryHead> {
    let header = r.object_header(at, BlockKind::MapEntry)?;
    let raw = r.read_bytes(at.as_u64(), ENTRY_HEAD_LEN)?;
    let mut dec = Decoder::new(&raw, "map entry");
    let head = EntryHead {
        next: dec.offset()?,
        id: RecordId::new(dec.u64()?),
        len: dec.u32()?,
    };
    if ENTRY_HEAD_LEN as u64 + u64::from(head.len) > u64::from(header.capacity) {
        return Err(CoreError::structural(format!(
            "map entry at {at} claims {} payload bytes in a {}-byte block",
            head.len, header.capacity
        )));
    }
    Ok(head)
}

pub(crate) fn read_payload<R: PoolRead + ?Sized>(
    r: &R,
    at: PoolOffset,
    head: &EntryHead,
) -> CoreResult<Vec<u8>> {
    r.read_bytes(at.as_u64() + ENTRY_HEAD_LEN as u64, head.len as usize)
}

pub(crate) fn read_bucket<R: PoolRead + ?Sized>(
    r: &R,
    header: &MapHeader,
    bucket: u32,
) -> CoreResult<PoolOffset> {
    let raw = r.read_bytes(header.buckets.as_u64() + u64::from(bucket) * 8, 8)?;
    Decoder::new(&raw, "map bucket").offset()
}

/// Validates the bucket array of a map header.
pub(crate) fn check_buckets<R: PoolRead + ?Sized>(r: &R, header: &MapHeader) -> CoreResult<()> {
    let block = r.object_header(header.buckets, BlockKind::MapBuckets)?;
    if u64::from(header.bucket_count) * 8 > u64::from(block.capacity) {
        return Err(CoreError::structural(format!(
            "bucket array at {} is too small for {} buckets",
            header.buckets, header.bucket_count
        )));
    }
    Ok(())
}

/// Home bucket of a record id.
pub(crate) fn bucket_of(id: RecordId, bucket_count: u32) -> u32 {
    // splitmix64 finalizer; the bucket of an id must never change between builds.
    let mut z = id.as_u64().wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z % u64::from(bucket_count)) as u32
}

/// Upper bound on the length of any chain in the pool, used to stop on
/// cycles instead of looping forever.
pub(crate) fn chain_limit<R: PoolRead + ?Sized>(r: &R) -> u64 {
    let heap = r.heap_end().saturating_sub(r.geometry().first_block());
    heap / (BLOCK_HEADER_SIZE + ENTRY_HEAD_LEN as u64) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_of_is_stable_and_in_range() {
        for id in 0..1000u64 {
            let b = bucket_of(RecordId::new(id), 17);
            assert!(b < 17);
            assert_eq!(b, bucket_of(RecordId::new(id), 17));
        }
        assert_eq!(bucket_of(RecordId::new(u64::MAX), 1), 0);
    }

    #[test]
    fn bucket_of_spreads_sequential_ids() {
        let mut used = std::collections::HashSet::new();
        for id in 0..64u64 {
            used.insert(bucket_of(RecordId::new(id), 64));
        }
        assert!(used.len() > 32);
    }

    #[test]
    fn entry_encoding_layout() {
        let buf = encode_entry(PoolOffset::new(0x40), RecordId::new(9), b"abc").unwrap();
        assert_eq!(buf.len(), ENTRY_HEAD_LEN + 3);
        assert_eq!(&buf[..8], &0x40u64.to_le_bytes());
        assert_eq!(&buf[8..16], &9u64.to_le_bytes());
        assert_eq!(&buf[16..20], &3u32.to_le_bytes());
        assert_eq!(&buf[20..], b"abc");
    }
}
