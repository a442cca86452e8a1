//! On-media layout: pool header, superblock and heap block headers.
//!
//! ```text
//! 0                HEADER_SIZE          heap_offset
//! ┌────────────────┬────────────────────┬────────────┬───────┬───────┬──
//! │ pool header    │ redo log region    │ superblock │ block │ block │ ...
//! └────────────────┴────────────────────┴────────────┴───────┴───────┴──
//! ```

use crate::codec::Decoder;
use crate::error::{CoreError, CoreResult};
use crate::types::PoolOffset;
use bytes::BufMut;

/// Magic bytes at the start of every pool file.
pub const POOL_MAGIC: [u8; 8] = *b"PMSEPOOL";

/// Current pool format version.
pub const POOL_FORMAT_VERSION: u16 = 1;

/// Bytes reserved for the pool header.
pub const HEADER_SIZE: u64 = 4096;

/// Maximum length of a layout tag.
pub const MAX_LAYOUT_LEN: usize = 64;

/// Smallest pool that can be created (the minimum allocator unit).
pub const MIN_POOL_SIZE: u64 = 8 * 1024 * 1024;

/// Smallest redo log region.
pub const MIN_LOG_SIZE: u64 = 64 * 1024;

/// Alignment of every heap block and payload.
pub const BLOCK_ALIGN: u64 = 16;

/// Size of the header in front of every heap block.
pub const BLOCK_HEADER_SIZE: u64 = 16;

/// Bytes reserved for the superblock at the start of the heap.
pub const SUPERBLOCK_SIZE: u64 = 64;

const SUPERBLOCK_MAGIC: [u8; 4] = *b"PSBK";
const BLOCK_MAGIC: u16 = 0xB10C;
const ENCODED_HEADER_LEN: usize = 8 + 2 + 1 + MAX_LAYOUT_LEN + 8 * 4 + 4;

/// Fixed positions of the regions inside one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Total size of the pool file.
    pub capacity: u64,
    /// Start of the redo log region.
    pub log_offset: u64,
    /// Size of the redo log region.
    pub log_capacity: u64,
    /// Start of the heap (the superblock lives here).
    pub heap_offset: u64,
}

impl Geometry {
    /// Derives the layout of a pool of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if `capacity` is below [`MIN_POOL_SIZE`].
    pub fn for_capacity(capacity: u64) -> CoreResult<Self> {
        if capacity < MIN_POOL_SIZE {
            return Err(CoreError::allocation(format!(
                "pool capacity {capacity} is below the minimum of {MIN_POOL_SIZE} bytes"
            )));
        }

        let log_capacity = (capacity / 16).max(MIN_LOG_SIZE).div_ceil(4096) * 4096;
        Ok(Self {
            capacity,
            log_offset: HEADER_SIZE,
            log_capacity,
            heap_offset: HEADER_SIZE + log_capacity,
        })
    }

    /// Offset of the first heap block header.
    #[must_use]
    pub const fn first_block(&self) -> u64 {
        self.heap_offset + SUPERBLOCK_SIZE
    }

    /// Returns true if `[offset, offset + len)` lies inside the heap.
    #[must_use]
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset >= self.heap_offset
            && offset
                .checked_add(len)
                .is_some_and(|end| end <= self.capacity)
    }
}

/// The pool header stored at offset zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHeader {
    /// Format version the pool was written with.
    pub format_version: u16,
    /// Structural layout tag (for example `pmse_mapper`).
    pub layout: String,
    /// Region layout.
    pub geometry: Geometry,
}

impl PoolHeader {
    /// Creates a header for a new pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for an empty or over-long layout tag.
    pub fn new(layout: &str, geometry: Geometry) -> CoreResult<Self> {
        validate_layout(layout)?;
        Ok(Self {
            format_version: POOL_FORMAT_VERSION,
            layout: layout.to_string(),
            geometry,
        })
    }

    /// Number of bytes [`encode`](Self::encode) produces.
    #[must_use]
    pub const fn encoded_len() -> usize {
        ENCODED_HEADER_LEN
    }

    /// Encodes the header, CRC included.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENCODED_HEADER_LEN);
        buf.put_slice(&POOL_MAGIC);
        buf.put_u16_le(self.format_version);

        let layout = self.layout.as_bytes();
        let mut padded = [0u8; MAX_LAYOUT_LEN];
        let len = layout.len().min(MAX_LAYOUT_LEN);
        padded[..len].copy_from_slice(&layout[..len]);
        buf.put_u8(len as u8);
        buf.put_slice(&padded);

        buf.put_u64_le(self.geometry.capacity);
        buf.put_u64_le(self.geometry.log_offset);
        buf.put_u64_le(self.geometry.log_capacity);
        buf.put_u64_le(self.geometry.heap_offset);

        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `CorruptPool` if the bytes are not a pmse pool header, the
    /// checksum does not match, or the format version is unsupported.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < ENCODED_HEADER_LEN || data[..8] != POOL_MAGIC {
            return Err(CoreError::corrupt_pool("not a pmse pool (bad magic)"));
        }

        let body = &data[..ENCODED_HEADER_LEN - 4];
        let stored_crc = u32::from_le_bytes([
            data[ENCODED_HEADER_LEN - 4],
            data[ENCODED_HEADER_LEN - 3],
            data[ENCODED_HEADER_LEN - 2],
            data[ENCODED_HEADER_LEN - 1],
        ]);
        let actual_crc = crc32fast::hash(body);
        if stored_crc != actual_crc {
            return Err(CoreError::corrupt_pool(format!(
                "header checksum mismatch: expected {stored_crc:08x}, got {actual_crc:08x}"
            )));
        }

        let mut dec = Decoder::new(&body[8..], "pool header");
        let format_version = dec.u16()?;
        if format_version > POOL_FORMAT_VERSION {
            return Err(CoreError::corrupt_pool(format!(
                "unsupported pool format version: {format_version}"
            )));
        }

        let layout_len = (dec.u8()? as usize).min(MAX_LAYOUT_LEN);
        let padded = dec.bytes(MAX_LAYOUT_LEN)?;
        let layout = std::str::from_utf8(&padded[..layout_len])
            .map_err(|_| CoreError::corrupt_pool("layout tag is not UTF-8"))?
            .to_string();

        let geometry = Geometry {
            capacity: dec.u64()?,
            log_offset: dec.u64()?,
            log_capacity: dec.u64()?,
            heap_offset: dec.u64()?,
        };

        if geometry.log_offset != HEADER_SIZE
            || geometry.heap_offset != geometry.log_offset + geometry.log_capacity
            || geometry.first_block() > geometry.capacity
        {
            return Err(CoreError::corrupt_pool(format!(
                "inconsistent region layout: {geometry:?}"
            )));
        }

        Ok(Self {
            format_version,
            layout,
            geometry,
        })
    }
}

/// Checks that a layout tag can be stored in a pool header.
pub(crate) fn validate_layout(layout: &str) -> CoreResult<()> {
    if layout.is_empty() || layout.len() > MAX_LAYOUT_LEN {
        return Err(CoreError::invalid_operation(format!(
            "layout tag must be 1..={MAX_LAYOUT_LEN} bytes, got {}",
            layout.len()
        )));
    }
    Ok(())
}

/// Mutable pool-wide state kept at the start of the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Payload offset of the root object.
    pub root: PoolOffset,
    /// First byte past the last block ever carved from the heap.
    pub heap_end: u64,
}

impl Superblock {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.put_slice(&SUPERBLOCK_MAGIC);
        buf.put_u32_le(0);
        buf.put_u64_le(self.root.as_u64());
        buf.put_u64_le(self.heap_end);
        buf
    }

    pub(crate) fn decode(data: &[u8]) -> CoreResult<Self> {
        let mut dec = Decoder::new(data, "superblock");
        dec.magic(&SUPERBLOCK_MAGIC)
            .map_err(|e| CoreError::corrupt_pool(e.to_string()))?;
        let _reserved = dec.u32()?;
        Ok(Self {
            root: dec.offset()?,
            heap_end: dec.u64()?,
        })
    }
}

/// Allocation state of a heap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// Available for reuse.
    Free = 1,
    /// Owned by a persistent structure.
    Allocated = 2,
}

/// What a heap block holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    /// Root object of a collection pool.
    CollectionRoot = 1,
    /// Persistent map header.
    MapHeader = 2,
    /// Persistent map bucket array.
    MapBuckets = 3,
    /// One persistent map entry.
    MapEntry = 4,
    /// Persistent tree header.
    TreeHeader = 5,
    /// One persistent tree node.
    TreeNode = 6,
    /// Identifier-to-tree table of a collection.
    IndexTable = 7,
    /// Root object of the metadata list pool.
    ListRoot = 8,
    /// One metadata list entry.
    ListEntry = 9,
    /// Untyped bytes.
    Raw = 10,
}

impl BlockKind {
    /// Converts a byte to a block kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::CollectionRoot),
            2 => Some(Self::MapHeader),
            3 => Some(Self::MapBuckets),
            4 => Some(Self::MapEntry),
            5 => Some(Self::TreeHeader),
            6 => Some(Self::TreeNode),
            7 => Some(Self::IndexTable),
            8 => Some(Self::ListRoot),
            9 => Some(Self::ListEntry),
            10 => Some(Self::Raw),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// The 16-byte header in front of every heap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Usable payload bytes (a multiple of [`BLOCK_ALIGN`]).
    pub capacity: u32,
    /// Allocation state.
    pub state: BlockState,
    /// Content kind.
    pub kind: BlockKind,
}

impl BlockHeader {
    pub(crate) fn encode(&self) -> [u8; BLOCK_HEADER_SIZE as usize] {
        let mut out = [0u8; BLOCK_HEADER_SIZE as usize];
        out[0..4].copy_from_slice(&self.capacity.to_le_bytes());
        out[4] = self.state as u8;
        out[5] = self.kind.as_byte();
        out[6..8].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
        out
    }

    pub(crate) fn decode(at: u64, data: &[u8]) -> CoreResult<Self> {
        let mut dec = Decoder::new(data, "block header");
        let capacity = dec.u32()?;
        let state = dec.u8()?;
        let kind = dec.u8()?;
        let magic = dec.u16()?;

        let bad = |what: &str| CoreError::structural(format!("block at {at:#x}: {what}"));
        if magic != BLOCK_MAGIC {
            return Err(bad("bad block magic"));
        }
        if u64::from(capacity) % BLOCK_ALIGN != 0 || capacity == 0 {
            return Err(bad("misaligned capacity"));
        }
        let state = match state {
            1 => BlockState::Free,
            2 => BlockState::Allocated,
            _ => return Err(bad("unknown block state")),
        };
        let kind = BlockKind::from_byte(kind).ok_or_else(|| bad("unknown block kind"))?;

        Ok(Self {
            capacity,
            state,
            kind,
        })
    }

    /// Total bytes the block occupies, header included.
    #[must_use]
    pub fn span(&self) -> u64 {
        BLOCK_HEADER_SIZE + u64::from(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_rejects_small_pools() {
        let err = Geometry::for_capacity(MIN_POOL_SIZE - 1).unwrap_err();
        assert!(err.is_out_of_space());
    }

    #[test]
    fn geometry_regions_do_not_overlap() {
        let g = Geometry::for_capacity(MIN_POOL_SIZE).unwrap();
        assert_eq!(g.log_offset, HEADER_SIZE);
        assert!(g.log_capacity >= MIN_LOG_SIZE);
        assert_eq!(g.log_capacity % 4096, 0);
        assert_eq!(g.heap_offset, g.log_offset + g.log_capacity);
        assert!(g.contains(g.first_block(), 16));
        assert!(!g.contains(g.capacity - 8, 16));
        assert!(!g.contains(0, 16));
    }

    #[test]
    fn header_roundtrip_and_layout_check() {
        let g = Geometry::for_capacity(MIN_POOL_SIZE).unwrap();
        let header = PoolHeader::new("pmse_mapper", g).unwrap();
        let encoded = header.encode();
        assert_eq!(encoded.len(), PoolHeader::encoded_len());
        assert_eq!(PoolHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn header_checksum_detects_bit_flip() {
        let g = Geometry::for_capacity(MIN_POOL_SIZE).unwrap();
        let mut encoded = PoolHeader::new("pmse_mapper", g).unwrap().encode();
        encoded[20] ^= 0x01;
        let err = PoolHeader::decode(&encoded).unwrap_err();
        assert!(matches!(err, CoreError::CorruptPool { .. }));
    }

    #[test]
    fn header_rejects_foreign_bytes() {
        let err = PoolHeader::decode(&[0u8; 200]).unwrap_err();
        assert!(matches!(err, CoreError::CorruptPool { .. }));
    }

    #[test]
    fn layout_tag_limits() {
        let g = Geometry::for_capacity(MIN_POOL_SIZE).unwrap();
        assert!(PoolHeader::new("", g).is_err());
        assert!(PoolHeader::new(&"x".repeat(MAX_LAYOUT_LEN + 1), g).is_err());
    }

    #[test]
    fn block_header_validation() {
        let header = BlockHeader {
            capacity: 64,
            state: BlockState::Allocated,
            kind: BlockKind::MapEntry,
        };
        let bytes = header.encode();
        assert_eq!(BlockHeader::decode(0, &bytes).unwrap(), header);
        assert_eq!(header.span(), 80);

        assert!(BlockHeader::decode(0, &[0u8; 16]).is_err());

        let mut bad_kind = bytes;
        bad_kind[5] = 99;
        assert!(BlockHeader::decode(0, &bad_kind).is_err());
    }

    #[test]
    fn superblock_roundtrip() {
        let sb = Superblock {
            root: PoolOffset::new(0x1_0050),
            heap_end: 0x2_0000,
        };
        assert_eq!(Superblock::decode(&sb.encode()).unwrap(), sb);
    }
}
