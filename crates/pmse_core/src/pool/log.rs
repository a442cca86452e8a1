//! Redo log stored in the log region of a pool.
//!
//! A committed transaction is written here before any of its writes reach
//! their home locations. The header is written after the body, so a torn
//! commit leaves either no header or one whose checksums do not match.
//!
//! ```text
//! header (32 bytes):
//! | magic "PRDO" | txid u64 | count u32 | body_len u32 | body_crc u32 | header_crc u32 | pad |
//!
//! body, `count` records:
//! | offset u64 | len u32 | bytes[len] |
//! ```

use super::header::Geometry;
use crate::codec::Decoder;
use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use bytes::BufMut;
use pmse_storage::StorageBackend;

/// Magic bytes of a live redo log header.
pub const LOG_MAGIC: [u8; 4] = *b"PRDO";

/// Size of the redo log header.
pub const LOG_HEADER_SIZE: u64 = 32;

const RECORD_OVERHEAD: u64 = 12;

/// A committed batch of writes read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RedoBatch {
    pub(crate) txid: TransactionId,
    pub(crate) records: Vec<(u64, Vec<u8>)>,
}

/// Returns the number of log bytes `writes` needs, header included.
pub(crate) fn required_len(writes: &[(u64, Vec<u8>)]) -> u64 {
    LOG_HEADER_SIZE
        + writes
            .iter()
            .map(|(_, data)| RECORD_OVERHEAD + data.len() as u64)
            .sum::<u64>()
}

/// Encodes the log body for `writes`.
pub(crate) fn encode_body(writes: &[(u64, Vec<u8>)]) -> CoreResult<Vec<u8>> {
    let mut body = Vec::with_capacity((required_len(writes) - LOG_HEADER_SIZE) as usize);
    for (offset, data) in writes {
        let len = u32::try_from(data.len())
            .map_err(|_| CoreError::allocation("redo record exceeds 4 GiB"))?;
        body.put_u64_le(*offset);
        body.put_u32_le(len);
        body.put_slice(data);
    }
    Ok(body)
}

/// Encodes the header that makes `body` live.
pub(crate) fn encode_header(
    txid: TransactionId,
    record_count: usize,
    body: &[u8],
) -> CoreResult<[u8; LOG_HEADER_SIZE as usize]> {
    let count = u32::try_from(record_count)
        .map_err(|_| CoreError::allocation("too many redo records"))?;
    let body_len =
        u32::try_from(body.len()).map_err(|_| CoreError::allocation("redo log exceeds 4 GiB"))?;

    let mut buf = Vec::with_capacity(LOG_HEADER_SIZE as usize);
    buf.put_slice(&LOG_MAGIC);
    buf.put_u64_le(txid.as_u64());
    buf.put_u32_le(count);
    buf.put_u32_le(body_len);
    buf.put_u32_le(crc32fast::hash(body));
    let header_crc = crc32fast::hash(&buf);
    buf.put_u32_le(header_crc);

    let mut out = [0u8; LOG_HEADER_SIZE as usize];
    out[..buf.len()].copy_from_slice(&buf);
    Ok(out)
}

/// Reads the live batch from the log region, if any.
///
/// Returns `None` when the log is empty or was torn before its header
/// became valid. Such a log belongs to a transaction that never committed.
pub(crate) fn read_batch(
    backend: &dyn StorageBackend,
    geometry: &Geometry,
) -> CoreResult<Option<RedoBatch>> {
    let header = backend.read_at(geometry.log_offset, LOG_HEADER_SIZE as usize)?;
    if header[..4] != LOG_MAGIC {
        return Ok(None);
    }

    let mut dec = Decoder::new(&header[4..], "redo log header");
    let txid = TransactionId::new(dec.u64()?);
    let count = dec.u32()?;
    let body_len = u64::from(dec.u32()?);
    let body_crc = dec.u32()?;
    let header_crc = dec.u32()?;

    if crc32fast::hash(&header[..24]) != header_crc {
        tracing::warn!(%txid, "discarding redo log with torn header");
        return Ok(None);
    }
    if LOG_HEADER_SIZE + body_len > geometry.log_capacity {
        tracing::warn!(%txid, body_len, "discarding redo log larger than its region");
        return Ok(None);
    }

    let body = backend.read_at(geometry.log_offset + LOG_HEADER_SIZE, body_len as usize)?;
    if crc32fast::hash(&body) != body_crc {
        tracing::warn!(%txid, "discarding redo log with torn body");
        return Ok(None);
    }

    let mut dec = Decoder::new(&body, "redo log body");
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = dec.u64()?;
        let len = dec.u32()? as usize;
        let data = dec.bytes(len)?.to_vec();
        if !geometry.contains(offset, len as u64) {
            return Err(CoreError::corrupt_pool(format!(
                "redo record at {offset:#x} ({len} bytes) lies outside the heap"
            )));
        }
        records.push((offset, data));
    }

    Ok(Some(RedoBatch { txid, records }))
}
