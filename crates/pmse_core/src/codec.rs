//! Bounds-checked little-endian decoding for persistent objects.
//!
//! Every persistent structure is read back through [`Decoder`], so a short
//! or garbled block surfaces as `StructuralCorruption` instead of a panic.

use crate::error::{CoreError, CoreResult};
use crate::types::PoolOffset;
use bytes::Buf;

/// Cursor over the bytes of one persistent object.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder; `what` names the object in error messages.
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, n: usize) -> CoreResult<()> {
        if self.buf.remaining() < n {
            return Err(CoreError::structural(format!(
                "truncated {}: need {} bytes, have {}",
                self.what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn magic(&mut self, expected: &[u8; 4]) -> CoreResult<()> {
        let found = self.bytes(4)?;
        if found != expected {
            return Err(CoreError::structural(format!(
                "bad {} magic: expected {:?}, found {:?}",
                self.what, expected, found
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> CoreResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> CoreResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn u64(&mut self) -> CoreResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn offset(&mut self) -> CoreResult<PoolOffset> {
        self.u64().map(PoolOffset::new)
    }

    pub(crate) fn bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        self.need(n)?;
        let buf: &'a [u8] = self.buf;
        let (head, tail) = buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Reads a `u16`-length-prefixed UTF-8 string.
    pub(crate) fn string(&mut self) -> CoreResult<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CoreError::structural(format!("invalid UTF-8 in {}", self.what)))
    }
}

/// Appends a `u16`-length-prefixed string.
pub(crate) fn put_string(buf: &mut Vec<u8>, value: &str) {
    use bytes::BufMut;
    let len = u16::try_from(value.len()).unwrap_or(u16::MAX);
    buf.put_u16_le(len);
    buf.put_slice(&value.as_bytes()[..len as usize]);
}
