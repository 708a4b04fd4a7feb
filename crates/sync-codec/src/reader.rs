use crate::{CodecError, CodecResult, Version};
use uuid::Uuid;

/// Reads typed fields from a fully-buffered message payload in declaration
/// order.
///
/// The payload must already be complete (see [`crate::try_decode_frame`]);
/// a `MessageReader` never blocks waiting for more bytes. A read past the
/// end of the buffer, a bad length prefix, or invalid UTF-8 all produce
/// [`CodecError::MalformedMessage`] / [`CodecError::InvalidUtf8`] rather
/// than panicking.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::MalformedMessage(format!(
                "expected {n} more bytes at offset {}, have {}",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read the short ASCII tag at the head of the message.
    pub fn read_tag(&mut self) -> CodecResult<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> CodecResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> CodecResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> CodecResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> CodecResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> CodecResult<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_str(&mut self) -> CodecResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_uuid(&mut self) -> CodecResult<Uuid> {
        let b = self.take(16)?;
        Ok(Uuid::from_slice(b).expect("exactly 16 bytes"))
    }

    pub fn read_version(&mut self) -> CodecResult<Version> {
        let count = self.read_u8()? as usize;
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            segments.push(self.read_u32()?);
        }
        Ok(Version::new(segments))
    }

    pub fn read_option<T>(&mut self, read_some: impl FnOnce(&mut Self) -> CodecResult<T>) -> CodecResult<Option<T>> {
        if self.read_bool()? {
            Ok(Some(read_some(self)?))
        } else {
            Ok(None)
        }
    }

    pub fn read_list<T>(&mut self, mut read_item: impl FnMut(&mut Self) -> CodecResult<T>) -> CodecResult<Vec<T>> {
        let len = self.read_u32()? as usize;
        let mut items = Vec::with_capacity(len.min(1 << 16));
        for _ in 0..len {
            items.push(read_item(self)?);
        }
        Ok(items)
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Every remaining byte, unconsumed (e.g. a trailing signature).
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Advance past `n` bytes and return them, for fixed-size trailers.
    pub fn read_exact(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        self.take(n)
    }
}
