//! Bounds-checked cursor for parsing Second Life protocol data

use super::{CodecError, CodecResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Read cursor over a borrowed datagram.
///
/// Every read checks the remaining length first; a short buffer yields
/// `CodecError::Truncated` and leaves the position untouched.
pub struct PacketBuffer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Peek at next byte without advancing position
    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.position).copied()
    }

    /// Borrow the next `len` bytes and advance past them
    pub fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CodecError::Truncated { needed: len, remaining: self.remaining() });
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16_le(&mut self) -> CodecResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    /// Big-endian u16, used for ports and low-frequency message ids
    pub fn get_u16_be(&mut self) -> CodecResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn get_u32_le(&mut self) -> CodecResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn get_u64_le(&mut self) -> CodecResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn get_f32_le(&mut self) -> CodecResult<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn get_f64_le(&mut self) -> CodecResult<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    pub fn get_bytes(&mut self, len: usize) -> CodecResult<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_reads() {
        let data = [0x01, 0x02, 0x03, 0x04, 0xAA];
        let mut buffer = PacketBuffer::new(&data);
        assert_eq!(buffer.get_u32_le().unwrap(), 0x04030201);
        assert_eq!(buffer.remaining(), 1);
        assert_eq!(buffer.peek_u8(), Some(0xAA));
    }

    #[test]
    fn test_short_read_does_not_advance() {
        let data = [0x01, 0x02];
        let mut buffer = PacketBuffer::new(&data);
        assert_eq!(buffer.get_u32_le(), Err(CodecError::Truncated { needed: 4, remaining: 2 }));
        assert_eq!(buffer.position(), 0);
        assert_eq!(buffer.get_u16_be().unwrap(), 0x0102);
        assert!(!buffer.has_remaining());
    }
}
