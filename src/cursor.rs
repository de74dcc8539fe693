//! Positioned little-endian reader over an in-memory buffer.
//!
//! Every read is bounds-checked up front and fails with
//! [`NxoError::Truncated`]; the cursor never panics on malformed input.

use crate::error::{NxoError, Result};

/// A seekable byte reader. All multi-byte reads are little-endian.
#[derive(Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos as usize;
    }

    pub fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let out = self.slice_at(self.pos as u64, len)?;
        self.pos += len;
        Ok(out)
    }

    fn slice_at(&self, offset: u64, len: usize) -> Result<&'a [u8]> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => Ok(&self.data[start..end]),
            None => Err(NxoError::Truncated {
                offset,
                len,
                size: self.data.len(),
            }),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a u32 at an absolute offset without moving the cursor.
    pub fn u32_at(&self, offset: u64) -> Result<u32> {
        Ok(u32::from_le_bytes(self.slice_at(offset, 4)?.try_into().unwrap()))
    }

    /// Reads a u64 at an absolute offset without moving the cursor.
    pub fn u64_at(&self, offset: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(self.slice_at(offset, 8)?.try_into().unwrap()))
    }

    /// Borrows `len` bytes at an absolute offset without moving the cursor.
    pub fn bytes_at(&self, offset: u64, len: usize) -> Result<&'a [u8]> {
        self.slice_at(offset, len)
    }

    /// Reads a value-sized word: u32 on 32-bit images, u64 on 64-bit ones.
    pub fn read_word(&mut self, is_32bit: bool) -> Result<u64> {
        if is_32bit {
            Ok(self.read_u32()? as u64)
        } else {
            self.read_u64()
        }
    }
}
