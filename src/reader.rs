//! Sequential big-endian cursor used to decode class files and walk
//! method bytecode.
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// `ByteReader` reads fixed-width big-endian integers from a borrowed byte
/// buffer. Every read is bounds-checked and reports the offset it failed at.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    /// Current offset from the start of the buffer.
    pub fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    /// Move the cursor, used by branches. Positions past the end are
    /// allowed, the next read reports them.
    pub fn set_position(&mut self, position: usize) {
        self.cursor.set_position(position as u64);
    }

    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while there are unread bytes.
    pub fn has_remaining(&self) -> bool {
        self.position() < self.len()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let offset = self.position();
        self.cursor.read_u8().map_err(|_| eof(offset, 1))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        let offset = self.position();
        self.cursor.read_i8().map_err(|_| eof(offset, 1))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let offset = self.position();
        self.cursor
            .read_u16::<BigEndian>()
            .map_err(|_| eof(offset, 2))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        let offset = self.position();
        self.cursor
            .read_i16::<BigEndian>()
            .map_err(|_| eof(offset, 2))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let offset = self.position();
        self.cursor
            .read_u32::<BigEndian>()
            .map_err(|_| eof(offset, 4))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let offset = self.position();
        self.cursor
            .read_u64::<BigEndian>()
            .map_err(|_| eof(offset, 8))
    }

    /// Borrow the next `count` bytes and advance past them.
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let bytes: &'a [u8] = self.cursor.get_ref();
        let start = self.position();
        let end = start
            .checked_add(count)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| eof(start, count))?;
        self.set_position(end);
        Ok(&bytes[start..end])
    }
}

fn eof(offset: usize, wanted: usize) -> Error {
    Error::UnexpectedEndOfInput { offset, wanted }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_values() {
        let bytes = [0xca, 0xfe, 0xba, 0xbe, 0x00, 0x2a, 0xff, 0xfe];
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u32().unwrap(), 0xcafebabe);
        assert_eq!(reader.read_u16().unwrap(), 42);
        assert_eq!(reader.read_i16().unwrap(), -2);
        assert!(!reader.has_remaining());
    }

    #[test]
    fn truncated_read_reports_offset() {
        let bytes = [0x00, 0x01, 0x02];
        let mut reader = ByteReader::new(&bytes);
        reader.read_u8().unwrap();
        match reader.read_u32() {
            Err(Error::UnexpectedEndOfInput { offset, wanted }) => {
                assert_eq!(offset, 1);
                assert_eq!(wanted, 4);
            }
            other => panic!("expected end of input, got {other:?}"),
        }
    }

    #[test]
    fn read_bytes_borrows_from_buffer() {
        let bytes = b"\x00\x02hi!";
        let mut reader = ByteReader::new(bytes);
        let length = reader.read_u16().unwrap() as usize;
        assert_eq!(reader.read_bytes(length).unwrap(), b"hi");
        assert!(reader.read_bytes(2).is_err());
        assert_eq!(reader.read_bytes(1).unwrap(), b"!");
    }
}
