//! Big-endian field access over box payloads.
//!
//! The free functions read at absolute offsets and return `None` when the
//! field does not fit, so a walker can bail out of a truncated box without
//! panicking. [`FieldReader`] is a cursor for boxes with a sequential layout.

use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::error::ParseDiagnostic;

/// Largest integer a consumer using IEEE-754 doubles can represent exactly.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

#[inline]
fn field(buf: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    buf.get(offset..offset.checked_add(len)?)
}

/// Reads a big-endian `u16` at `offset`.
#[inline]
pub fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    field(buf, offset, 2).map(BigEndian::read_u16)
}

/// Reads a big-endian `u32` at `offset`.
#[inline]
pub fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    field(buf, offset, 4).map(BigEndian::read_u32)
}

/// Reads a big-endian two's complement `i32` at `offset`.
#[inline]
pub fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    field(buf, offset, 4).map(BigEndian::read_i32)
}

/// Reads two consecutive 32-bit words as `high * 2^32 + low`.
#[inline]
pub fn read_u64(buf: &[u8], offset: usize) -> Option<u64> {
    field(buf, offset, 8).map(BigEndian::read_u64)
}

/// Writes `value` at `offset`. Returns `None` if the field does not fit.
#[inline]
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Option<()> {
    let end = offset.checked_add(4)?;
    BigEndian::write_u32(buf.get_mut(offset..end)?, value);
    Some(())
}

/// Sequential reader over a fixed box layout.
///
/// Every read that runs past the payload reports [`ParseDiagnostic::Truncated`]
/// tagged with the reader's context.
pub(crate) struct FieldReader<'a> {
    cursor: Cursor<&'a [u8]>,
    context: &'static str,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            cursor: Cursor::new(data),
            context,
        }
    }

    #[inline]
    pub(crate) fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    #[inline]
    fn truncated(&self) -> ParseDiagnostic {
        ParseDiagnostic::Truncated {
            context: self.context,
        }
    }

    fn map<T>(&self, res: io::Result<T>) -> Result<T, ParseDiagnostic> {
        res.map_err(|_| self.truncated())
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), ParseDiagnostic> {
        if len > self.remaining() {
            return Err(self.truncated());
        }
        self.cursor.set_position((self.position() + len) as u64);
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ParseDiagnostic> {
        let res = self.cursor.read_u8();
        self.map(res)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ParseDiagnostic> {
        let res = self.cursor.read_u16::<BigEndian>();
        self.map(res)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ParseDiagnostic> {
        let res = self.cursor.read_u32::<BigEndian>();
        self.map(res)
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ParseDiagnostic> {
        let res = self.cursor.read_i32::<BigEndian>();
        self.map(res)
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ParseDiagnostic> {
        let res = self.cursor.read_u64::<BigEndian>();
        self.map(res)
    }

    /// Borrows the next `len` bytes of the payload.
    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], ParseDiagnostic> {
        if len > self.remaining() {
            return Err(self.truncated());
        }
        let start = self.position();
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + len) as u64);
        Ok(&data[start..start + len])
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], ParseDiagnostic> {
        let mut out = [0u8; N];
        let res = self.cursor.read_exact(&mut out);
        self.map(res)?;
        Ok(out)
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_read_u32_is_unsigned() {
        let buf = [0xFF, 0xFF, 0xFF, 0xFE];
        assert_eq!(read_u32(&buf, 0), Some(0xFFFF_FFFE));
        assert_eq!(read_i32(&buf, 0), Some(-2));
    }

    #[test]
    fn test_read_u64_combines_words() {
        let buf = [0, 0, 0, 1, 0, 0, 0, 2];
        assert_eq!(read_u64(&buf, 0), Some((1u64 << 32) + 2));
    }

    #[test]
    fn test_reads_out_of_bounds() {
        let buf = [1, 2, 3];
        assert_eq!(read_u16(&buf, 1), Some(0x0203));
        assert_eq!(read_u16(&buf, 2), None);
        assert_eq!(read_u32(&buf, 0), None);
        assert_eq!(read_u32(&buf, usize::MAX), None);
    }

    #[test]
    fn test_write_u32() {
        let mut buf = [0u8; 6];
        assert!(write_u32(&mut buf, 2, 0xDEAD_BEEF).is_some());
        assert_eq!(buf, [0, 0, 0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(write_u32(&mut buf, 3, 1).is_none());
    }

    #[test]
    fn test_field_reader_sequence() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0xAA, 0xBB];
        let mut reader = FieldReader::new(&data, "test");
        assert_eq!(reader.u8().unwrap(), 1);
        assert_eq!(reader.u16().unwrap(), 2);
        assert_eq!(reader.u32().unwrap(), 3);
        assert_eq!(reader.remaining(), 2);
        assert_eq!(reader.bytes(2).unwrap(), &[0xAA, 0xBB]);
        assert_eq!(
            reader.u8(),
            Err(ParseDiagnostic::Truncated { context: "test" })
        );
    }

    #[test]
    fn test_field_reader_skip_past_end() {
        let data = [0u8; 4];
        let mut reader = FieldReader::new(&data, "skip");
        assert!(reader.skip(4).is_ok());
        assert!(reader.skip(1).is_err());
        assert_eq!(reader.position(), 4);
    }
}
