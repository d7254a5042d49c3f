//! Little-endian read/write helpers
//!
//! Writers go through `bytes::BufMut` directly (`put_u16_le`, `put_u64_le`, ...).
//! Readers use [`LeReader`], a cursor over a borrowed slice that turns every
//! short read into [`Error::Truncated`] instead of panicking the way
//! `bytes::Buf` does.

use bytes::BufMut;

use crate::error::{Error, Result};

/// Cursor over a byte slice with bounds-checked little-endian reads.
#[derive(Debug, Clone)]
pub struct LeReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> LeReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrow the next `n` bytes and advance past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    /// Read a `[len u16][bytes]` field.
    pub fn u16_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

/// Write `[len u16][bytes]`, rejecting payloads that do not fit the length field.
pub fn put_u16_prefixed<B: BufMut>(buf: &mut B, payload: &[u8]) -> Result<usize> {
    let len = u16::try_from(payload.len()).map_err(|_| Error::StringTooLong(payload.len()))?;
    buf.put_u16_le(len);
    buf.put_slice(payload);
    Ok(2 + payload.len())
}

/// Overwrite a little-endian u16 already present in `buf` at `at`.
pub fn patch_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

/// Overwrite a little-endian u32 already present in `buf` at `at`.
pub fn patch_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_truncation() {
        let data = [0x01, 0x02, 0x03];
        let mut r = LeReader::new(&data);
        assert_eq!(r.u16().unwrap(), 0x0201);
        match r.u32() {
            Err(Error::Truncated {
                offset,
                needed,
                available,
            }) => {
                assert_eq!(offset, 2);
                assert_eq!(needed, 4);
                assert_eq!(available, 1);
            }
            other => panic!("expected truncation, got {:?}", other),
        }
    }

    #[test]
    fn test_prefixed_field() {
        let mut buf = Vec::new();
        put_u16_prefixed(&mut buf, b"hello").unwrap();
        assert_eq!(&buf[..2], &[5, 0]);

        let mut r = LeReader::new(&buf);
        assert_eq!(r.u16_prefixed().unwrap(), b"hello");
        assert!(r.is_empty());
    }

    #[test]
    fn test_prefixed_rejects_oversized_payload() {
        let big = vec![b'x'; u16::MAX as usize + 1];
        let mut buf = Vec::new();
        assert!(matches!(
            put_u16_prefixed(&mut buf, &big),
            Err(Error::StringTooLong(65536))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_patch_helpers() {
        let mut buf = vec![0u8; 6];
        patch_u16(&mut buf, 0, 0xBEEF);
        patch_u32(&mut buf, 2, 7);
        assert_eq!(buf, vec![0xEF, 0xBE, 7, 0, 0, 0]);
    }
}
