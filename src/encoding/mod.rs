//! # Binary Encoding Helpers
//!
//! Cursor-style reader and append-style writer functions shared by the
//! journal op codec, the key/value codec, and the structured record codec.
//! All lengths and integers use the varint format from [`varint`]; strings
//! are varint-length-prefixed UTF-8; word arrays are varint-counted
//! little-endian u32s.
//!
//! Decoding failures are corruption errors: the journal is checksummed per
//! frame, so a payload that fails to decode means either a bug or on-disk
//! damage, never a partial write.

pub mod varint;

use crate::error::{Result, StoreError};
use varint::{decode_varint, encode_varint};

pub fn put_varint(buf: &mut Vec<u8>, value: u64) {
    let mut scratch = [0u8; 9];
    let n = encode_varint(value, &mut scratch);
    buf.extend_from_slice(&scratch[..n]);
}

pub fn put_str(buf: &mut Vec<u8>, value: &str) {
    put_varint(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

pub fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    put_varint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

pub fn put_words(buf: &mut Vec<u8>, words: &[u32]) {
    put_varint(buf, words.len() as u64);
    for word in words {
        buf.extend_from_slice(&word.to_le_bytes());
    }
}

/// Forward-only cursor over an encoded payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| StoreError::corrupt("truncated payload: expected byte"))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn varint(&mut self) -> Result<u64> {
        let (value, read) = decode_varint(&self.buf[self.pos..])?;
        self.pos += read;
        Ok(value)
    }

    pub fn varint_u32(&mut self) -> Result<u32> {
        let value = self.varint()?;
        u32::try_from(value)
            .map_err(|_| StoreError::Corrupt(format!("value {value} exceeds u32 range")))
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(StoreError::Corrupt(format!(
                "truncated payload: expected {len} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.varint()? as usize;
        Ok(self.slice(len)?.to_vec())
    }

    pub fn str(&mut self) -> Result<String> {
        let len = self.varint()? as usize;
        let raw = self.slice(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| StoreError::corrupt("invalid UTF-8 in string payload"))
    }

    pub fn words(&mut self) -> Result<Vec<u32>> {
        let count = self.varint()? as usize;
        let raw = self.slice(count.checked_mul(4).ok_or_else(|| {
            StoreError::corrupt("word array length overflow")
        })?)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_roundtrip() {
        let mut buf = Vec::new();
        put_str(&mut buf, "nandName");
        put_str(&mut buf, "");

        let mut r = Reader::new(&buf);
        assert_eq!(r.str().unwrap(), "nandName");
        assert_eq!(r.str().unwrap(), "");
        assert!(r.is_empty());
    }

    #[test]
    fn words_roundtrip_little_endian() {
        let mut buf = Vec::new();
        put_words(&mut buf, &[0x0102_0304, 0xFFFF_FFFF]);

        assert_eq!(buf[0], 2);
        assert_eq!(&buf[1..5], &[0x04, 0x03, 0x02, 0x01]);

        let mut r = Reader::new(&buf);
        assert_eq!(r.words().unwrap(), vec![0x0102_0304, 0xFFFF_FFFF]);
    }

    #[test]
    fn truncated_string_is_corrupt() {
        let mut buf = Vec::new();
        put_str(&mut buf, "hello");
        buf.truncate(3);

        let mut r = Reader::new(&buf);
        assert!(r.str().is_err());
    }

    #[test]
    fn varint_u32_rejects_wide_values() {
        let mut buf = Vec::new();
        put_varint(&mut buf, u64::from(u32::MAX) + 1);

        let mut r = Reader::new(&buf);
        assert!(r.varint_u32().is_err());
    }
}
