//! Key and value types for store collections, plus their binary codec.
//!
//! Keys order the way the engine iterates: page indices numerically,
//! composite (owner, index) pairs grouped by owner, names lexically. The
//! derived `Ord` relies on the variant order below; collections are
//! homogeneous in practice, so cross-variant ordering only has to be stable.
//!
//! Word arrays and blobs are reference-counted so that reading a large page
//! or ROM out of the store never copies the payload.

use std::sync::Arc;

use crate::encoding::{put_bytes, put_str, put_varint, put_words, Reader};
use crate::error::{Result, StoreError};

const KEY_INDEX: u8 = 0x01;
const KEY_OWNED: u8 = 0x02;
const KEY_NAME: u8 = 0x03;

const VALUE_WORD: u8 = 0x01;
const VALUE_FLAG: u8 = 0x02;
const VALUE_TEXT: u8 = 0x03;
const VALUE_BLOB: u8 = 0x04;
const VALUE_WORDS: u8 = 0x05;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    /// Page index within a flat image collection.
    Index(u32),
    /// (owner id, page index) for collections shared by multiple owners.
    Owned(u32, u32),
    /// String key for the kvs namespace and content-addressed blobs.
    Name(String),
}

impl Key {
    pub fn name(name: impl Into<String>) -> Self {
        Key::Name(name.into())
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Key::Index(i) => {
                buf.push(KEY_INDEX);
                put_varint(buf, u64::from(*i));
            }
            Key::Owned(owner, i) => {
                buf.push(KEY_OWNED);
                put_varint(buf, u64::from(*owner));
                put_varint(buf, u64::from(*i));
            }
            Key::Name(s) => {
                buf.push(KEY_NAME);
                put_str(buf, s);
            }
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        match r.u8()? {
            KEY_INDEX => Ok(Key::Index(r.varint_u32()?)),
            KEY_OWNED => Ok(Key::Owned(r.varint_u32()?, r.varint_u32()?)),
            KEY_NAME => Ok(Key::Name(r.str()?)),
            tag => Err(StoreError::Corrupt(format!("invalid key tag: {tag:#04x}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A single 32-bit scalar: a uniform page, a size, a CRC, a counter.
    Word(u32),
    Flag(bool),
    Text(String),
    Blob(Arc<Vec<u8>>),
    /// A raw page of 32-bit words.
    Words(Arc<Vec<u32>>),
}

impl Value {
    pub fn blob(bytes: Vec<u8>) -> Self {
        Value::Blob(Arc::new(bytes))
    }

    pub fn words(words: Vec<u32>) -> Self {
        Value::Words(Arc::new(words))
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn as_word(&self) -> Option<u32> {
        match self {
            Value::Word(w) => Some(*w),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::Flag(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Arc<Vec<u8>>> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_words(&self) -> Option<&Arc<Vec<u32>>> {
        match self {
            Value::Words(w) => Some(w),
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Word(w) => {
                buf.push(VALUE_WORD);
                put_varint(buf, u64::from(*w));
            }
            Value::Flag(f) => {
                buf.push(VALUE_FLAG);
                buf.push(u8::from(*f));
            }
            Value::Text(s) => {
                buf.push(VALUE_TEXT);
                put_str(buf, s);
            }
            Value::Blob(b) => {
                buf.push(VALUE_BLOB);
                put_bytes(buf, b);
            }
            Value::Words(w) => {
                buf.push(VALUE_WORDS);
                put_words(buf, w);
            }
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        match r.u8()? {
            VALUE_WORD => Ok(Value::Word(r.varint_u32()?)),
            VALUE_FLAG => match r.u8()? {
                0 => Ok(Value::Flag(false)),
                1 => Ok(Value::Flag(true)),
                b => Err(StoreError::Corrupt(format!("invalid flag byte: {b}"))),
            },
            VALUE_TEXT => Ok(Value::Text(r.str()?)),
            VALUE_BLOB => Ok(Value::blob(r.bytes()?)),
            VALUE_WORDS => Ok(Value::words(r.words()?)),
            tag => Err(StoreError::Corrupt(format!(
                "invalid value tag: {tag:#04x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_key(key: Key) {
        let mut buf = Vec::new();
        key.encode(&mut buf);
        let mut r = Reader::new(&buf);
        assert_eq!(Key::decode(&mut r).unwrap(), key);
        assert!(r.is_empty());
    }

    fn roundtrip_value(value: Value) {
        let mut buf = Vec::new();
        value.encode(&mut buf);
        let mut r = Reader::new(&buf);
        assert_eq!(Value::decode(&mut r).unwrap(), value);
        assert!(r.is_empty());
    }

    #[test]
    fn keys_roundtrip() {
        roundtrip_key(Key::Index(0));
        roundtrip_key(Key::Index(u32::MAX));
        roundtrip_key(Key::Owned(7, 4096));
        roundtrip_key(Key::name("cardMounted"));
    }

    #[test]
    fn values_roundtrip() {
        roundtrip_value(Value::Word(0xFFFF_FFFF));
        roundtrip_value(Value::Flag(true));
        roundtrip_value(Value::Flag(false));
        roundtrip_value(Value::text("SanDisk 64M"));
        roundtrip_value(Value::blob(vec![1, 2, 3]));
        roundtrip_value(Value::words(vec![0xDEAD_BEEF; 128]));
    }

    #[test]
    fn owned_keys_group_by_owner() {
        let mut keys = vec![
            Key::Owned(2, 0),
            Key::Owned(1, 500),
            Key::Owned(1, 3),
            Key::Owned(2, 1),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                Key::Owned(1, 3),
                Key::Owned(1, 500),
                Key::Owned(2, 0),
                Key::Owned(2, 1),
            ]
        );
    }

    #[test]
    fn invalid_tags_are_corrupt() {
        let mut r = Reader::new(&[0x7F, 0]);
        assert!(Key::decode(&mut r).is_err());

        let mut r = Reader::new(&[0x7F, 0]);
        assert!(Value::decode(&mut r).is_err());
    }
}
