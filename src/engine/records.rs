//! Structured records stored as blobs: sessions, storage cards, and
//! per-session RAM metadata.
//!
//! Records are varint-encoded field sequences. New fields are only ever
//! appended, and decoders treat an exhausted reader as "the rest take their
//! defaults", so records written by older builds keep decoding after a
//! schema upgrade without a rewrite pass.

use crate::encoding::{put_str, put_varint, Reader};
use crate::error::Result;
use crate::store::Value;

/// An emulator session: a device instance bound to a ROM and a RAM size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: u32,
    pub name: String,
    /// Device model identifier.
    pub device: String,
    /// Hex digest naming the ROM blob this session boots from.
    pub rom: String,
    /// RAM image size in bytes.
    pub ram_size: u32,
}

impl Session {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_varint(buf, u64::from(self.id));
        put_str(buf, &self.name);
        put_str(buf, &self.device);
        put_str(buf, &self.rom);
        put_varint(buf, u64::from(self.ram_size));
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            id: r.varint_u32()?,
            name: r.str()?,
            device: r.str()?,
            rom: r.str()?,
            ram_size: r.varint_u32()?,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        Value::blob(buf)
    }
}

/// A storage card record. Page data lives separately, keyed by
/// (card id, page index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCard {
    pub id: u32,
    pub name: String,
    /// Card image size in bytes.
    pub size: u32,
    /// Stable identity carried inside snapshots, independent of the
    /// store-assigned id. Empty until derived.
    pub card_id: String,
    pub mounted: bool,
    /// Checksum of the card image at last write, if it was computed.
    pub crc: Option<u32>,
}

impl StorageCard {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_varint(buf, u64::from(self.id));
        put_str(buf, &self.name);
        put_varint(buf, u64::from(self.size));
        put_str(buf, &self.card_id);
        buf.push(u8::from(self.mounted));
        encode_opt_crc(buf, self.crc);
    }

    /// Fields after `size` default when absent: records written before
    /// identity derivation existed stop there.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let id = r.varint_u32()?;
        let name = r.str()?;
        let size = r.varint_u32()?;

        let card_id = if r.is_empty() { String::new() } else { r.str()? };
        let mounted = if r.is_empty() { false } else { r.u8()? != 0 };
        let crc = decode_opt_crc(r)?;

        Ok(Self {
            id,
            name,
            size,
            card_id,
            mounted,
            crc,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        Value::blob(buf)
    }
}

/// Size and checksum of one session's RAM image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMeta {
    pub total_size: u32,
    pub crc: Option<u32>,
}

impl MemoryMeta {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_varint(buf, u64::from(self.total_size));
        encode_opt_crc(buf, self.crc);
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            total_size: r.varint_u32()?,
            crc: decode_opt_crc(r)?,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        Value::blob(buf)
    }
}

fn encode_opt_crc(buf: &mut Vec<u8>, crc: Option<u32>) {
    match crc {
        Some(crc) => {
            buf.push(1);
            put_varint(buf, u64::from(crc));
        }
        None => buf.push(0),
    }
}

fn decode_opt_crc(r: &mut Reader<'_>) -> Result<Option<u32>> {
    if r.is_empty() {
        return Ok(None);
    }
    match r.u8()? {
        0 => Ok(None),
        _ => Ok(Some(r.varint_u32()?)),
    }
}
