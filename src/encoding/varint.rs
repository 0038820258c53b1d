//! # Variable-Length Integer Encoding
//!
//! Space-efficient integer encoding used throughout the journal payload
//! format for keys, lengths, and counters.
//!
//! The leading byte selects the width:
//!
//! | Value range           | Bytes | Format                            |
//! |-----------------------|-------|-----------------------------------|
//! | 0 - 240               | 1     | `[value]`                         |
//! | 241 - 2287            | 2     | `[241 + (v-240)>>8, (v-240)&FF]`  |
//! | 2288 - 67823          | 3     | `[249, (v-2288)>>8, (v-2288)&FF]` |
//! | 67824 - 16777215      | 4     | `[250, 3-byte big-endian]`        |
//! | 16777216 - 4294967295 | 5     | `[251, 4-byte big-endian]`        |
//! | 4294967296 - u64::MAX | 9     | `[255, 8-byte big-endian]`        |
//!
//! Markers 252-254 are reserved; decoding them is a corruption error, as is
//! any truncated encoding. Page indices and record counters fit in one or
//! two bytes, which keeps commit frames close to the size of the raw page
//! payload they carry.

use crate::error::{Result, StoreError};

pub fn varint_len(value: u64) -> usize {
    if value <= 240 {
        1
    } else if value <= 2287 {
        2
    } else if value <= 67823 {
        3
    } else if value <= 0xFF_FFFF {
        4
    } else if value <= 0xFFFF_FFFF {
        5
    } else {
        9
    }
}

pub fn encode_varint(value: u64, buf: &mut [u8]) -> usize {
    if value <= 240 {
        buf[0] = value as u8;
        1
    } else if value <= 2287 {
        let v = value - 240;
        buf[0] = ((v >> 8) + 241) as u8;
        buf[1] = (v & 0xFF) as u8;
        2
    } else if value <= 67823 {
        let v = value - 2288;
        buf[0] = 249;
        buf[1] = (v >> 8) as u8;
        buf[2] = (v & 0xFF) as u8;
        3
    } else if value <= 0xFF_FFFF {
        buf[0] = 250;
        buf[1] = (value >> 16) as u8;
        buf[2] = (value >> 8) as u8;
        buf[3] = value as u8;
        4
    } else if value <= 0xFFFF_FFFF {
        buf[0] = 251;
        buf[1] = (value >> 24) as u8;
        buf[2] = (value >> 16) as u8;
        buf[3] = (value >> 8) as u8;
        buf[4] = value as u8;
        5
    } else {
        buf[0] = 255;
        buf[1..9].copy_from_slice(&value.to_be_bytes());
        9
    }
}

pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let first = *buf
        .first()
        .ok_or_else(|| StoreError::corrupt("empty buffer for varint decode"))?;

    if first <= 240 {
        Ok((first as u64, 1))
    } else if first <= 248 {
        if buf.len() < 2 {
            return Err(StoreError::corrupt("truncated 2-byte varint"));
        }
        let value = 240 + ((first as u64 - 241) << 8) + buf[1] as u64;
        Ok((value, 2))
    } else if first == 249 {
        if buf.len() < 3 {
            return Err(StoreError::corrupt("truncated 3-byte varint"));
        }
        let value = 2288 + ((buf[1] as u64) << 8) + buf[2] as u64;
        Ok((value, 3))
    } else if first == 250 {
        if buf.len() < 4 {
            return Err(StoreError::corrupt("truncated 4-byte varint"));
        }
        let value = ((buf[1] as u64) << 16) + ((buf[2] as u64) << 8) + buf[3] as u64;
        Ok((value, 4))
    } else if first == 251 {
        if buf.len() < 5 {
            return Err(StoreError::corrupt("truncated 5-byte varint"));
        }
        let value = ((buf[1] as u64) << 24)
            + ((buf[2] as u64) << 16)
            + ((buf[3] as u64) << 8)
            + buf[4] as u64;
        Ok((value, 5))
    } else if first == 255 {
        if buf.len() < 9 {
            return Err(StoreError::corrupt("truncated 9-byte varint"));
        }
        let value = u64::from_be_bytes(buf[1..9].try_into().unwrap()); // INVARIANT: length validated above
        Ok((value, 9))
    } else {
        Err(StoreError::Corrupt(format!(
            "invalid varint marker: {first}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_len_matches_width_table() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(240), 1);
        assert_eq!(varint_len(241), 2);
        assert_eq!(varint_len(2287), 2);
        assert_eq!(varint_len(2288), 3);
        assert_eq!(varint_len(67823), 3);
        assert_eq!(varint_len(67824), 4);
        assert_eq!(varint_len(0xFF_FFFF), 4);
        assert_eq!(varint_len(0x100_0000), 5);
        assert_eq!(varint_len(0xFFFF_FFFF), 5);
        assert_eq!(varint_len(0x1_0000_0000), 9);
        assert_eq!(varint_len(u64::MAX), 9);
    }

    #[test]
    fn roundtrip_boundary_values() {
        let boundary_values = [
            0u64,
            1,
            240,
            241,
            2287,
            2288,
            67823,
            67824,
            0xFF_FFFF,
            0x100_0000,
            0xFFFF_FFFF,
            0x1_0000_0000,
            u64::MAX,
        ];

        for &value in &boundary_values {
            let mut buf = [0u8; 9];
            let encoded_len = encode_varint(value, &mut buf);
            let (decoded, decoded_len) = decode_varint(&buf).unwrap();

            assert_eq!(encoded_len, decoded_len, "length mismatch for {value}");
            assert_eq!(value, decoded, "value mismatch for {value}");
            assert_eq!(varint_len(value), encoded_len);
        }
    }

    #[test]
    fn decode_empty_buffer_fails() {
        assert!(decode_varint(&[]).is_err());
    }

    #[test]
    fn decode_truncated_encodings_fail() {
        assert!(decode_varint(&[241u8]).is_err());
        assert!(decode_varint(&[249u8, 0]).is_err());
        assert!(decode_varint(&[250u8, 0, 0]).is_err());
        assert!(decode_varint(&[251u8, 0, 0, 0]).is_err());
        assert!(decode_varint(&[255u8, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn decode_reserved_markers_fail() {
        for marker in 252u8..=254 {
            assert!(decode_varint(&[marker, 0, 0, 0, 0]).is_err());
        }
    }
}
