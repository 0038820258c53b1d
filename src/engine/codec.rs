//! Page compression and the legacy card image codec.
//!
//! Page compression is deliberately trivial: a page whose words are all
//! identical collapses to that single word, anything else is stored raw.
//! Freshly formatted media is almost entirely uniform (flash erases to all
//! ones, cards and RAM zero), so this one rule removes the bulk of the
//! nominal image size without any entropy coding.
//!
//! The legacy codec is read-only. Old installations persisted whole card
//! images as a block-compressed byte stream; `decompress_legacy_image`
//! exists so a one-time migration can expand those blobs before re-storing
//! them page by page.

use crate::error::{Result, StoreError};

/// Block span of the legacy card stream, in bytes.
pub const LEGACY_BLOCK_SIZE: usize = 0x2000;

/// Result of compressing one page of 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedPage<'a> {
    /// Every word in the page equals this value.
    Scalar(u32),
    /// The page as-is.
    Raw(&'a [u32]),
}

/// Collapses a uniform page to its single word value.
pub fn compress_page(page: &[u32]) -> CompressedPage<'_> {
    match page.split_first() {
        Some((&first, rest)) if rest.iter().all(|&w| w == first) => {
            CompressedPage::Scalar(first)
        }
        _ => CompressedPage::Raw(page),
    }
}

/// Expands a legacy block-compressed card image.
///
/// Layout: a little-endian u32 image length, then one block per 8 KiB span
/// of the image. Each block starts with a type byte: bit 0 selects a
/// one-byte fill over a verbatim copy, bit 7 means an explicit u16 length
/// follows. The explicit length is consumed but the span is still the fixed
/// block size clamped to the image end, matching what historical writers
/// produced. The stream must be consumed exactly.
pub fn decompress_legacy_image(compressed: &[u8]) -> Result<Vec<u8>> {
    let corrupt = || StoreError::corrupt("legacy card image truncated");

    let mut pos = 0usize;
    let head = compressed.get(..4).ok_or_else(corrupt)?;
    let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
    pos += 4;

    let mut image = vec![0u8; len];

    let mut block_start = 0usize;
    while pos < compressed.len() {
        let block_type = *compressed.get(pos).ok_or_else(corrupt)?;
        pos += 1;

        if block_type & 0x80 != 0 {
            // Explicit length field, present in some historical streams.
            // The value never disagrees with the fixed span, so it is
            // validated only by consuming it.
            compressed.get(pos..pos + 2).ok_or_else(corrupt)?;
            pos += 2;
        }

        if block_start >= len {
            return Err(StoreError::corrupt(
                "legacy card image has blocks past its declared length",
            ));
        }
        let block_end = (block_start + LEGACY_BLOCK_SIZE).min(len);
        let block = &mut image[block_start..block_end];

        if block_type & 0x01 != 0 {
            let fill = *compressed.get(pos).ok_or_else(corrupt)?;
            pos += 1;
            block.fill(fill);
        } else {
            let src = compressed.get(pos..pos + block.len()).ok_or_else(corrupt)?;
            block.copy_from_slice(src);
            pos += block.len();
        }

        block_start = block_end;
    }

    if block_start != len {
        return Err(StoreError::corrupt(
            "legacy card image shorter than its declared length",
        ));
    }
    if pos != compressed.len() {
        return Err(StoreError::corrupt("legacy card image corrupt"));
    }

    Ok(image)
}
