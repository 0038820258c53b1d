//! # Commit Journal
//!
//! On-disk format of a store: a fixed file header followed by a sequence of
//! checksummed commit frames. Every transaction becomes exactly one frame,
//! so a frame either replays completely or is discarded completely.
//!
//! ## File Layout
//!
//! ```text
//! +--------------------+
//! | File header (32 B) |  magic, schema version at last compaction
//! +--------------------+
//! | Frame 0            |  24-byte frame header + op payload
//! +--------------------+
//! | Frame 1            |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! ```
//!
//! ## Frame Header (24 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  -----------------------------------------
//! 0       1     kind         1 = commit, 2 = schema upgrade
//! 1       3     reserved
//! 4       4     op_count     Number of ops in the payload
//! 8       4     payload_len  Payload bytes following the header
//! 12      4     version      New schema version (upgrade frames only)
//! 16      8     checksum     CRC64 over header fields and payload
//! ```
//!
//! ## Recovery
//!
//! A frame that ends past the file, carries an unknown kind, or fails its
//! checksum is a torn write when found at the tail during open: it is
//! logged and the file is truncated back to the last good frame. The same
//! condition during a mid-run refresh means another process wrote garbage
//! and is surfaced as corruption instead.
//!
//! All multi-byte header fields are little-endian via zerocopy wrappers;
//! the header structs transmute straight from the read buffer.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use tracing::warn;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Result, StoreError};

pub const STORE_MAGIC: &[u8; 16] = b"pagevault store\x00";
pub const FILE_HEADER_SIZE: usize = 32;
pub const FRAME_HEADER_SIZE: usize = 24;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FileHeader {
    magic: [u8; 16],
    version: U32,
    flags: U32,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    fn new(version: u32) -> Self {
        Self {
            magic: *STORE_MAGIC,
            version: U32::new(version),
            flags: U32::new(0),
            reserved: [0u8; 8],
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FrameHeader {
    kind: u8,
    reserved: [u8; 3],
    op_count: U32,
    payload_len: U32,
    version: U32,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Commit = 1,
    Upgrade = 2,
}

impl FrameKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(FrameKind::Commit),
            2 => Some(FrameKind::Upgrade),
            _ => None,
        }
    }
}

fn frame_checksum(kind: u8, op_count: u32, payload_len: u32, version: u32, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&[kind]);
    digest.update(&op_count.to_le_bytes());
    digest.update(&payload_len.to_le_bytes());
    digest.update(&version.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Opens (or creates) a journal. Returns the schema version recorded in
    /// the file header, which is the version at last compaction; upgrade
    /// frames replayed later may raise it.
    pub fn open(path: &Path) -> Result<(Journal, u32)> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            let header = FileHeader::new(0);
            file.write_all(header.as_bytes())?;
            file.sync_data()?;
            return Ok((
                Journal {
                    file,
                    path: path.to_path_buf(),
                },
                0,
            ));
        }

        if len < FILE_HEADER_SIZE as u64 {
            return Err(StoreError::corrupt("store file shorter than its header"));
        }

        let mut buf = [0u8; FILE_HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;
        let header = FileHeader::read_from_bytes(&buf)
            .map_err(|_| StoreError::corrupt("unreadable store file header"))?;

        if header.magic != *STORE_MAGIC {
            return Err(StoreError::corrupt("bad store magic"));
        }

        Ok((
            Journal {
                file,
                path: path.to_path_buf(),
            },
            header.version.get(),
        ))
    }

    /// Creates a fresh journal at `path`, truncating anything present.
    /// Used by compaction to build the replacement file.
    pub fn create(path: &Path, version: u32) -> Result<Journal> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let header = FileHeader::new(version);
        file.write_all(header.as_bytes())?;

        Ok(Journal {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Appends one frame and returns the number of bytes written. The
    /// header and payload go out in a single write.
    pub fn append(
        &mut self,
        kind: FrameKind,
        version: u32,
        op_count: u32,
        payload: &[u8],
        sync: bool,
    ) -> Result<u64> {
        let checksum = frame_checksum(kind as u8, op_count, payload.len() as u32, version, payload);
        let header = FrameHeader {
            kind: kind as u8,
            reserved: [0u8; 3],
            op_count: U32::new(op_count),
            payload_len: U32::new(payload.len() as u32),
            version: U32::new(version),
            checksum: U64::new(checksum),
        };

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(payload);

        self.file.write_all(&frame)?;
        if sync {
            self.file.sync_data()?;
        }

        Ok(frame.len() as u64)
    }

    /// Replays frames starting at byte offset `from`, invoking `f` for each
    /// valid frame, and returns the offset just past the last one.
    ///
    /// With `tolerate_torn_tail` an invalid frame ends the scan (open-time
    /// recovery); without it the same condition is corruption (a refresh
    /// must never see a half-written frame from a live writer, because
    /// frames are appended in a single write).
    pub fn scan<F>(&mut self, from: u64, tolerate_torn_tail: bool, mut f: F) -> Result<u64>
    where
        F: FnMut(FrameKind, u32, u32, &[u8]) -> Result<()>,
    {
        let len = self.file.metadata()?.len();
        self.file.seek(SeekFrom::Start(from))?;
        let mut reader = BufReader::new(&mut self.file);

        let mut offset = from;
        let mut payload = Vec::new();
        let mut torn: Option<String> = None;

        while offset < len {
            let remaining = len - offset;
            if remaining < FRAME_HEADER_SIZE as u64 {
                torn = Some(format!("{remaining} trailing bytes, no frame header"));
                break;
            }

            let mut header_buf = [0u8; FRAME_HEADER_SIZE];
            reader.read_exact(&mut header_buf)?;
            let header = FrameHeader::read_from_bytes(&header_buf)
                .map_err(|_| StoreError::corrupt("unreadable frame header"))?;

            let Some(kind) = FrameKind::from_byte(header.kind) else {
                torn = Some(format!("unknown frame kind {}", header.kind));
                break;
            };

            let payload_len = u64::from(header.payload_len.get());
            if remaining - (FRAME_HEADER_SIZE as u64) < payload_len {
                torn = Some(format!(
                    "frame payload of {payload_len} bytes ends past the file"
                ));
                break;
            }

            payload.resize(payload_len as usize, 0);
            reader.read_exact(&mut payload)?;

            let expected = frame_checksum(
                header.kind,
                header.op_count.get(),
                header.payload_len.get(),
                header.version.get(),
                &payload,
            );
            if expected != header.checksum.get() {
                torn = Some("frame checksum mismatch".to_string());
                break;
            }

            f(kind, header.version.get(), header.op_count.get(), &payload)?;
            offset += FRAME_HEADER_SIZE as u64 + payload_len;
        }

        if let Some(reason) = torn {
            if tolerate_torn_tail {
                warn!(offset, %reason, "discarding torn journal tail");
            } else {
                return Err(StoreError::Corrupt(format!(
                    "invalid journal frame at offset {offset}: {reason}"
                )));
            }
        }

        Ok(offset)
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_journal() -> (tempfile::TempDir, Journal) {
        let dir = tempfile::tempdir().unwrap();
        let (journal, version) = Journal::open(&dir.path().join("test.pv")).unwrap();
        assert_eq!(version, 0);
        (dir, journal)
    }

    #[test]
    fn fresh_journal_has_header_only() {
        let (_dir, journal) = temp_journal();
        assert_eq!(journal.len().unwrap(), FILE_HEADER_SIZE as u64);
    }

    #[test]
    fn append_then_scan_roundtrips() {
        let (_dir, mut journal) = temp_journal();

        journal
            .append(FrameKind::Commit, 0, 2, b"payload-a", false)
            .unwrap();
        journal
            .append(FrameKind::Upgrade, 6, 1, b"payload-b", false)
            .unwrap();

        let mut seen = Vec::new();
        let end = journal
            .scan(FILE_HEADER_SIZE as u64, false, |kind, version, ops, payload| {
                seen.push((kind, version, ops, payload.to_vec()));
                Ok(())
            })
            .unwrap();

        assert_eq!(end, journal.len().unwrap());
        assert_eq!(
            seen,
            vec![
                (FrameKind::Commit, 0, 2, b"payload-a".to_vec()),
                (FrameKind::Upgrade, 6, 1, b"payload-b".to_vec()),
            ]
        );
    }

    #[test]
    fn torn_tail_is_tolerated_on_open_scan() {
        let (_dir, mut journal) = temp_journal();

        journal
            .append(FrameKind::Commit, 0, 1, b"good", false)
            .unwrap();
        let good_end = journal.len().unwrap();

        // Simulate a torn write: half a frame header.
        journal.file.write_all(&[1, 0, 0, 0, 9, 9]).unwrap();

        let mut count = 0;
        let end = journal
            .scan(FILE_HEADER_SIZE as u64, true, |_, _, _, _| {
                count += 1;
                Ok(())
            })
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(end, good_end);
    }

    #[test]
    fn frame_with_payload_past_eof_is_a_torn_tail() {
        let (_dir, mut journal) = temp_journal();

        journal
            .append(FrameKind::Commit, 0, 1, b"good", false)
            .unwrap();
        let good_end = journal.len().unwrap();
        journal
            .append(FrameKind::Commit, 0, 1, b"truncated-payload", false)
            .unwrap();

        // Chop the tail frame mid-payload: its header declares more bytes
        // than the file holds.
        journal
            .truncate(good_end + FRAME_HEADER_SIZE as u64 + 4)
            .unwrap();

        let mut count = 0;
        let end = journal
            .scan(FILE_HEADER_SIZE as u64, true, |_, _, _, _| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(end, good_end);
    }

    #[test]
    fn torn_frame_is_corruption_during_refresh_scan() {
        let (_dir, mut journal) = temp_journal();

        journal
            .append(FrameKind::Commit, 0, 1, b"good", false)
            .unwrap();
        journal.file.write_all(&[1, 0, 0, 0, 9, 9]).unwrap();

        let result = journal.scan(FILE_HEADER_SIZE as u64, false, |_, _, _, _| Ok(()));
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let (_dir, mut journal) = temp_journal();

        journal
            .append(FrameKind::Commit, 0, 1, b"sensitive", false)
            .unwrap();

        // Flip one payload byte in place.
        let offset = FILE_HEADER_SIZE as u64 + FRAME_HEADER_SIZE as u64;
        let mut file = OpenOptions::new()
            .write(true)
            .open(journal.path())
            .unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(b"X").unwrap();
        drop(file);

        let result = journal.scan(FILE_HEADER_SIZE as u64, false, |_, _, _, _| Ok(()));
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn reopen_reads_back_header_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pv");

        let journal = Journal::create(&path, 6).unwrap();
        drop(journal);

        let (_journal, version) = Journal::open(&path).unwrap();
        assert_eq!(version, 6);
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pv");
        std::fs::write(&path, vec![0xAAu8; FILE_HEADER_SIZE]).unwrap();

        assert!(matches!(
            Journal::open(&path),
            Err(StoreError::Corrupt(_))
        ));
    }
}
