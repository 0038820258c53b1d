//! # Store Substrate
//!
//! A small transactional object store backing the persistence engine. The
//! store holds a closed set of named collections, each an ordered map from
//! [`Key`] to [`Value`], kept fully in memory and made durable through an
//! append-only commit journal (`journal`).
//!
//! ## Why a journal
//!
//! The working set the engine persists is small relative to the nominal
//! device sizes (uniform pages collapse to one word, empty pages are not
//! stored at all), so replaying a journal of committed frames on open is
//! cheap, and appending one checksummed frame per transaction gives
//! all-or-nothing commits without page-level bookkeeping. `compact`
//! rewrites the journal down to a single full-state frame.
//!
//! ## Module Organization
//!
//! - `value`: key and value types plus their binary codec
//! - `journal`: file format, frame checksums, replay and append
//! - `store`: the `Store` itself, transactions, upgrades, compaction
//!
//! ## Concurrency
//!
//! One store instance is single-threaded; cross-instance arbitration is the
//! engine's lock collection plus the commit-time conflict check in
//! `store::Transaction::commit`.

mod journal;
mod store;
mod value;

pub use journal::{FrameKind, Journal, FILE_HEADER_SIZE, FRAME_HEADER_SIZE, STORE_MAGIC};
pub use store::{Store, StoreOptions, Transaction};
pub use value::{Key, Value};

/// The closed set of named collections in a store.
///
/// Collections come into existence through `CreateCollection` ops written by
/// schema migrations; touching a collection that was never created is a
/// corruption error.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Single-record collection holding the current write-lock token.
    Lock = 0x01,
    /// Flat key/value namespace for scalar metadata.
    Kvs = 0x02,
    /// Device flash pages, keyed by page index.
    Nand = 0x03,
    /// Storage card records, keyed by card id.
    Card = 0x04,
    /// Storage card pages, keyed by (card id, page index).
    Storage = 0x05,
    /// Session records, keyed by session id.
    Session = 0x06,
    /// Content-addressed ROM blobs, keyed by hash.
    Rom = 0x07,
    /// Saved execution state blobs, keyed by session id.
    State = 0x08,
    /// Session RAM pages, keyed by (session id, page index).
    Memory = 0x09,
    /// Per-session RAM metadata (size and CRC), keyed by session id.
    MemoryMeta = 0x0A,
}

impl Collection {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Collection::Lock),
            0x02 => Some(Collection::Kvs),
            0x03 => Some(Collection::Nand),
            0x04 => Some(Collection::Card),
            0x05 => Some(Collection::Storage),
            0x06 => Some(Collection::Session),
            0x07 => Some(Collection::Rom),
            0x08 => Some(Collection::State),
            0x09 => Some(Collection::Memory),
            0x0A => Some(Collection::MemoryMeta),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Collection::Lock => "lock",
            Collection::Kvs => "kvs",
            Collection::Nand => "nand",
            Collection::Card => "card",
            Collection::Storage => "storage",
            Collection::Session => "session",
            Collection::Rom => "rom",
            Collection::State => "state",
            Collection::Memory => "memory",
            Collection::MemoryMeta => "memoryMeta",
        }
    }

    pub const ALL: [Collection; 10] = [
        Collection::Lock,
        Collection::Kvs,
        Collection::Nand,
        Collection::Card,
        Collection::Storage,
        Collection::Session,
        Collection::Rom,
        Collection::State,
        Collection::Memory,
        Collection::MemoryMeta,
    ];
}
