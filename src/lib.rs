//! # pagevault - Paged Persistence for Emulator State
//!
//! pagevault persists the state of an emulated device into a single local
//! file: sparse binary memory images (device flash, storage cards, RAM),
//! session and key/value metadata, savestates, and incremental snapshots.
//! It is built for the emulator host loop:
//!
//! - **Sparse by construction**: uniform pages collapse to one word and
//!   empty pages are never stored, so a 33 MB flash image full of erased
//!   pages costs almost nothing
//! - **Incremental snapshots**: the emulator hands over only the pages it
//!   dirtied; they are applied on top of the stored image in one atomic
//!   commit
//! - **Single writer, many tabs**: a token in the store arbitrates between
//!   instances; a displaced instance deactivates itself and never writes
//!   again
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagevault::Engine;
//!
//! let engine = Engine::builder("./state.pv")
//!     .sync_writes(false)
//!     .open()?;
//!
//! let session = engine.add_session("My Pilot", "PalmTungstenE2",
//!     16 * 1024 * 1024, &rom, None, None)?;
//! let image = engine.load_session(session.id, true)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Engine)           │
//! ├─────────────────────────────────────┤
//! │ Sessions │ Cards │ Flash │ Snapshots │
//! ├─────────────────────────────────────┤
//! │  Page Codec │ Lock Arbiter │ Records │
//! ├─────────────────────────────────────┤
//! │   Store (collections, transactions)  │
//! ├─────────────────────────────────────┤
//! │  Commit Journal (checksummed frames) │
//! └─────────────────────────────────────┘
//! ```
//!
//! The store keeps every collection in memory and replays an append-only
//! journal of checksummed commit frames on open; schema migrations are
//! journal frames too, so an upgrade is atomic with the data it rewrites.

pub mod encoding;
pub mod engine;
pub mod error;
pub mod store;

pub use engine::records::{MemoryMeta, Session, StorageCard};
pub use engine::snapshot::{Snapshot, SnapshotPages};
pub use engine::{
    CardChange, Engine, EngineBuilder, EngineEvents, IntegrityWarning, NandImage, SessionChange,
    SessionImage, EMPTY_WORD_CARD, EMPTY_WORD_NAND, EMPTY_WORD_RAM, NAND_SIZE, PAGE_SIZE_CARD,
    PAGE_SIZE_NAND, PAGE_SIZE_RAM,
};
pub use error::{FatalReason, Result, StoreError};
pub use store::Value;
