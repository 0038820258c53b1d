//! # Persistence Engine
//!
//! The public face of the crate: sessions, storage cards, the device flash
//! image, key/value metadata, and incremental snapshots, all persisted
//! through the transactional store in `crate::store`.
//!
//! ## Operation shape
//!
//! Every public operation is one transaction. The engine holds a single
//! mutex around its interior, so operations are atomic with respect to each
//! other in-process; cross-process exclusion is the lock arbiter's token
//! protocol. Each transaction starts by re-checking the token, and the
//! first failure of a fatal kind (corruption, lock loss, schema mismatch,
//! I/O) permanently deactivates the instance: the store is closed, the
//! fatal event fires once, and every later call reports the same reason.
//!
//! Change notifications are queued during the transaction and dispatched
//! only after it commits and the engine mutex is released, so subscribers
//! may call straight back into the engine.

pub mod codec;
pub mod event;
pub mod kvs;
pub mod lock;
pub mod migrations;
pub mod paged;
pub mod records;
pub mod snapshot;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use parking_lot::Mutex;
use rand::RngCore;
use smallvec::SmallVec;
use tracing::warn;

use crate::encoding::Reader;
use crate::error::{FatalReason, Result, StoreError};
use crate::store::{Collection, Key, Store, StoreOptions, Transaction, Value};

use event::Event;
use kvs::{allocate_id, KVS_NAND_CRC, KVS_NAND_NAME, KVS_NEXT_CARD_ID, KVS_NEXT_SESSION_ID};
use lock::LockArbiter;
use migrations::{run_chain, SCHEMA_VERSION};
use paged::{read_image, write_image, ImageGeometry, PageKeys};
use records::{MemoryMeta, Session, StorageCard};
use snapshot::{write_snapshot_pages, PagePool, Snapshot};

/// Device flash geometry: 528-byte pages in pairs, 1024 blocks of 32.
pub const NAND_SIZE: u32 = 528 * 2 * 1024 * 32;
pub const PAGE_SIZE_NAND: u32 = 528 * 8;
pub const EMPTY_WORD_NAND: u32 = 0xFFFF_FFFF;

pub const PAGE_SIZE_CARD: u32 = 8192;
pub const EMPTY_WORD_CARD: u32 = 0;

pub const PAGE_SIZE_RAM: u32 = 512;
pub const EMPTY_WORD_RAM: u32 = 0;

/// Name stored for the flash image after `clear_nand`.
pub const BLANK_NAND_NAME: &str = "[blank]";

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checksum used for image integrity records.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// 128-bit random identifier as lowercase hex. Used for lock tokens and
/// card identities.
pub(crate) fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut id = String::with_capacity(32);
    for byte in bytes {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

fn nand_geometry() -> ImageGeometry {
    ImageGeometry::new(NAND_SIZE, PAGE_SIZE_NAND, EMPTY_WORD_NAND)
}

fn card_geometry(size: u32) -> ImageGeometry {
    ImageGeometry::new(size, PAGE_SIZE_CARD, EMPTY_WORD_CARD)
}

fn ram_geometry(size: u32) -> ImageGeometry {
    ImageGeometry::new(size, PAGE_SIZE_RAM, EMPTY_WORD_RAM)
}

/// A session changed or was removed.
#[derive(Debug, Clone)]
pub struct SessionChange {
    pub id: u32,
    /// `None` when the session was deleted.
    pub session: Option<Session>,
}

/// A storage card changed or was removed.
#[derive(Debug, Clone)]
pub struct CardChange {
    pub id: u32,
    pub card: Option<StorageCard>,
}

/// A stored checksum disagreed with the data read back. Non-fatal; the
/// data is still returned.
#[derive(Debug, Clone)]
pub struct IntegrityWarning {
    pub what: &'static str,
    pub id: u32,
    pub expected: u32,
    pub actual: u32,
}

#[derive(Default)]
pub struct EngineEvents {
    pub session_changed: Event<SessionChange>,
    pub card_changed: Event<CardChange>,
    pub integrity_warning: Event<IntegrityWarning>,
    pub fatal: Event<FatalReason>,
}

enum Notice {
    Session(SessionChange),
    Card(CardChange),
    Integrity(IntegrityWarning),
}

/// Everything `load_session` hands back in one read.
#[derive(Debug, Clone)]
pub struct SessionImage {
    pub session: Session,
    pub rom: Vec<u8>,
    pub memory: Option<Vec<u8>>,
    pub savestate: Option<Vec<u8>>,
}

/// Flash image with its display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NandImage {
    pub name: String,
    pub data: Vec<u8>,
}

struct Pools {
    nand: PagePool,
    card: PagePool,
    ram: PagePool,
}

struct Inner {
    store: Store,
    arbiter: LockArbiter,
    pools: Pools,
    fatal: Option<FatalReason>,
    verify_crc: bool,
}

struct TxExtras<'a> {
    pools: &'a mut Pools,
    notices: &'a mut Vec<Notice>,
    verify_crc: bool,
}

impl TxExtras<'_> {
    /// Compares a stored image checksum against freshly read data. A
    /// mismatch warns and queues an integrity notice; it never fails the
    /// read.
    fn check_image_crc(
        &mut self,
        what: &'static str,
        id: u32,
        stored: Option<u32>,
        data: &[u8],
        crc_check: bool,
    ) {
        if !(self.verify_crc && crc_check) {
            return;
        }
        let Some(expected) = stored else {
            return;
        };
        let actual = crc32(data);
        if actual != expected {
            warn!(what, id, expected, actual, "image checksum mismatch");
            self.notices.push(Notice::Integrity(IntegrityWarning {
                what,
                id,
                expected,
                actual,
            }));
        }
    }
}

pub struct EngineBuilder {
    path: PathBuf,
    sync_writes: bool,
    verify_crc: bool,
}

impl EngineBuilder {
    /// Fsync the journal on every commit. Defaults to off: emulator state
    /// is reconstructible and the per-frame checksum already confines a
    /// crash to the newest commits.
    pub fn sync_writes(mut self, on: bool) -> Self {
        self.sync_writes = on;
        self
    }

    /// Default for checksum verification on reads. The per-call flag is
    /// only honored when this is on.
    pub fn verify_crc(mut self, on: bool) -> Self {
        self.verify_crc = on;
        self
    }

    /// Opens the store, runs pending migrations, and claims the write
    /// lock, displacing any other live instance.
    pub fn open(self) -> Result<Engine> {
        let mut store = Store::open(
            &self.path,
            StoreOptions {
                sync_writes: self.sync_writes,
            },
        )?;
        store.upgrade(SCHEMA_VERSION, |tx, old| run_chain(tx, old, SCHEMA_VERSION))?;

        let mut arbiter = LockArbiter::new();
        let mut tx = store.begin(&[Collection::Lock])?;
        arbiter.acquire(&mut tx)?;
        tx.commit()?;

        Ok(Engine {
            inner: Mutex::new(Inner {
                store,
                arbiter,
                pools: Pools {
                    nand: PagePool::new((PAGE_SIZE_NAND / 4) as usize),
                    card: PagePool::new((PAGE_SIZE_CARD / 4) as usize),
                    ram: PagePool::new((PAGE_SIZE_RAM / 4) as usize),
                },
                fatal: None,
                verify_crc: self.verify_crc,
            }),
            events: EngineEvents::default(),
        })
    }
}

pub struct Engine {
    inner: Mutex<Inner>,
    events: EngineEvents,
}

impl Engine {
    pub fn builder(path: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder {
            path: path.into(),
            sync_writes: false,
            verify_crc: true,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Engine> {
        Engine::builder(path.as_ref()).open()
    }

    pub fn events(&self) -> &EngineEvents {
        &self.events
    }

    /// Why this instance is deactivated, if it is.
    pub fn fatal_reason(&self) -> Option<FatalReason> {
        self.inner.lock().fatal
    }

    /// Runs one lock-checked transaction. Fatal-class failures deactivate
    /// the engine; notices and the fatal event are dispatched after the
    /// mutex is released.
    fn with_tx<T>(
        &self,
        scope: &[Collection],
        f: impl FnOnce(&mut Transaction<'_>, &mut TxExtras<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut notices = Vec::new();
        let mut fatal_notice = None;

        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if let Some(reason) = inner.fatal {
                return Err(StoreError::Deactivated(reason));
            }
            let was_closed = inner.store.is_closed();

            let outcome: Result<T> = (|| {
                let mut full_scope: SmallVec<[Collection; 8]> = SmallVec::from_slice(scope);
                if !full_scope.contains(&Collection::Lock) {
                    full_scope.push(Collection::Lock);
                }
                let mut tx = inner.store.begin(&full_scope)?;
                inner.arbiter.check(&tx)?;
                let mut extras = TxExtras {
                    pools: &mut inner.pools,
                    notices: &mut notices,
                    verify_crc: inner.verify_crc,
                };
                let value = f(&mut tx, &mut extras)?;
                tx.commit()?;
                Ok(value)
            })();

            if let Err(err) = &outcome {
                // A voluntarily closed store fails with Closed; that is
                // not a new fatal condition.
                if !was_closed {
                    if let Some(reason) = err.fatal_reason() {
                        inner.fatal = Some(reason);
                        inner.store.close();
                        fatal_notice = Some(reason);
                    }
                }
            }
            outcome
        };

        if let Some(reason) = fatal_notice {
            self.events.fatal.dispatch(&reason);
        }
        if result.is_ok() {
            for notice in notices {
                match notice {
                    Notice::Session(change) => self.events.session_changed.dispatch(&change),
                    Notice::Card(change) => self.events.card_changed.dispatch(&change),
                    Notice::Integrity(warning) => {
                        self.events.integrity_warning.dispatch(&warning)
                    }
                }
            }
        }
        result
    }

    // ---- kvs ----

    pub fn kvs_get(&self, key: &str) -> Result<Option<Value>> {
        self.with_tx(&[Collection::Kvs], |tx, _| {
            tx.get(Collection::Kvs, &Key::name(key))
        })
    }

    pub fn kvs_put(&self, key: &str, value: Value) -> Result<()> {
        self.with_tx(&[Collection::Kvs], |tx, _| {
            tx.put(Collection::Kvs, Key::name(key), value)
        })
    }

    pub fn kvs_delete(&self, key: &str) -> Result<()> {
        self.with_tx(&[Collection::Kvs], |tx, _| {
            tx.delete(Collection::Kvs, Key::name(key))
        })
    }

    /// Reads several keys in one transaction, in input order.
    pub fn kvs_load(&self, keys: &[&str]) -> Result<Vec<Option<Value>>> {
        self.with_tx(&[Collection::Kvs], |tx, _| {
            keys.iter()
                .map(|key| tx.get(Collection::Kvs, &Key::name(*key)))
                .collect()
        })
    }

    // ---- device flash ----

    /// Replaces the flash image. The image must be exactly the device
    /// size.
    pub fn put_nand(&self, name: &str, data: &[u8]) -> Result<()> {
        if data.len() != NAND_SIZE as usize {
            return Err(StoreError::InvalidImage(format!(
                "flash image is {} bytes, device holds {NAND_SIZE}",
                data.len()
            )));
        }
        self.with_tx(&[Collection::Kvs, Collection::Nand], |tx, _| {
            tx.put(Collection::Kvs, Key::name(KVS_NAND_NAME), Value::text(name))?;
            tx.put(
                Collection::Kvs,
                Key::name(KVS_NAND_CRC),
                Value::Word(crc32(data)),
            )?;
            write_image(
                tx,
                Collection::Nand,
                PageKeys::Flat,
                PAGE_SIZE_NAND,
                EMPTY_WORD_NAND,
                Some(data),
            )
        })
    }

    /// Reads the flash image back, or `None` if none was ever stored.
    pub fn read_nand(&self, crc_check: bool) -> Result<Option<NandImage>> {
        self.with_tx(&[Collection::Kvs, Collection::Nand], |tx, extras| {
            let Some(name) = tx
                .get(Collection::Kvs, &Key::name(KVS_NAND_NAME))?
                .and_then(|v| v.as_text().map(str::to_string))
            else {
                return Ok(None);
            };
            let data = read_image(tx, Collection::Nand, PageKeys::Flat, nand_geometry())?;
            let stored = tx
                .get(Collection::Kvs, &Key::name(KVS_NAND_CRC))?
                .and_then(|v| v.as_word());
            extras.check_image_crc("nand", 0, stored, &data, crc_check);
            Ok(Some(NandImage { name, data }))
        })
    }

    /// Drops the flash image and marks the device blank.
    pub fn clear_nand(&self) -> Result<()> {
        self.with_tx(&[Collection::Kvs, Collection::Nand], |tx, _| {
            tx.put(
                Collection::Kvs,
                Key::name(KVS_NAND_NAME),
                Value::text(BLANK_NAND_NAME),
            )?;
            tx.delete(Collection::Kvs, Key::name(KVS_NAND_CRC))?;
            write_image(
                tx,
                Collection::Nand,
                PageKeys::Flat,
                PAGE_SIZE_NAND,
                EMPTY_WORD_NAND,
                None,
            )
        })
    }

    // ---- sessions ----

    /// Creates a session. The ROM blob is content addressed: two sessions
    /// sharing a ROM store it once.
    pub fn add_session(
        &self,
        name: &str,
        device: &str,
        ram_size: u32,
        rom: &[u8],
        memory: Option<&[u8]>,
        state: Option<&[u8]>,
    ) -> Result<Session> {
        let hash = format!("{:x}", md5::compute(rom));
        self.with_tx(SESSION_SCOPE, |tx, extras| {
            if tx.get(Collection::Rom, &Key::name(hash.as_str()))?.is_none() {
                tx.put(Collection::Rom, Key::name(hash.as_str()), Value::blob(rom.to_vec()))?;
            }

            let id = allocate_id(tx, KVS_NEXT_SESSION_ID)?;
            let session = Session {
                id,
                name: name.to_string(),
                device: device.to_string(),
                rom: hash.clone(),
                ram_size,
            };
            tx.put(Collection::Session, Key::Index(id), session.to_value())?;

            if let Some(memory) = memory {
                save_memory(tx, id, memory)?;
            }
            if let Some(state) = state {
                tx.put(Collection::State, Key::Index(id), Value::blob(state.to_vec()))?;
            }

            extras.notices.push(Notice::Session(SessionChange {
                id,
                session: Some(session.clone()),
            }));
            Ok(session)
        })
    }

    pub fn get_session(&self, id: u32) -> Result<Option<Session>> {
        self.with_tx(&[Collection::Session], |tx, _| get_session_tx(tx, id))
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        self.with_tx(&[Collection::Session], |tx, _| {
            tx.iter(Collection::Session)?
                .map(|(_, value)| decode_session(value))
                .collect()
        })
    }

    /// Full update. The ROM reference, RAM size, and device type are fixed
    /// at creation.
    pub fn update_session(&self, session: &Session) -> Result<()> {
        self.with_tx(&[Collection::Session], |tx, extras| {
            let stored = get_session_tx(tx, session.id)?.ok_or(StoreError::NotFound {
                kind: "session",
                id: session.id,
            })?;
            if stored.rom != session.rom {
                return Err(StoreError::ImmutableField("rom"));
            }
            if stored.ram_size != session.ram_size {
                return Err(StoreError::ImmutableField("ram_size"));
            }
            if stored.device != session.device {
                return Err(StoreError::ImmutableField("device"));
            }
            tx.put(Collection::Session, Key::Index(session.id), session.to_value())?;
            extras.notices.push(Notice::Session(SessionChange {
                id: session.id,
                session: Some(session.clone()),
            }));
            Ok(())
        })
    }

    /// Partial update of the one mutable field.
    pub fn rename_session(&self, id: u32, name: &str) -> Result<()> {
        self.with_tx(&[Collection::Session], |tx, extras| {
            let mut session = get_session_tx(tx, id)?.ok_or(StoreError::NotFound {
                kind: "session",
                id,
            })?;
            session.name = name.to_string();
            tx.put(Collection::Session, Key::Index(id), session.to_value())?;
            extras.notices.push(Notice::Session(SessionChange {
                id,
                session: Some(session),
            }));
            Ok(())
        })
    }

    /// Loads everything needed to boot a session.
    pub fn load_session(&self, id: u32, crc_check: bool) -> Result<SessionImage> {
        self.with_tx(SESSION_SCOPE, |tx, extras| {
            let session = get_session_tx(tx, id)?.ok_or(StoreError::NotFound {
                kind: "session",
                id,
            })?;

            let rom = tx
                .get(Collection::Rom, &Key::name(session.rom.as_str()))?
                .and_then(|v| v.as_blob().map(|b| b.to_vec()))
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("ROM blob {} missing", session.rom))
                })?;

            let memory = match get_memory_meta(tx, id)? {
                Some(meta) => {
                    let data = read_image(
                        tx,
                        Collection::Memory,
                        PageKeys::Owner(id),
                        ram_geometry(meta.total_size),
                    )?;
                    extras.check_image_crc("memory", id, meta.crc, &data, crc_check);
                    Some(data)
                }
                None => None,
            };

            let savestate = tx
                .get(Collection::State, &Key::Index(id))?
                .and_then(|v| v.as_blob().map(|b| b.to_vec()));

            Ok(SessionImage {
                session,
                rom,
                memory,
                savestate,
            })
        })
    }

    /// Removes a session, its memory and savestate, and its ROM blob when
    /// no other session references it. Deleting a missing session is a
    /// no-op.
    pub fn delete_session(&self, id: u32) -> Result<()> {
        self.with_tx(SESSION_SCOPE, |tx, extras| {
            let Some(session) = get_session_tx(tx, id)? else {
                return Ok(());
            };

            // Committed-state scan; the delete below is staged, so the
            // doomed session is excluded by id.
            let rom_still_used = tx
                .iter(Collection::Session)?
                .filter(|(key, _)| **key != Key::Index(id))
                .map(|(_, value)| decode_session(value))
                .any(|s| matches!(s, Ok(s) if s.rom == session.rom));

            tx.delete(Collection::Session, Key::Index(id))?;
            if !rom_still_used {
                tx.delete(Collection::Rom, Key::name(session.rom.as_str()))?;
            }
            delete_memory(tx, id)?;
            tx.delete(Collection::State, Key::Index(id))?;

            extras.notices.push(Notice::Session(SessionChange {
                id,
                session: None,
            }));
            Ok(())
        })
    }

    /// Drops a session's RAM image and savestate, keeping the record.
    pub fn reset_session(&self, id: u32) -> Result<()> {
        self.with_tx(SESSION_SCOPE, |tx, _| {
            get_session_tx(tx, id)?.ok_or(StoreError::NotFound {
                kind: "session",
                id,
            })?;
            delete_memory(tx, id)?;
            tx.delete(Collection::State, Key::Index(id))
        })
    }

    // ---- storage cards ----

    /// Creates a card with a fresh identity, optionally from an imported
    /// image.
    pub fn add_card(&self, name: &str, size: u32, data: Option<&[u8]>) -> Result<StorageCard> {
        if size == 0 || size % PAGE_SIZE_CARD != 0 {
            return Err(StoreError::InvalidImage(format!(
                "card size {size} is not a multiple of the page size"
            )));
        }
        if let Some(data) = data {
            if data.len() != size as usize {
                return Err(StoreError::InvalidImage(format!(
                    "card image is {} bytes, card holds {size}",
                    data.len()
                )));
            }
        }

        self.with_tx(CARD_SCOPE, |tx, extras| {
            let id = allocate_id(tx, KVS_NEXT_CARD_ID)?;
            let card = StorageCard {
                id,
                name: name.to_string(),
                size,
                card_id: random_id(),
                mounted: false,
                crc: data.map(crc32),
            };
            tx.put(Collection::Card, Key::Index(id), card.to_value())?;
            if data.is_some() {
                write_image(
                    tx,
                    Collection::Storage,
                    PageKeys::Owner(id),
                    PAGE_SIZE_CARD,
                    EMPTY_WORD_CARD,
                    data,
                )?;
            }
            extras.notices.push(Notice::Card(CardChange {
                id,
                card: Some(card.clone()),
            }));
            Ok(card)
        })
    }

    pub fn get_card(&self, id: u32) -> Result<Option<StorageCard>> {
        self.with_tx(&[Collection::Card], |tx, _| get_card_tx(tx, id))
    }

    pub fn list_cards(&self) -> Result<Vec<StorageCard>> {
        self.with_tx(&[Collection::Card], |tx, _| {
            tx.iter(Collection::Card)?
                .map(|(_, value)| decode_card(value))
                .collect()
        })
    }

    /// Full update. Size and identity are fixed at creation.
    pub fn update_card(&self, card: &StorageCard) -> Result<()> {
        self.with_tx(&[Collection::Card], |tx, extras| {
            let stored = get_card_tx(tx, card.id)?.ok_or(StoreError::NotFound {
                kind: "card",
                id: card.id,
            })?;
            if stored.size != card.size {
                return Err(StoreError::ImmutableField("size"));
            }
            if stored.card_id != card.card_id {
                return Err(StoreError::ImmutableField("card_id"));
            }
            tx.put(Collection::Card, Key::Index(card.id), card.to_value())?;
            extras.notices.push(Notice::Card(CardChange {
                id: card.id,
                card: Some(card.clone()),
            }));
            Ok(())
        })
    }

    /// Removes a card and all its pages. Deleting a missing card is a
    /// no-op.
    pub fn delete_card(&self, id: u32) -> Result<()> {
        self.with_tx(CARD_SCOPE, |tx, extras| {
            if get_card_tx(tx, id)?.is_none() {
                return Ok(());
            }
            tx.delete(Collection::Card, Key::Index(id))?;
            write_image(
                tx,
                Collection::Storage,
                PageKeys::Owner(id),
                PAGE_SIZE_CARD,
                EMPTY_WORD_CARD,
                None,
            )?;
            extras.notices.push(Notice::Card(CardChange { id, card: None }));
            Ok(())
        })
    }

    pub fn read_card(&self, id: u32, crc_check: bool) -> Result<Vec<u8>> {
        self.with_tx(CARD_SCOPE, |tx, extras| {
            let card = get_card_tx(tx, id)?.ok_or(StoreError::NotFound {
                kind: "card",
                id,
            })?;
            let data = read_image(
                tx,
                Collection::Storage,
                PageKeys::Owner(id),
                card_geometry(card.size),
            )?;
            extras.check_image_crc("card", id, card.crc, &data, crc_check);
            Ok(data)
        })
    }

    /// Rewrites a card image in full and refreshes its checksum.
    pub fn write_card(&self, id: u32, data: &[u8]) -> Result<()> {
        self.with_tx(CARD_SCOPE, |tx, extras| {
            let mut card = get_card_tx(tx, id)?.ok_or(StoreError::NotFound {
                kind: "card",
                id,
            })?;
            if data.len() != card.size as usize {
                return Err(StoreError::InvalidImage(format!(
                    "card image is {} bytes, card holds {}",
                    data.len(),
                    card.size
                )));
            }
            write_image(
                tx,
                Collection::Storage,
                PageKeys::Owner(id),
                PAGE_SIZE_CARD,
                EMPTY_WORD_CARD,
                Some(data),
            )?;
            card.crc = Some(crc32(data));
            tx.put(Collection::Card, Key::Index(id), card.to_value())?;
            extras.notices.push(Notice::Card(CardChange {
                id,
                card: Some(card),
            }));
            Ok(())
        })
    }

    // ---- snapshots ----

    /// Persists one incremental snapshot atomically: dirty pages, image
    /// checksums, RAM size, and savestate all land in one transaction.
    ///
    /// If card pages are present, the snapshot's card identity must match a
    /// stored card; otherwise nothing is written.
    pub fn store_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        // The size is persisted as the image geometry for every later
        // read, so a misaligned value must be refused here.
        if snapshot.ram_size % PAGE_SIZE_RAM != 0 {
            return Err(StoreError::InvalidImage(format!(
                "RAM size {} is not a multiple of the {PAGE_SIZE_RAM}-byte page size",
                snapshot.ram_size
            )));
        }
        self.with_tx(SNAPSHOT_SCOPE, |tx, extras| {
            let session_id = snapshot.session;
            get_session_tx(tx, session_id)?.ok_or(StoreError::NotFound {
                kind: "session",
                id: session_id,
            })?;

            let card = match (&snapshot.card, &snapshot.card_id) {
                (None, _) => None,
                (Some(_), None) => {
                    return Err(StoreError::IdentityMismatch {
                        stored: None,
                        snapshot: None,
                    })
                }
                (Some(_), Some(identity)) => {
                    let card = find_card_by_identity(tx, identity)?;
                    match card {
                        Some(card) => Some(card),
                        None => {
                            return Err(StoreError::IdentityMismatch {
                                stored: None,
                                snapshot: Some(identity.clone()),
                            })
                        }
                    }
                }
            };

            if let Some(pages) = &snapshot.nand {
                write_snapshot_pages(
                    tx,
                    Collection::Nand,
                    PageKeys::Flat,
                    nand_geometry(),
                    &mut extras.pools.nand,
                    pages,
                )?;
                tx.put(
                    Collection::Kvs,
                    Key::name(KVS_NAND_CRC),
                    Value::Word(pages.crc),
                )?;
            }

            if let (Some(pages), Some(mut card)) = (&snapshot.card, card) {
                write_snapshot_pages(
                    tx,
                    Collection::Storage,
                    PageKeys::Owner(card.id),
                    card_geometry(card.size),
                    &mut extras.pools.card,
                    pages,
                )?;
                card.crc = Some(pages.crc);
                tx.put(Collection::Card, Key::Index(card.id), card.to_value())?;
            }

            let mut meta = get_memory_meta(tx, session_id)?.unwrap_or(MemoryMeta {
                total_size: snapshot.ram_size,
                crc: None,
            });
            meta.total_size = snapshot.ram_size;
            if let Some(pages) = &snapshot.ram {
                write_snapshot_pages(
                    tx,
                    Collection::Memory,
                    PageKeys::Owner(session_id),
                    ram_geometry(snapshot.ram_size),
                    &mut extras.pools.ram,
                    pages,
                )?;
                meta.crc = Some(pages.crc);
            }
            tx.put(Collection::MemoryMeta, Key::Index(session_id), meta.to_value())?;

            match &snapshot.savestate {
                Some(state) => tx.put(
                    Collection::State,
                    Key::Index(session_id),
                    Value::blob(state.clone()),
                )?,
                None => tx.delete(Collection::State, Key::Index(session_id))?,
            }
            Ok(())
        })
    }

    // ---- maintenance ----

    /// Folds the journal down to a single full-state frame. Compaction
    /// replaces the journal file, so it re-checks the lock token first: a
    /// displaced instance must not swap the file out from under the new
    /// holder.
    pub fn compact(&self) -> Result<()> {
        let mut fatal_notice = None;

        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if let Some(reason) = inner.fatal {
                return Err(StoreError::Deactivated(reason));
            }
            let was_closed = inner.store.is_closed();

            let outcome: Result<()> = (|| {
                let tx = inner.store.begin(&[Collection::Lock])?;
                inner.arbiter.check(&tx)?;
                tx.abort();
                inner.store.compact()
            })();

            if let Err(err) = &outcome {
                if !was_closed {
                    if let Some(reason) = err.fatal_reason() {
                        inner.fatal = Some(reason);
                        inner.store.close();
                        fatal_notice = Some(reason);
                    }
                }
            }
            outcome
        };

        if let Some(reason) = fatal_notice {
            self.events.fatal.dispatch(&reason);
        }
        result
    }

    /// Flushes and closes the store. Later operations fail with `Closed`.
    pub fn close(&self) {
        self.inner.lock().store.close();
    }
}

const SESSION_SCOPE: &[Collection] = &[
    Collection::Kvs,
    Collection::Session,
    Collection::Rom,
    Collection::State,
    Collection::Memory,
    Collection::MemoryMeta,
];

const CARD_SCOPE: &[Collection] = &[
    Collection::Kvs,
    Collection::Card,
    Collection::Storage,
];

const SNAPSHOT_SCOPE: &[Collection] = &[
    Collection::Kvs,
    Collection::Session,
    Collection::Nand,
    Collection::Card,
    Collection::Storage,
    Collection::State,
    Collection::Memory,
    Collection::MemoryMeta,
];

fn decode_session(value: &Value) -> Result<Session> {
    let blob = value
        .as_blob()
        .ok_or_else(|| StoreError::corrupt("session record is not a blob"))?;
    Session::decode(&mut Reader::new(blob))
}

fn decode_card(value: &Value) -> Result<StorageCard> {
    let blob = value
        .as_blob()
        .ok_or_else(|| StoreError::corrupt("card record is not a blob"))?;
    StorageCard::decode(&mut Reader::new(blob))
}

fn get_session_tx(tx: &Transaction<'_>, id: u32) -> Result<Option<Session>> {
    tx.get(Collection::Session, &Key::Index(id))?
        .map(|v| decode_session(&v))
        .transpose()
}

fn get_card_tx(tx: &Transaction<'_>, id: u32) -> Result<Option<StorageCard>> {
    tx.get(Collection::Card, &Key::Index(id))?
        .map(|v| decode_card(&v))
        .transpose()
}

fn find_card_by_identity(tx: &Transaction<'_>, identity: &str) -> Result<Option<StorageCard>> {
    for (_, value) in tx.iter(Collection::Card)? {
        let card = decode_card(value)?;
        if card.card_id == identity {
            return Ok(Some(card));
        }
    }
    Ok(None)
}

fn get_memory_meta(tx: &Transaction<'_>, session: u32) -> Result<Option<MemoryMeta>> {
    tx.get(Collection::MemoryMeta, &Key::Index(session))?
        .map(|v| {
            let blob = v
                .as_blob()
                .ok_or_else(|| StoreError::corrupt("memory metadata is not a blob"))?;
            MemoryMeta::decode(&mut Reader::new(blob))
        })
        .transpose()
}

fn save_memory(tx: &mut Transaction<'_>, session: u32, data: &[u8]) -> Result<()> {
    write_image(
        tx,
        Collection::Memory,
        PageKeys::Owner(session),
        PAGE_SIZE_RAM,
        EMPTY_WORD_RAM,
        Some(data),
    )?;
    let meta = MemoryMeta {
        total_size: data.len() as u32,
        crc: Some(crc32(data)),
    };
    tx.put(Collection::MemoryMeta, Key::Index(session), meta.to_value())
}

fn delete_memory(tx: &mut Transaction<'_>, session: u32) -> Result<()> {
    write_image(
        tx,
        Collection::Memory,
        PageKeys::Owner(session),
        PAGE_SIZE_RAM,
        EMPTY_WORD_RAM,
        None,
    )?;
    tx.delete(Collection::MemoryMeta, Key::Index(session))
}
