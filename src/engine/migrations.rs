//! Versioned schema migrations.
//!
//! The chain is append-only: a store at version `old` replays every step
//! with `old < version <= target` inside a single upgrade transaction, so
//! an interrupted upgrade leaves the store at its previous version with no
//! partial state.
//!
//! Steps 3 and 4 fold legacy single-blob images into paged storage. Their
//! policy on malformed legacy data is deliberately lenient: the blob is the
//! reconstructible kind (reinstallable OS image, reformattable card), so a
//! bad length or undecodable stream logs a warning and drops the data
//! instead of failing the upgrade.

use tracing::{info, warn};

use crate::error::Result;
use crate::store::{Collection, Key, Transaction, Value};

use super::codec::decompress_legacy_image;
use super::kvs::{
    KVS_LEGACY_CARD, KVS_LEGACY_CARD_NAME, KVS_LEGACY_NAND, KVS_LEGACY_NAND_NAME,
    KVS_NAND_NAME, KVS_NEXT_CARD_ID,
};
use super::paged::{write_image, PageKeys};
use super::records::StorageCard;
use super::{
    random_id, EMPTY_WORD_CARD, EMPTY_WORD_NAND, PAGE_SIZE_CARD, PAGE_SIZE_NAND,
};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 6;

struct MigrationStep {
    version: u32,
    run: fn(&mut Transaction<'_>) -> Result<()>,
}

const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        version: 1,
        run: create_kvs,
    },
    MigrationStep {
        version: 2,
        run: create_lock,
    },
    MigrationStep {
        version: 3,
        run: migrate_nand,
    },
    MigrationStep {
        version: 4,
        run: migrate_card,
    },
    MigrationStep {
        version: 5,
        run: create_session_stores,
    },
    MigrationStep {
        version: 6,
        run: derive_card_identity,
    },
];

/// Runs every step between `old` (exclusive) and `target` (inclusive).
pub fn run_chain(tx: &mut Transaction<'_>, old: u32, target: u32) -> Result<()> {
    for step in MIGRATIONS {
        if old < step.version && step.version <= target {
            info!(version = step.version, "applying schema migration");
            (step.run)(tx)?;
        }
    }
    Ok(())
}

fn create_kvs(tx: &mut Transaction<'_>) -> Result<()> {
    tx.create_collection(Collection::Kvs)
}

fn create_lock(tx: &mut Transaction<'_>) -> Result<()> {
    tx.create_collection(Collection::Lock)
}

/// Moves the legacy raw flash blob out of the kvs namespace into paged
/// storage.
fn migrate_nand(tx: &mut Transaction<'_>) -> Result<()> {
    tx.create_collection(Collection::Nand)?;

    let Some(blob) = tx
        .get(Collection::Kvs, &Key::name(KVS_LEGACY_NAND))?
        .and_then(|v| v.as_blob().cloned())
    else {
        return Ok(());
    };
    let name = tx
        .get(Collection::Kvs, &Key::name(KVS_LEGACY_NAND_NAME))?
        .and_then(|v| v.as_text().map(str::to_string));

    tx.delete(Collection::Kvs, Key::name(KVS_LEGACY_NAND))?;
    tx.delete(Collection::Kvs, Key::name(KVS_LEGACY_NAND_NAME))?;

    if blob.len() % PAGE_SIZE_NAND as usize != 0 {
        warn!(
            size = blob.len(),
            "legacy flash image is not page aligned, dropping it"
        );
        return Ok(());
    }

    if let Some(name) = name {
        tx.put(Collection::Kvs, Key::name(KVS_NAND_NAME), Value::text(name))?;
    }
    write_image(
        tx,
        Collection::Nand,
        PageKeys::Flat,
        PAGE_SIZE_NAND,
        EMPTY_WORD_NAND,
        Some(blob.as_slice()),
    )
}

/// Expands the legacy compressed card blob into a card record plus paged
/// storage.
fn migrate_card(tx: &mut Transaction<'_>) -> Result<()> {
    tx.create_collection(Collection::Card)?;
    tx.create_collection(Collection::Storage)?;

    let Some(blob) = tx
        .get(Collection::Kvs, &Key::name(KVS_LEGACY_CARD))?
        .and_then(|v| v.as_blob().cloned())
    else {
        return Ok(());
    };
    let name = tx
        .get(Collection::Kvs, &Key::name(KVS_LEGACY_CARD_NAME))?
        .and_then(|v| v.as_text().map(str::to_string))
        .unwrap_or_else(|| "card".to_string());

    tx.delete(Collection::Kvs, Key::name(KVS_LEGACY_CARD))?;
    tx.delete(Collection::Kvs, Key::name(KVS_LEGACY_CARD_NAME))?;

    let image = match decompress_legacy_image(&blob) {
        Ok(image) => image,
        Err(err) => {
            warn!(%err, "legacy card image does not decode, dropping it");
            return Ok(());
        }
    };
    if image.len() % PAGE_SIZE_CARD as usize != 0 {
        warn!(
            size = image.len(),
            "legacy card image is not page aligned, dropping it"
        );
        return Ok(());
    }

    let card = StorageCard {
        id: 1,
        name,
        size: image.len() as u32,
        card_id: String::new(),
        mounted: false,
        crc: None,
    };
    tx.put(Collection::Card, Key::Index(card.id), card.to_value())?;
    tx.put(
        Collection::Kvs,
        Key::name(KVS_NEXT_CARD_ID),
        Value::Word(2),
    )?;
    write_image(
        tx,
        Collection::Storage,
        PageKeys::Owner(card.id),
        PAGE_SIZE_CARD,
        EMPTY_WORD_CARD,
        Some(image.as_slice()),
    )
}

fn create_session_stores(tx: &mut Transaction<'_>) -> Result<()> {
    tx.create_collection(Collection::Session)?;
    tx.create_collection(Collection::Rom)?;
    tx.create_collection(Collection::State)?;
    tx.create_collection(Collection::Memory)?;
    tx.create_collection(Collection::MemoryMeta)
}

/// Gives every identity-less card a fresh random identity and mounts it.
fn derive_card_identity(tx: &mut Transaction<'_>) -> Result<()> {
    let mut ids: Vec<u32> = tx
        .iter(Collection::Card)?
        .filter_map(|(key, _)| match key {
            Key::Index(id) => Some(*id),
            _ => None,
        })
        .collect();
    // A card created earlier in the same upgrade is only visible to
    // exact-key reads; the chain only ever creates card 1.
    if !ids.contains(&1) && tx.get(Collection::Card, &Key::Index(1))?.is_some() {
        ids.push(1);
    }

    for id in ids {
        let Some(blob) = tx
            .get(Collection::Card, &Key::Index(id))?
            .and_then(|v| v.as_blob().cloned())
        else {
            continue;
        };
        let mut card = StorageCard::decode(&mut crate::encoding::Reader::new(&blob))?;
        if !card.card_id.is_empty() {
            continue;
        }
        card.card_id = random_id();
        card.mounted = true;
        tx.put(Collection::Card, Key::Index(id), card.to_value())?;
    }
    Ok(())
}
