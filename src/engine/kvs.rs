//! Well-known keys in the flat kvs collection, plus id allocation.
//!
//! The legacy keys only matter to migrations: old installations kept whole
//! images and their names directly in the kvs namespace.

use crate::error::Result;
use crate::store::{Collection, Key, Transaction, Value};

pub const KVS_NAND_NAME: &str = "nandName";
pub const KVS_NAND_CRC: &str = "nandCrc";
pub const KVS_NEXT_SESSION_ID: &str = "nextSessionId";
pub const KVS_NEXT_CARD_ID: &str = "nextCardId";

pub const KVS_LEGACY_NAND: &str = "romNand";
pub const KVS_LEGACY_NAND_NAME: &str = "romNandName";
pub const KVS_LEGACY_CARD: &str = "sdImage";
pub const KVS_LEGACY_CARD_NAME: &str = "sdImageName";

/// Hands out the next record id from a kvs counter. Counters start at 1 so
/// id 0 can stand for "no record".
pub fn allocate_id(tx: &mut Transaction<'_>, counter: &str) -> Result<u32> {
    let key = Key::name(counter);
    let next = tx
        .get(Collection::Kvs, &key)?
        .and_then(|v| v.as_word())
        .unwrap_or(1);
    tx.put(Collection::Kvs, key, Value::Word(next + 1))?;
    Ok(next)
}
