//! Incremental snapshot persistence.
//!
//! A snapshot carries only the pages the emulator dirtied since the last
//! one, so pages are put individually on top of what is already stored.
//! Unlike a full image write, a dirty page that compresses to the empty
//! word is still put: it overwrites whatever the page held before.
//!
//! Raw pages are staged through a retained [`PagePool`] so steady-state
//! snapshots reuse their buffers instead of allocating per page. The pool
//! grows on demand and never shrinks; a slot still referenced by a
//! committed value is replaced rather than overwritten.

use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::store::{Collection, Transaction, Value};

use super::codec::{compress_page, CompressedPage};
use super::paged::{ImageGeometry, PageKeys};

/// Dirty pages of one image: page indices plus their contents, flattened
/// in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPages {
    pub dirty: Vec<u32>,
    pub pages: Vec<u32>,
    /// Checksum of the full image these deltas produce.
    pub crc: u32,
}

/// One emulator snapshot. Absent images are untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub session: u32,
    pub nand: Option<SnapshotPages>,
    pub card: Option<SnapshotPages>,
    pub ram: Option<SnapshotPages>,
    /// Identity of the card the card pages belong to. Required when card
    /// pages are present.
    pub card_id: Option<String>,
    pub savestate: Option<Vec<u8>>,
    pub ram_size: u32,
}

/// Retained staging buffers for raw snapshot pages.
pub struct PagePool {
    page_words: usize,
    slots: Vec<Arc<Vec<u32>>>,
}

impl PagePool {
    pub fn new(page_words: usize) -> Self {
        Self {
            page_words,
            slots: Vec::new(),
        }
    }

    /// Copies `page` into slot `slot` and returns a handle to it. Slots are
    /// handed out in order within one snapshot; the caller restarts at slot
    /// zero for the next.
    fn stage(&mut self, slot: usize, page: &[u32]) -> Arc<Vec<u32>> {
        if self.slots.len() <= slot {
            self.slots.push(Arc::new(vec![0u32; self.page_words]));
        }
        if Arc::get_mut(&mut self.slots[slot]).is_none() {
            self.slots[slot] = Arc::new(vec![0u32; self.page_words]);
        }
        let entry = &mut self.slots[slot];
        let buf = Arc::get_mut(entry).unwrap(); // INVARIANT: uniquely owned after the check above
        buf.copy_from_slice(page);
        Arc::clone(entry)
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// Applies one image's dirty pages. Every scheduled page is written, empty
/// or not; raw pages go through the pool.
pub fn write_snapshot_pages(
    tx: &mut Transaction<'_>,
    coll: Collection,
    keys: PageKeys,
    geom: ImageGeometry,
    pool: &mut PagePool,
    pages: &SnapshotPages,
) -> Result<()> {
    let page_words = geom.page_words();
    if pages.pages.len() != pages.dirty.len() * page_words {
        return Err(StoreError::InvalidImage(format!(
            "snapshot holds {} words for {} pages of {page_words} words",
            pages.pages.len(),
            pages.dirty.len()
        )));
    }

    let page_count = geom.page_count();
    let mut slot = 0usize;
    for (i, &index) in pages.dirty.iter().enumerate() {
        if index as usize >= page_count {
            return Err(StoreError::InvalidImage(format!(
                "snapshot page index {index} out of bounds ({page_count} pages)"
            )));
        }
        let chunk = &pages.pages[i * page_words..(i + 1) * page_words];
        match compress_page(chunk) {
            CompressedPage::Scalar(w) => tx.put(coll, keys.key(index), Value::Word(w))?,
            CompressedPage::Raw(_) => {
                let staged = pool.stage(slot, chunk);
                slot += 1;
                tx.put(coll, keys.key(index), Value::Words(staged))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Key, Store, StoreOptions};

    fn open_with_nand(dir: &tempfile::TempDir) -> Store {
        let mut store =
            Store::open(&dir.path().join("store.pv"), StoreOptions::default()).unwrap();
        store
            .upgrade(1, |tx, _| tx.create_collection(Collection::Nand))
            .unwrap();
        store
    }

    #[test]
    fn dirty_pages_overwrite_even_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_nand(&dir);
        let geom = ImageGeometry::new(16, 8, 0xFFFF_FFFF);
        let mut pool = PagePool::new(2);

        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        tx.put(Collection::Nand, Key::Index(0), Value::Word(0x1234_5678))
            .unwrap();
        tx.commit().unwrap();

        // Page 0 reverts to the empty word, page 1 turns raw.
        let pages = SnapshotPages {
            dirty: vec![0, 1],
            pages: vec![0xFFFF_FFFF, 0xFFFF_FFFF, 1, 2],
            crc: 0,
        };
        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        write_snapshot_pages(&mut tx, Collection::Nand, PageKeys::Flat, geom, &mut pool, &pages)
            .unwrap();
        tx.commit().unwrap();

        let tx = store.begin(&[Collection::Nand]).unwrap();
        assert_eq!(
            tx.get(Collection::Nand, &Key::Index(0)).unwrap(),
            Some(Value::Word(0xFFFF_FFFF))
        );
        assert_eq!(
            tx.get(Collection::Nand, &Key::Index(1)).unwrap(),
            Some(Value::words(vec![1, 2]))
        );
    }

    #[test]
    fn pool_grows_once_and_replaces_shared_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_nand(&dir);
        let geom = ImageGeometry::new(32, 8, 0);
        let mut pool = PagePool::new(2);

        let raw_pages = SnapshotPages {
            dirty: vec![0, 1],
            pages: vec![1, 2, 3, 4],
            crc: 0,
        };

        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        write_snapshot_pages(&mut tx, Collection::Nand, PageKeys::Flat, geom, &mut pool, &raw_pages)
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(pool.slot_count(), 2);

        // The committed values still hold the slot buffers, so the next
        // snapshot must not overwrite them in place.
        let first = pool.slots.clone();
        let second_pages = SnapshotPages {
            dirty: vec![2, 3],
            pages: vec![5, 6, 7, 8],
            crc: 0,
        };
        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        write_snapshot_pages(
            &mut tx,
            Collection::Nand,
            PageKeys::Flat,
            geom,
            &mut pool,
            &second_pages,
        )
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(pool.slot_count(), 2);
        let tx = store.begin(&[Collection::Nand]).unwrap();
        assert_eq!(
            tx.get(Collection::Nand, &Key::Index(0)).unwrap(),
            Some(Value::words(vec![1, 2]))
        );
        assert_eq!(
            tx.get(Collection::Nand, &Key::Index(2)).unwrap(),
            Some(Value::words(vec![5, 6]))
        );
        drop(tx);
        drop(first);
    }

    #[test]
    fn mismatched_page_payload_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_nand(&dir);
        let geom = ImageGeometry::new(16, 8, 0);
        let mut pool = PagePool::new(2);

        let pages = SnapshotPages {
            dirty: vec![0, 1],
            pages: vec![1, 2, 3],
            crc: 0,
        };
        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        assert!(write_snapshot_pages(
            &mut tx,
            Collection::Nand,
            PageKeys::Flat,
            geom,
            &mut pool,
            &pages
        )
        .is_err());
    }

    #[test]
    fn out_of_bounds_dirty_page_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_nand(&dir);
        let geom = ImageGeometry::new(16, 8, 0);
        let mut pool = PagePool::new(2);

        let pages = SnapshotPages {
            dirty: vec![2],
            pages: vec![1, 2],
            crc: 0,
        };
        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        assert!(write_snapshot_pages(
            &mut tx,
            Collection::Nand,
            PageKeys::Flat,
            geom,
            &mut pool,
            &pages
        )
        .is_err());
    }
}
