//! Paged image persistence.
//!
//! Memory images are stored page by page: uniform pages collapse to one
//! word via [`compress_page`], and pages equal to the medium's empty word
//! are not stored at all. Reading starts from an image pre-filled with the
//! empty word and overlays every stored page, so absent pages reconstruct
//! correctly by construction.
//!
//! Flat collections (device flash) key pages by bare index; shared
//! collections (card and RAM pages) key them by (owner id, index) so one
//! owner's pages form a contiguous key range.

use std::ops::Bound;

use crate::error::{Result, StoreError};
use crate::store::{Collection, Key, Transaction, Value};

use super::codec::{compress_page, CompressedPage};

/// Shape of one stored image: its full size, page granularity, and the
/// word value absent pages decode to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGeometry {
    pub total_size: u32,
    pub page_size: u32,
    pub empty_word: u32,
}

impl ImageGeometry {
    pub const fn new(total_size: u32, page_size: u32, empty_word: u32) -> Self {
        Self {
            total_size,
            page_size,
            empty_word,
        }
    }

    pub fn page_words(&self) -> usize {
        (self.page_size / 4) as usize
    }

    pub fn page_count(&self) -> usize {
        (self.total_size / self.page_size) as usize
    }

    fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size % 4 != 0 {
            return Err(StoreError::Corrupt(format!(
                "invalid page size {}",
                self.page_size
            )));
        }
        if self.total_size % self.page_size != 0 {
            return Err(StoreError::Corrupt(format!(
                "image size {} not a multiple of page size {}",
                self.total_size, self.page_size
            )));
        }
        Ok(())
    }
}

/// How pages of an image are keyed within their collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKeys {
    /// Bare page index; the collection holds a single image.
    Flat,
    /// (owner id, page index); the collection is shared by many images.
    Owner(u32),
}

impl PageKeys {
    pub fn key(self, index: u32) -> Key {
        match self {
            PageKeys::Flat => Key::Index(index),
            PageKeys::Owner(id) => Key::Owned(id, index),
        }
    }

    pub fn index(self, key: &Key) -> Result<u32> {
        match (self, key) {
            (PageKeys::Flat, Key::Index(i)) => Ok(*i),
            (PageKeys::Owner(id), Key::Owned(owner, i)) if *owner == id => Ok(*i),
            _ => Err(StoreError::corrupt("unexpected key shape in paged collection")),
        }
    }

    pub fn bounds(self) -> (Bound<Key>, Bound<Key>) {
        match self {
            PageKeys::Flat => (Bound::Unbounded, Bound::Unbounded),
            PageKeys::Owner(id) => (
                Bound::Included(Key::Owned(id, 0)),
                Bound::Excluded(owner_end(id)),
            ),
        }
    }
}

// First key past every page of `id`. Name keys sort after all Owned keys,
// so an empty name covers the saturated case.
fn owner_end(id: u32) -> Key {
    match id.checked_add(1) {
        Some(next) => Key::Owned(next, 0),
        None => Key::Name(String::new()),
    }
}

/// Reconstructs a full image from its stored pages as little-endian bytes.
pub fn read_image(
    tx: &Transaction<'_>,
    coll: Collection,
    keys: PageKeys,
    geom: ImageGeometry,
) -> Result<Vec<u8>> {
    geom.validate()?;
    let page_words = geom.page_words();
    let page_count = geom.page_count();
    let mut words = vec![geom.empty_word; page_words * page_count];

    for (key, value) in tx.range(coll, keys.bounds())? {
        let index = keys.index(key)? as usize;
        if index >= page_count {
            return Err(StoreError::Corrupt(format!(
                "page index {index} out of bounds ({page_count} pages)"
            )));
        }
        let slot = &mut words[index * page_words..(index + 1) * page_words];
        match value {
            Value::Word(w) => slot.fill(*w),
            Value::Words(page) => {
                if page.len() != page_words {
                    return Err(StoreError::Corrupt(format!(
                        "stored page holds {} words, geometry says {page_words}",
                        page.len()
                    )));
                }
                slot.copy_from_slice(page);
            }
            _ => {
                return Err(StoreError::corrupt(
                    "unexpected value type in paged collection",
                ))
            }
        }
    }

    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in &words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    Ok(bytes)
}

/// Replaces an image's pages wholesale. Existing pages for the key range
/// are deleted first; `None` just clears. Pages that compress to the empty
/// word are skipped.
///
/// Writes are staged, so this must not be interleaved with reads of the
/// same key range within one transaction.
pub fn write_image(
    tx: &mut Transaction<'_>,
    coll: Collection,
    keys: PageKeys,
    page_size: u32,
    empty_word: u32,
    data: Option<&[u8]>,
) -> Result<()> {
    match keys {
        PageKeys::Flat => tx.clear(coll)?,
        PageKeys::Owner(id) => tx.delete_range(coll, Key::Owned(id, 0), owner_end(id))?,
    }

    let Some(data) = data else {
        return Ok(());
    };

    // Caller-supplied data; a bad length is an invalid argument, not
    // store corruption.
    let geom = ImageGeometry::new(data.len() as u32, page_size, empty_word);
    if geom.validate().is_err() {
        return Err(StoreError::InvalidImage(format!(
            "image of {} bytes does not divide into {page_size}-byte pages",
            data.len()
        )));
    }

    let page_words = geom.page_words();
    let mut page = vec![0u32; page_words];
    for (i, chunk) in data.chunks_exact(page_size as usize).enumerate() {
        for (word, raw) in page.iter_mut().zip(chunk.chunks_exact(4)) {
            *word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        match compress_page(&page) {
            CompressedPage::Scalar(w) if w == empty_word => {}
            CompressedPage::Scalar(w) => tx.put(coll, keys.key(i as u32), Value::Word(w))?,
            CompressedPage::Raw(_) => {
                tx.put(coll, keys.key(i as u32), Value::words(page.clone()))?
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};

    fn open_with_pages(dir: &tempfile::TempDir) -> Store {
        let mut store =
            Store::open(&dir.path().join("store.pv"), StoreOptions::default()).unwrap();
        store
            .upgrade(1, |tx, _| {
                tx.create_collection(Collection::Nand)?;
                tx.create_collection(Collection::Storage)
            })
            .unwrap();
        store
    }

    #[test]
    fn image_roundtrips_through_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_pages(&dir);
        let geom = ImageGeometry::new(64, 8, 0xFFFF_FFFF);

        // Page 0 uniform ones (stored as one byte each, little endian word
        // 0x01010101), page 3 mixed, the rest empty.
        let mut image = vec![0xFFu8; 64];
        image[0..8].fill(0x01);
        image[24..32].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        write_image(&mut tx, Collection::Nand, PageKeys::Flat, 8, 0xFFFF_FFFF, Some(&image[..]))
            .unwrap();
        tx.commit().unwrap();

        let tx = store.begin(&[Collection::Nand]).unwrap();
        assert_eq!(
            tx.get(Collection::Nand, &Key::Index(0)).unwrap(),
            Some(Value::Word(0x0101_0101))
        );
        assert_eq!(
            tx.get(Collection::Nand, &Key::Index(3)).unwrap(),
            Some(Value::words(vec![0x0403_0201, 0x0807_0605]))
        );
        // Empty pages are not stored.
        assert_eq!(tx.get(Collection::Nand, &Key::Index(1)).unwrap(), None);

        assert_eq!(read_image(&tx, Collection::Nand, PageKeys::Flat, geom).unwrap(), image);
    }

    #[test]
    fn rewrite_drops_stale_pages() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_pages(&dir);
        let geom = ImageGeometry::new(32, 8, 0);

        let mut first = vec![0x55u8; 32];
        first[0] = 0x56;
        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        write_image(&mut tx, Collection::Nand, PageKeys::Flat, 8, 0, Some(&first[..])).unwrap();
        tx.commit().unwrap();

        // New image is empty except page 1; pages 0, 2, 3 must vanish.
        let mut second = vec![0u8; 32];
        second[8..16].fill(0xAA);
        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        write_image(&mut tx, Collection::Nand, PageKeys::Flat, 8, 0, Some(&second[..])).unwrap();
        tx.commit().unwrap();

        let tx = store.begin(&[Collection::Nand]).unwrap();
        assert_eq!(tx.iter(Collection::Nand).unwrap().count(), 1);
        assert_eq!(read_image(&tx, Collection::Nand, PageKeys::Flat, geom).unwrap(), second);
    }

    #[test]
    fn owner_ranges_do_not_bleed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_pages(&dir);
        let geom = ImageGeometry::new(16, 8, 0);

        let image_a = vec![0x11u8; 16];
        let image_b = vec![0x22u8; 16];

        let mut tx = store.begin(&[Collection::Storage]).unwrap();
        write_image(&mut tx, Collection::Storage, PageKeys::Owner(1), 8, 0, Some(&image_a[..]))
            .unwrap();
        write_image(&mut tx, Collection::Storage, PageKeys::Owner(2), 8, 0, Some(&image_b[..]))
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin(&[Collection::Storage]).unwrap();
        write_image(&mut tx, Collection::Storage, PageKeys::Owner(1), 8, 0, None).unwrap();
        tx.commit().unwrap();

        let tx = store.begin(&[Collection::Storage]).unwrap();
        assert_eq!(
            read_image(&tx, Collection::Storage, PageKeys::Owner(1), geom).unwrap(),
            vec![0u8; 16]
        );
        assert_eq!(
            read_image(&tx, Collection::Storage, PageKeys::Owner(2), geom).unwrap(),
            image_b
        );
    }

    #[test]
    fn misaligned_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_pages(&dir);

        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        let result = write_image(
            &mut tx,
            Collection::Nand,
            PageKeys::Flat,
            8,
            0,
            Some(&[0u8; 12][..]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn out_of_bounds_page_index_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_with_pages(&dir);

        let mut tx = store.begin(&[Collection::Nand]).unwrap();
        tx.put(Collection::Nand, Key::Index(9), Value::Word(1)).unwrap();
        tx.commit().unwrap();

        let tx = store.begin(&[Collection::Nand]).unwrap();
        let geom = ImageGeometry::new(16, 8, 0);
        assert!(matches!(
            read_image(&tx, Collection::Nand, PageKeys::Flat, geom),
            Err(StoreError::Corrupt(_))
        ));
    }
}
