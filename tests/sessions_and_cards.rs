//! Session and storage card lifecycle against a real on-disk store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use pagevault::store::{Collection, Key, Store, StoreOptions};
use pagevault::{Engine, StoreError, PAGE_SIZE_CARD, PAGE_SIZE_RAM};

fn rom_a() -> Vec<u8> {
    vec![0xA5u8; 4096]
}

fn rom_b() -> Vec<u8> {
    vec![0x5Au8; 4096]
}

#[test]
fn sessions_roundtrip_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.pv");

    let ram_size = 4 * PAGE_SIZE_RAM;
    let mut memory = vec![0u8; ram_size as usize];
    memory[0..4].copy_from_slice(&[1, 2, 3, 4]);

    let id = {
        let engine = Engine::open(&path).unwrap();
        let session = engine
            .add_session(
                "pilot",
                "PalmTungstenE2",
                ram_size,
                &rom_a(),
                Some(&memory),
                Some(b"state-blob"),
            )
            .unwrap();
        assert_eq!(session.id, 1);
        engine.close();
        session.id
    };

    let engine = Engine::open(&path).unwrap();
    let image = engine.load_session(id, true).unwrap();
    assert_eq!(image.session.name, "pilot");
    assert_eq!(image.rom, rom_a());
    assert_eq!(image.memory.as_deref(), Some(&memory[..]));
    assert_eq!(image.savestate.as_deref(), Some(&b"state-blob"[..]));
}

#[test]
fn immutable_session_fields_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path().join("state.pv")).unwrap();

    let session = engine
        .add_session("a", "dev", 512, &rom_a(), None, None)
        .unwrap();

    let mut changed = session.clone();
    changed.device = "other".to_string();
    assert!(matches!(
        engine.update_session(&changed),
        Err(StoreError::ImmutableField("device"))
    ));

    let mut changed = session.clone();
    changed.ram_size = 1024;
    assert!(matches!(
        engine.update_session(&changed),
        Err(StoreError::ImmutableField("ram_size"))
    ));

    let mut changed = session.clone();
    changed.rom = "0000".to_string();
    assert!(matches!(
        engine.update_session(&changed),
        Err(StoreError::ImmutableField("rom"))
    ));

    // The mutable field goes through, and the rejected updates left no
    // trace.
    engine.rename_session(session.id, "b").unwrap();
    let stored = engine.get_session(session.id).unwrap().unwrap();
    assert_eq!(stored.name, "b");
    assert_eq!(stored.device, "dev");
}

#[test]
fn rom_blob_is_shared_and_deleted_with_its_last_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.pv");

    let engine = Engine::open(&path).unwrap();
    let s1 = engine
        .add_session("one", "dev", 512, &rom_a(), None, None)
        .unwrap();
    let s2 = engine
        .add_session("two", "dev", 512, &rom_a(), None, None)
        .unwrap();
    let s3 = engine
        .add_session("three", "dev", 512, &rom_b(), None, None)
        .unwrap();
    assert_eq!(s1.rom, s2.rom);
    assert_ne!(s1.rom, s3.rom);

    // Deleting one of two sharers keeps the blob.
    engine.delete_session(s1.id).unwrap();
    assert_eq!(engine.load_session(s2.id, false).unwrap().rom, rom_a());

    engine.delete_session(s2.id).unwrap();
    engine.close();

    // Inspect the rom collection directly: only the b blob survives.
    let mut store = Store::open(&path, StoreOptions::default()).unwrap();
    let tx = store.begin(&[Collection::Rom]).unwrap();
    let hashes: Vec<Key> = tx
        .iter(Collection::Rom)
        .unwrap()
        .map(|(k, _)| k.clone())
        .collect();
    assert_eq!(hashes, vec![Key::name(s3.rom.clone())]);
}

#[test]
fn delete_session_cascades_memory_and_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.pv");

    let engine = Engine::open(&path).unwrap();
    let memory = vec![0x42u8; (2 * PAGE_SIZE_RAM) as usize];
    let session = engine
        .add_session("s", "dev", 2 * PAGE_SIZE_RAM, &rom_a(), Some(&memory), Some(b"x"))
        .unwrap();
    engine.delete_session(session.id).unwrap();
    // Deleting again is a quiet no-op.
    engine.delete_session(session.id).unwrap();
    engine.close();

    let mut store = Store::open(&path, StoreOptions::default()).unwrap();
    let tx = store
        .begin(&[Collection::Memory, Collection::MemoryMeta, Collection::State])
        .unwrap();
    assert_eq!(tx.iter(Collection::Memory).unwrap().count(), 0);
    assert_eq!(tx.iter(Collection::MemoryMeta).unwrap().count(), 0);
    assert_eq!(tx.iter(Collection::State).unwrap().count(), 0);
}

#[test]
fn reset_session_keeps_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path().join("state.pv")).unwrap();

    let memory = vec![0x42u8; PAGE_SIZE_RAM as usize];
    let session = engine
        .add_session("s", "dev", PAGE_SIZE_RAM, &rom_a(), Some(&memory), Some(b"x"))
        .unwrap();
    engine.reset_session(session.id).unwrap();

    let image = engine.load_session(session.id, true).unwrap();
    assert_eq!(image.session.name, "s");
    assert_eq!(image.memory, None);
    assert_eq!(image.savestate, None);
}

#[test]
fn cards_roundtrip_and_enforce_their_size() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path().join("state.pv")).unwrap();

    // Sizes must be page multiples.
    assert!(engine.add_card("bad", 1000, None).is_err());

    let size = 2 * PAGE_SIZE_CARD;
    let mut data = vec![0u8; size as usize];
    data[10] = 0xEE;

    let card = engine.add_card("sd", size, Some(&data)).unwrap();
    assert_eq!(card.id, 1);
    assert_eq!(card.card_id.len(), 32);
    assert_eq!(engine.read_card(card.id, true).unwrap(), data);

    // An empty card reads back as zeros.
    let empty = engine.add_card("blank", PAGE_SIZE_CARD, None).unwrap();
    assert_eq!(
        engine.read_card(empty.id, true).unwrap(),
        vec![0u8; PAGE_SIZE_CARD as usize]
    );

    // Rewrite with a mismatched length is refused.
    assert!(engine.write_card(card.id, &data[..100]).is_err());

    data[20] = 0x77;
    engine.write_card(card.id, &data).unwrap();
    assert_eq!(engine.read_card(card.id, true).unwrap(), data);

    engine.delete_card(card.id).unwrap();
    assert!(engine.get_card(card.id).unwrap().is_none());
    assert!(matches!(
        engine.read_card(card.id, false),
        Err(StoreError::NotFound { kind: "card", .. })
    ));
}

#[test]
fn card_identity_and_size_are_immutable() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path().join("state.pv")).unwrap();

    let card = engine.add_card("sd", PAGE_SIZE_CARD, None).unwrap();

    let mut changed = card.clone();
    changed.size = 2 * PAGE_SIZE_CARD;
    assert!(matches!(
        engine.update_card(&changed),
        Err(StoreError::ImmutableField("size"))
    ));

    let mut changed = card.clone();
    changed.card_id = "forged".to_string();
    assert!(matches!(
        engine.update_card(&changed),
        Err(StoreError::ImmutableField("card_id"))
    ));

    let mut changed = card.clone();
    changed.name = "renamed".to_string();
    changed.mounted = true;
    engine.update_card(&changed).unwrap();
    let stored = engine.get_card(card.id).unwrap().unwrap();
    assert_eq!(stored.name, "renamed");
    assert!(stored.mounted);
}

#[test]
fn change_events_fire_after_commit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path().join("state.pv")).unwrap();

    let session_events = Arc::new(AtomicU32::new(0));
    {
        let session_events = Arc::clone(&session_events);
        engine.events().session_changed.subscribe(move |change| {
            assert_eq!(change.id, 1);
            session_events.fetch_add(1, Ordering::SeqCst);
        });
    }

    let session = engine
        .add_session("s", "dev", 512, &rom_a(), None, None)
        .unwrap();
    engine.rename_session(session.id, "renamed").unwrap();
    engine.delete_session(session.id).unwrap();

    // add, rename, delete.
    assert_eq!(session_events.load(Ordering::SeqCst), 3);
}
