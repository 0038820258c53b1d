//! The in-memory store and its transactions.
//!
//! A [`Store`] keeps every collection as an ordered map and treats the
//! journal as the source of truth: `open` replays it, `commit` appends one
//! frame and then applies the same ops to the maps. Reads inside a
//! transaction see the transaction's own staged writes for exact-key
//! lookups; ordered scans (`iter`, `range`) see committed state only, which
//! is sufficient because callers scan before staging writes to the same
//! collection.
//!
//! ## Cross-process conflicts
//!
//! Several processes may hold the same file open. Appends are atomic at the
//! frame level, but the engine's lock protocol needs a stronger guarantee:
//! a transaction that began against journal offset N must not commit if
//! another instance has appended since. `commit` re-checks the file length
//! against the replayed offset and fails with `LockLost` on mismatch, which
//! makes the lock collection's read-check-write sequence atomic without any
//! OS-level file locking.

use std::ops::Bound;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use smallvec::SmallVec;
use std::collections::BTreeMap;

use super::journal::{FrameKind, Journal, FILE_HEADER_SIZE};
use super::value::{Key, Value};
use super::Collection;
use crate::encoding::Reader;
use crate::error::{Result, StoreError};

const OP_CREATE: u8 = 0x01;
const OP_PUT: u8 = 0x02;
const OP_DELETE: u8 = 0x03;
const OP_DELETE_RANGE: u8 = 0x04;
const OP_CLEAR: u8 = 0x05;

/// One mutation inside a commit frame. `DeleteRange` bounds are
/// start-inclusive, end-exclusive.
#[derive(Debug, Clone, PartialEq)]
enum Op {
    Create(Collection),
    Put(Collection, Key, Value),
    Delete(Collection, Key),
    DeleteRange(Collection, Key, Key),
    Clear(Collection),
}

impl Op {
    fn collection(&self) -> Collection {
        match self {
            Op::Create(c)
            | Op::Put(c, _, _)
            | Op::Delete(c, _)
            | Op::DeleteRange(c, _, _)
            | Op::Clear(c) => *c,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Op::Create(c) => {
                buf.push(OP_CREATE);
                buf.push(*c as u8);
            }
            Op::Put(c, k, v) => {
                buf.push(OP_PUT);
                buf.push(*c as u8);
                k.encode(buf);
                v.encode(buf);
            }
            Op::Delete(c, k) => {
                buf.push(OP_DELETE);
                buf.push(*c as u8);
                k.encode(buf);
            }
            Op::DeleteRange(c, start, end) => {
                buf.push(OP_DELETE_RANGE);
                buf.push(*c as u8);
                start.encode(buf);
                end.encode(buf);
            }
            Op::Clear(c) => {
                buf.push(OP_CLEAR);
                buf.push(*c as u8);
            }
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let tag = r.u8()?;
        let coll = Collection::from_byte(r.u8()?)
            .ok_or_else(|| StoreError::corrupt("unknown collection byte in op"))?;
        match tag {
            OP_CREATE => Ok(Op::Create(coll)),
            OP_PUT => Ok(Op::Put(coll, Key::decode(r)?, Value::decode(r)?)),
            OP_DELETE => Ok(Op::Delete(coll, Key::decode(r)?)),
            OP_DELETE_RANGE => Ok(Op::DeleteRange(coll, Key::decode(r)?, Key::decode(r)?)),
            OP_CLEAR => Ok(Op::Clear(coll)),
            tag => Err(StoreError::Corrupt(format!("invalid op tag: {tag:#04x}"))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Fsync the journal after every commit. Off by default: the data here
    /// is reconstructible emulator state, and the frame checksum already
    /// confines a crash to losing the newest commits.
    pub sync_writes: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { sync_writes: false }
    }
}

pub struct Store {
    journal: Option<Journal>,
    collections: HashMap<Collection, BTreeMap<Key, Value>>,
    version: u32,
    /// Journal bytes already applied to the in-memory maps.
    replayed: u64,
    scratch: Vec<u8>,
    options: StoreOptions,
    path: PathBuf,
}

impl Store {
    pub fn open(path: &Path, options: StoreOptions) -> Result<Store> {
        let (mut journal, header_version) = Journal::open(path)?;

        let mut collections = HashMap::new();
        let mut version = header_version;
        let end = journal.scan(FILE_HEADER_SIZE as u64, true, |kind, fver, ops, payload| {
            Self::apply_frame(&mut collections, &mut version, kind, fver, ops, payload)
        })?;
        if end < journal.len()? {
            journal.truncate(end)?;
        }

        Ok(Store {
            journal: Some(journal),
            collections,
            version,
            replayed: end,
            scratch: Vec::new(),
            options,
            path: path.to_path_buf(),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.journal.is_none()
    }

    /// Applies frames appended by other instances since the last replay.
    pub fn refresh(&mut self) -> Result<()> {
        let journal = self.journal.as_mut().ok_or(StoreError::Closed)?;
        let len = journal.len()?;
        if len < self.replayed {
            return Err(StoreError::corrupt(
                "journal shrank underneath an open store",
            ));
        }
        if len == self.replayed {
            return Ok(());
        }

        let collections = &mut self.collections;
        let version = &mut self.version;
        let end = journal.scan(self.replayed, false, |kind, fver, ops, payload| {
            Self::apply_frame(collections, version, kind, fver, ops, payload)
        })?;
        self.replayed = end;
        Ok(())
    }

    /// Starts a transaction over `scope`. The store is refreshed first so
    /// the transaction reads the newest committed state.
    pub fn begin(&mut self, scope: &[Collection]) -> Result<Transaction<'_>> {
        if self.journal.is_none() {
            return Err(StoreError::Closed);
        }
        self.refresh()?;
        let version = self.version;
        Ok(Transaction {
            store: self,
            scope: SmallVec::from_slice(scope),
            ops: Vec::new(),
            kind: FrameKind::Commit,
            version,
        })
    }

    /// Runs `migrate` if the stored schema is older than `target` and
    /// records the result as a single upgrade frame. A store newer than
    /// `target` was written by a newer build and is refused.
    pub fn upgrade<F>(&mut self, target: u32, migrate: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction<'_>, u32) -> Result<()>,
    {
        if self.journal.is_none() {
            return Err(StoreError::Closed);
        }
        self.refresh()?;

        let old = self.version;
        if old > target {
            return Err(StoreError::SchemaTooNew {
                found: old,
                supported: target,
            });
        }
        if old == target {
            return Ok(());
        }

        let mut tx = Transaction {
            store: self,
            scope: SmallVec::new(),
            ops: Vec::new(),
            kind: FrameKind::Upgrade,
            version: target,
        };
        migrate(&mut tx, old)?;
        tx.commit()
    }

    /// Rewrites the journal down to a single frame holding current state.
    /// The replacement is built beside the live file and swapped in with a
    /// rename.
    pub fn compact(&mut self) -> Result<()> {
        if self.journal.is_none() {
            return Err(StoreError::Closed);
        }
        self.refresh()?;

        let tmp_path = self.path.with_extension("compact");
        let mut replacement = Journal::create(&tmp_path, self.version)?;

        let mut payload = std::mem::take(&mut self.scratch);
        payload.clear();
        let mut op_count = 0u32;
        for coll in Collection::ALL {
            let Some(map) = self.collections.get(&coll) else {
                continue;
            };
            Op::Create(coll).encode(&mut payload);
            op_count += 1;
            for (key, value) in map {
                payload.push(OP_PUT);
                payload.push(coll as u8);
                key.encode(&mut payload);
                value.encode(&mut payload);
                op_count += 1;
            }
        }
        replacement.append(FrameKind::Commit, self.version, op_count, &payload, true)?;
        payload.clear();
        self.scratch = payload;

        self.journal = None;
        drop(replacement);
        std::fs::rename(&tmp_path, &self.path)?;

        let (journal, _) = Journal::open(&self.path)?;
        self.replayed = journal.len()?;
        self.journal = Some(journal);
        Ok(())
    }

    /// Flushes and drops the journal handle. Every later operation fails
    /// with `Closed`.
    pub fn close(&mut self) {
        if let Some(mut journal) = self.journal.take() {
            let _ = journal.sync();
        }
    }

    fn apply_frame(
        collections: &mut HashMap<Collection, BTreeMap<Key, Value>>,
        version: &mut u32,
        kind: FrameKind,
        frame_version: u32,
        op_count: u32,
        payload: &[u8],
    ) -> Result<()> {
        let mut r = Reader::new(payload);
        for _ in 0..op_count {
            let op = Op::decode(&mut r)?;
            Self::apply_op(collections, op)?;
        }
        if !r.is_empty() {
            return Err(StoreError::corrupt("trailing bytes in frame payload"));
        }
        if kind == FrameKind::Upgrade {
            *version = frame_version;
        }
        Ok(())
    }

    fn apply_op(
        collections: &mut HashMap<Collection, BTreeMap<Key, Value>>,
        op: Op,
    ) -> Result<()> {
        if !matches!(op, Op::Create(_)) && !collections.contains_key(&op.collection()) {
            return Err(StoreError::Corrupt(format!(
                "op on collection {:?} before it was created",
                op.collection().name()
            )));
        }
        match op {
            Op::Create(c) => {
                collections.entry(c).or_default();
            }
            Op::Put(c, k, v) => {
                if let Some(map) = collections.get_mut(&c) {
                    map.insert(k, v);
                }
            }
            Op::Delete(c, k) => {
                if let Some(map) = collections.get_mut(&c) {
                    map.remove(&k);
                }
            }
            Op::DeleteRange(c, start, end) => {
                if let Some(map) = collections.get_mut(&c) {
                    let doomed: Vec<Key> =
                        map.range(start..end).map(|(k, _)| k.clone()).collect();
                    for key in doomed {
                        map.remove(&key);
                    }
                }
            }
            Op::Clear(c) => {
                if let Some(map) = collections.get_mut(&c) {
                    map.clear();
                }
            }
        }
        Ok(())
    }
}

pub struct Transaction<'a> {
    store: &'a mut Store,
    scope: SmallVec<[Collection; 6]>,
    ops: Vec<Op>,
    kind: FrameKind,
    version: u32,
}

impl<'a> Transaction<'a> {
    /// Schema version the transaction will commit under.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn create_collection(&mut self, coll: Collection) -> Result<()> {
        self.check_scope(coll)?;
        self.ops.push(Op::Create(coll));
        Ok(())
    }

    pub fn put(&mut self, coll: Collection, key: Key, value: Value) -> Result<()> {
        self.check_write(coll)?;
        self.ops.push(Op::Put(coll, key, value));
        Ok(())
    }

    pub fn delete(&mut self, coll: Collection, key: Key) -> Result<()> {
        self.check_write(coll)?;
        self.ops.push(Op::Delete(coll, key));
        Ok(())
    }

    /// Deletes `[start, end)`.
    pub fn delete_range(&mut self, coll: Collection, start: Key, end: Key) -> Result<()> {
        self.check_write(coll)?;
        self.ops.push(Op::DeleteRange(coll, start, end));
        Ok(())
    }

    pub fn clear(&mut self, coll: Collection) -> Result<()> {
        self.check_write(coll)?;
        self.ops.push(Op::Clear(coll));
        Ok(())
    }

    /// Exact-key read. Sees this transaction's staged writes.
    pub fn get(&self, coll: Collection, key: &Key) -> Result<Option<Value>> {
        self.check_scope(coll)?;
        for op in self.ops.iter().rev() {
            match op {
                Op::Put(c, k, v) if *c == coll && k == key => return Ok(Some(v.clone())),
                Op::Delete(c, k) if *c == coll && k == key => return Ok(None),
                Op::DeleteRange(c, start, end)
                    if *c == coll && key >= start && key < end =>
                {
                    return Ok(None)
                }
                Op::Clear(c) if *c == coll => return Ok(None),
                _ => {}
            }
        }
        self.check_exists(coll)?;
        Ok(self
            .store
            .collections
            .get(&coll)
            .and_then(|m| m.get(key))
            .cloned())
    }

    /// Ordered scan over committed state. Staged writes are not visible;
    /// callers scan before staging writes to the same collection.
    pub fn range(
        &self,
        coll: Collection,
        bounds: (Bound<Key>, Bound<Key>),
    ) -> Result<impl Iterator<Item = (&Key, &Value)>> {
        self.check_scope(coll)?;
        self.check_exists(coll)?;
        Ok(self
            .store
            .collections
            .get(&coll)
            .map(|m| m.range(bounds))
            .into_iter()
            .flatten())
    }

    /// Full ordered scan over committed state.
    pub fn iter(&self, coll: Collection) -> Result<impl Iterator<Item = (&Key, &Value)>> {
        self.check_scope(coll)?;
        self.check_exists(coll)?;
        Ok(self
            .store
            .collections
            .get(&coll)
            .map(|m| m.iter())
            .into_iter()
            .flatten())
    }

    /// Writes all staged ops as one frame and applies them. An empty
    /// regular transaction is a no-op; an upgrade always writes its frame
    /// so the version bump is recorded.
    pub fn commit(self) -> Result<()> {
        let Transaction {
            store,
            ops,
            kind,
            version,
            ..
        } = self;

        if ops.is_empty() && kind == FrameKind::Commit {
            return Ok(());
        }

        let current = store.journal.as_mut().ok_or(StoreError::Closed)?.len()?;
        if current != store.replayed {
            // Another instance committed after this transaction began. Its
            // frames were not visible to our reads, so our writes may be
            // stale; catch up and report the conflict.
            store.refresh()?;
            return Err(StoreError::LockLost);
        }

        let mut payload = std::mem::take(&mut store.scratch);
        payload.clear();
        for op in &ops {
            op.encode(&mut payload);
        }

        let journal = store.journal.as_mut().ok_or(StoreError::Closed)?;
        let written = journal.append(
            kind,
            version,
            ops.len() as u32,
            &payload,
            store.options.sync_writes,
        )?;

        payload.clear();
        store.scratch = payload;

        for op in ops {
            Store::apply_op(&mut store.collections, op)?;
        }
        if kind == FrameKind::Upgrade {
            store.version = version;
        }
        store.replayed += written;
        Ok(())
    }

    /// Discards all staged ops.
    pub fn abort(self) {}

    fn check_scope(&self, coll: Collection) -> Result<()> {
        if self.kind == FrameKind::Upgrade || self.scope.contains(&coll) {
            Ok(())
        } else {
            Err(StoreError::Corrupt(format!(
                "collection {} outside transaction scope",
                coll.name()
            )))
        }
    }

    fn check_write(&mut self, coll: Collection) -> Result<()> {
        self.check_scope(coll)?;
        self.check_exists(coll)
    }

    fn check_exists(&self, coll: Collection) -> Result<()> {
        let created_here = self
            .ops
            .iter()
            .any(|op| matches!(op, Op::Create(c) if *c == coll));
        if created_here || self.store.collections.contains_key(&coll) {
            Ok(())
        } else {
            Err(StoreError::Corrupt(format!(
                "collection {} does not exist",
                coll.name()
            )))
        }
    }
}
