// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Transactional key/value table layered over a [`StoreBackend`].
//!
//! Writes are staged in `changes` until [`VersionedStore::commit`] folds them
//! into the `committed` snapshot, which [`VersionedStore::write_to_store`]
//! later flushes to the backend. Before committing, the pre-images of the
//! staged keys can be saved as a transition log so that the block that
//! produced them can be undone on a reorg.

use crate::chain::backend::{BackendErr, StoreBackend, WriteBatch};
use log::*;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreErr {
    /// Key length does not match the table key length
    InvalidKeyLength { expected: usize, got: usize },

    /// No transition log under the given prefix
    TransitionsNotFound,

    /// Transition log could not be decoded
    CorruptTransitions,

    /// Backend error
    Backend(BackendErr),
}

impl From<BackendErr> for StoreErr {
    fn from(other: BackendErr) -> Self {
        Self::Backend(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub status: ChangeStatus,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommittedStatus {
    Updated,
    Deleted,
    ViewedOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub status: CommittedStatus,
    pub value: Option<Vec<u8>>,

    /// Whether the backend holds `value`.
    pub stored: bool,
}

/// Ordered `(key, pre-image)` pairs.
type Transitions = Vec<(Vec<u8>, Option<Vec<u8>>)>;

#[derive(Debug)]
pub struct VersionedStore<B: StoreBackend> {
    name: &'static str,
    key_length: usize,
    backend: B,
    changes: HashMap<Vec<u8>, Change>,
    committed: HashMap<Vec<u8>, Committed>,
}

impl<B: StoreBackend> VersionedStore<B> {
    pub fn new(name: &'static str, key_length: usize, backend: B) -> Self {
        Self {
            name,
            key_length,
            backend,
            changes: HashMap::new(),
            committed: HashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn key_length(&self) -> usize {
        self.key_length
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreErr> {
        self.check_key(key)?;

        if let Some(change) = self.changes.get(key) {
            return Ok(change.value.clone());
        }

        if let Some(committed) = self.committed.get(key) {
            return Ok(committed.value.clone());
        }

        let value = self.backend.get(&self.data_key(key))?;
        self.committed.insert(
            key.to_vec(),
            Committed {
                status: CommittedStatus::ViewedOnly,
                value: value.clone(),
                stored: true,
            },
        );

        Ok(value)
    }

    pub fn exists(&mut self, key: &[u8]) -> Result<bool, StoreErr> {
        self.check_key(key)?;

        if let Some(change) = self.changes.get(key) {
            return Ok(change.value.is_some());
        }

        if let Some(committed) = self.committed.get(key) {
            return Ok(committed.value.is_some());
        }

        Ok(self.get(key)?.is_some())
    }

    pub fn update(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreErr> {
        self.check_key(key)?;
        self.changes.insert(
            key.to_vec(),
            Change {
                status: ChangeStatus::Updated,
                value: Some(value),
            },
        );
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), StoreErr> {
        self.check_key(key)?;
        self.changes.insert(
            key.to_vec(),
            Change {
                status: ChangeStatus::Deleted,
                value: None,
            },
        );
        Ok(())
    }

    /// Folds staged changes into the committed snapshot.
    pub fn commit(&mut self) {
        for (key, change) in self.changes.drain() {
            let status = match change.status {
                ChangeStatus::Updated => CommittedStatus::Updated,
                ChangeStatus::Deleted => CommittedStatus::Deleted,
            };

            self.committed.insert(
                key,
                Committed {
                    status,
                    value: change.value,
                    stored: false,
                },
            );
        }
    }

    /// Discards staged changes.
    pub fn rollback(&mut self) {
        self.changes.clear();
    }

    /// Flushes committed entries the backend does not hold yet in a single batch.
    /// Nothing is marked as stored unless the whole batch succeeds.
    pub fn write_to_store(&mut self) -> Result<(), StoreErr> {
        let mut batch = WriteBatch::default();
        let mut flushed = Vec::new();

        for (key, committed) in &self.committed {
            if committed.stored {
                continue;
            }

            self.check_flush_key(key)?;

            match (committed.status, &committed.value) {
                (CommittedStatus::Updated, Some(value)) => {
                    batch.put(self.data_key(key), value.clone())
                }
                _ => batch.delete(self.data_key(key)),
            }

            flushed.push(key.clone());
        }

        if batch.is_empty() {
            return Ok(());
        }

        self.backend.write_batch(batch)?;

        for key in flushed {
            if let Some(committed) = self.committed.get_mut(&key) {
                committed.stored = true;
                committed.status = CommittedStatus::ViewedOnly;
            }
        }

        Ok(())
    }

    /// Persists the pre-images of every staged key under `prefix`. Must run
    /// before [`Self::commit`] since it reads the values the changes replace.
    pub fn write_transitional_changes_to_store(&mut self, prefix: &[u8]) -> Result<(), StoreErr> {
        let mut batch = WriteBatch::default();
        self.stage_transitions(prefix, &mut batch)?;
        self.backend.write_batch(batch)?;
        Ok(())
    }

    /// Adds the transition log of the staged keys under `prefix` to `batch`.
    pub fn stage_transitions(&self, prefix: &[u8], batch: &mut WriteBatch) -> Result<(), StoreErr> {
        let mut transitions: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();

        for key in self.changes.keys() {
            let prior = match self.committed.get(key) {
                Some(committed) => committed.value.clone(),
                None => self.backend.get(&self.data_key(key))?,
            };
            transitions.insert(key.clone(), prior);
        }

        let transitions: Transitions = transitions.into_iter().collect();
        let encoded = crate::codec::encode_to_vec(&transitions)
            .map_err(|_| StoreErr::CorruptTransitions)?;
        batch.put(self.transitions_key(prefix), encoded);

        trace!(
            "Staged {} transitions for table {} under {}",
            transitions.len(),
            self.name,
            hex::encode(prefix)
        );

        Ok(())
    }

    /// Adds the writes persisting both committed and staged state to `batch`.
    /// Memory is left as is until [`Self::commit_stored`] is called for a
    /// batch the backend accepted.
    pub fn stage_flush(&self, batch: &mut WriteBatch) -> Result<(), StoreErr> {
        for (key, committed) in &self.committed {
            if committed.stored || self.changes.contains_key(key) {
                continue;
            }

            self.check_flush_key(key)?;

            match (committed.status, &committed.value) {
                (CommittedStatus::Updated, Some(value)) => {
                    batch.put(self.data_key(key), value.clone());
                }
                _ => batch.delete(self.data_key(key)),
            }
        }

        for (key, change) in &self.changes {
            match &change.value {
                Some(value) => batch.put(self.data_key(key), value.clone()),
                None => batch.delete(self.data_key(key)),
            }
        }

        Ok(())
    }

    /// Commits staged changes and marks every committed entry as stored. Only
    /// valid once a batch filled by [`Self::stage_flush`] was written.
    pub fn commit_stored(&mut self) {
        self.commit();

        for committed in self.committed.values_mut() {
            if !committed.stored {
                committed.stored = true;
                committed.status = CommittedStatus::ViewedOnly;
            }
        }
    }

    pub fn stage_delete_transitions(&self, prefix: &[u8], batch: &mut WriteBatch) {
        batch.delete(self.transitions_key(prefix));
    }

    /// Stages the pre-images saved under `prefix`. A following [`Self::commit`]
    /// makes the undo visible.
    pub fn read_transitional_changes_from_store(&mut self, prefix: &[u8]) -> Result<(), StoreErr> {
        let encoded = self
            .backend
            .get(&self.transitions_key(prefix))?
            .ok_or(StoreErr::TransitionsNotFound)?;
        let transitions: Transitions =
            crate::codec::decode(&encoded).map_err(|_| StoreErr::CorruptTransitions)?;

        if transitions.iter().any(|(k, _)| k.len() != self.key_length) {
            return Err(StoreErr::CorruptTransitions);
        }

        for (key, prior) in transitions {
            let change = match prior {
                Some(value) => Change {
                    status: ChangeStatus::Updated,
                    value: Some(value),
                },
                None => Change {
                    status: ChangeStatus::Deleted,
                    value: None,
                },
            };
            self.changes.insert(key, change);
        }

        Ok(())
    }

    pub fn delete_transitional_changes_from_store(
        &mut self,
        prefix: &[u8],
    ) -> Result<(), StoreErr> {
        self.backend.delete(&self.transitions_key(prefix))?;
        Ok(())
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Number of committed entries waiting to be flushed.
    #[must_use]
    pub fn pending_flush(&self) -> usize {
        self.committed.values().filter(|c| !c.stored).count()
    }

    /// Drops committed entries the backend already holds.
    pub fn clear_cache(&mut self) {
        self.committed.retain(|_, c| !c.stored);
    }

    #[inline]
    fn check_key(&self, key: &[u8]) -> Result<(), StoreErr> {
        if key.len() != self.key_length {
            return Err(StoreErr::InvalidKeyLength {
                expected: self.key_length,
                got: key.len(),
            });
        }

        Ok(())
    }

    fn check_flush_key(&self, key: &[u8]) -> Result<(), StoreErr> {
        if key.len() != self.key_length {
            error!(
                "Refusing to flush table {}: key {} has length {}, expected {}",
                self.name,
                hex::encode(key),
                key.len(),
                self.key_length
            );
            return Err(StoreErr::InvalidKeyLength {
                expected: self.key_length,
                got: key.len(),
            });
        }

        Ok(())
    }

    fn data_key(&self, key: &[u8]) -> Vec<u8> {
        [self.name.as_bytes(), b":map:", key].concat()
    }

    fn transitions_key(&self, prefix: &[u8]) -> Vec<u8> {
        [self.name.as_bytes(), b":transitions:", prefix].concat()
    }

    #[cfg(test)]
    pub(crate) fn inject_committed(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.committed.insert(
            key,
            Committed {
                status: CommittedStatus::Updated,
                value: Some(value),
                stored: false,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn committed_entry(&self, key: &[u8]) -> Option<&Committed> {
        self.committed.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::backend::MemoryBackend;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    const KEY_LEN: usize = 4;

    fn store(backend: &MemoryBackend) -> VersionedStore<MemoryBackend> {
        VersionedStore::new("test", KEY_LEN, backend.clone())
    }

    #[derive(Clone, Debug)]
    enum Op {
        Update(u8, u8),
        Delete(u8),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            // Small key space so operations collide
            let key = u8::arbitrary(g) % 8;
            if bool::arbitrary(g) {
                Op::Update(key, u8::arbitrary(g))
            } else {
                Op::Delete(key)
            }
        }
    }

    fn key(k: u8) -> Vec<u8> {
        vec![k; KEY_LEN]
    }

    fn apply(
        store: &mut VersionedStore<MemoryBackend>,
        ops: &[Op],
    ) -> HashMap<Vec<u8>, Option<Vec<u8>>> {
        let mut expected = HashMap::new();

        for op in ops {
            match op {
                Op::Update(k, v) => {
                    store.update(&key(*k), vec![*v]).unwrap();
                    expected.insert(key(*k), Some(vec![*v]));
                }
                Op::Delete(k) => {
                    store.delete(&key(*k)).unwrap();
                    expected.insert(key(*k), None);
                }
            }
        }

        expected
    }

    #[quickcheck]
    fn store_round_trip(ops: Vec<Op>) -> bool {
        let backend = MemoryBackend::with_shards(2);
        let mut store = store(&backend);
        let expected = apply(&mut store, &ops);
        store.commit();
        store.write_to_store().unwrap();

        expected.iter().all(|(k, v)| {
            let data_key = [b"test:map:".as_slice(), k].concat();
            backend.get(&data_key).unwrap() == *v
        }) && store.pending_flush() == 0
    }

    #[quickcheck]
    fn rollback_idempotence(setup: Vec<Op>, ops: Vec<Op>) -> bool {
        let backend = MemoryBackend::with_shards(2);
        let mut store = store(&backend);
        apply(&mut store, &setup);
        store.commit();

        let before: Vec<_> = (0..8).map(|k| store.get(&key(k)).unwrap()).collect();
        apply(&mut store, &ops);
        store.rollback();
        let after: Vec<_> = (0..8).map(|k| store.get(&key(k)).unwrap()).collect();

        before == after && !store.has_changes()
    }

    #[quickcheck]
    fn transition_reversibility(setup: Vec<Op>, flushed: bool, ops: Vec<Op>) -> bool {
        let backend = MemoryBackend::with_shards(2);
        let mut store = store(&backend);
        apply(&mut store, &setup);
        store.commit();

        if flushed {
            store.write_to_store().unwrap();
        }

        let before: Vec<_> = (0..8).map(|k| store.get(&key(k)).unwrap()).collect();

        apply(&mut store, &ops);
        store.write_transitional_changes_to_store(b"block").unwrap();
        store.commit();
        store.write_to_store().unwrap();

        store.read_transitional_changes_from_store(b"block").unwrap();
        store.commit();
        store.write_to_store().unwrap();

        // Read both through the snapshot and straight from a fresh view of the backend
        let mut fresh = VersionedStore::new("test", KEY_LEN, backend.clone());
        let after: Vec<_> = (0..8).map(|k| store.get(&key(k)).unwrap()).collect();
        let after_fresh: Vec<_> = (0..8).map(|k| fresh.get(&key(k)).unwrap()).collect();

        before == after && before == after_fresh
    }

    #[test]
    fn reads_are_memoized_as_viewed_only() {
        let backend = MemoryBackend::with_shards(1);
        backend.put(b"test:map:aaaa", b"v").unwrap();
        let mut store = store(&backend);

        assert_eq!(store.get(b"aaaa").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get(b"bbbb").unwrap(), None);
        assert_eq!(
            store.committed_entry(b"aaaa").unwrap().status,
            CommittedStatus::ViewedOnly
        );
        assert_eq!(store.pending_flush(), 0);

        // Cached view survives a backend change
        backend.put(b"test:map:aaaa", b"w").unwrap();
        assert_eq!(store.get(b"aaaa").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn changes_shadow_committed() {
        let backend = MemoryBackend::with_shards(1);
        let mut store = store(&backend);
        store.update(b"aaaa", vec![1]).unwrap();
        store.commit();
        store.delete(b"aaaa").unwrap();

        assert!(!store.exists(b"aaaa").unwrap());
        store.rollback();
        assert!(store.exists(b"aaaa").unwrap());
        assert_eq!(backend.get(b"test:map:aaaa").unwrap(), None);
    }

    #[test]
    fn update_rejects_wrong_key_length() {
        let backend = MemoryBackend::with_shards(1);
        let mut store = store(&backend);
        assert_eq!(
            store.update(b"abc", vec![1]),
            Err(StoreErr::InvalidKeyLength {
                expected: KEY_LEN,
                got: 3
            })
        );
        assert!(store.delete(b"abcde").is_err());
        assert!(store.get(b"").is_err());
    }

    #[test]
    fn write_to_store_rejects_wrong_key_length() {
        let backend = MemoryBackend::with_shards(1);
        let mut store = store(&backend);
        store.update(b"aaaa", vec![1]).unwrap();
        store.commit();
        store.inject_committed(b"bad".to_vec(), vec![2]);

        assert!(matches!(
            store.write_to_store(),
            Err(StoreErr::InvalidKeyLength { .. })
        ));
        assert!(backend.is_empty());
    }

    #[test]
    fn failed_flush_keeps_entries_dirty() {
        let backend = MemoryBackend::with_shards(1);
        let mut store = store(&backend);
        store.update(b"aaaa", vec![1]).unwrap();
        store.commit();

        backend.set_available(false);
        assert_eq!(
            store.write_to_store(),
            Err(StoreErr::Backend(BackendErr::Unavailable))
        );
        assert_eq!(store.pending_flush(), 1);

        backend.set_available(true);
        store.write_to_store().unwrap();
        assert_eq!(store.pending_flush(), 0);
        assert_eq!(backend.get(b"test:map:aaaa").unwrap(), Some(vec![1]));
    }

    #[test]
    fn missing_and_corrupt_transitions() {
        let backend = MemoryBackend::with_shards(1);
        let mut store = store(&backend);
        assert_eq!(
            store.read_transitional_changes_from_store(b"nope"),
            Err(StoreErr::TransitionsNotFound)
        );

        backend.put(b"test:transitions:bad", &[0xff, 0xff]).unwrap();
        assert_eq!(
            store.read_transitional_changes_from_store(b"bad"),
            Err(StoreErr::CorruptTransitions)
        );
    }

    #[test]
    fn delete_transitions() {
        let backend = MemoryBackend::with_shards(1);
        let mut store = store(&backend);
        store.update(b"aaaa", vec![1]).unwrap();
        store.write_transitional_changes_to_store(b"p").unwrap();
        assert!(backend.exists(b"test:transitions:p").unwrap());
        store.delete_transitional_changes_from_store(b"p").unwrap();
        assert!(!backend.exists(b"test:transitions:p").unwrap());
    }
}
