// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::backend::{BackendErr, BatchOp, StoreBackend, WriteBatch};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use triomphe::Arc;
use xxhash_rust::xxh3::xxh3_64;

type Shard = RwLock<HashMap<Vec<u8>, Vec<u8>>>;

/// In memory backend split into one shard per core.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    shards: Arc<Vec<Shard>>,
    available: Arc<AtomicBool>,
    writable: Arc<AtomicBool>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(num_cpus::get())
    }

    #[must_use]
    pub fn with_shards(count: usize) -> Self {
        let mut shards = Vec::with_capacity(count.max(1));

        for _ in 0..count.max(1) {
            shards.push(RwLock::new(HashMap::new()));
        }

        Self {
            shards: Arc::new(shards),
            available: Arc::new(AtomicBool::new(true)),
            writable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulates an outage. Every call fails with `BackendErr::Unavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Like [`Self::set_available`] but reads keep working.
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn shard_idx(&self, key: &[u8]) -> usize {
        (xxh3_64(key) % self.shards.len() as u64) as usize
    }

    fn check_available(&self) -> Result<(), BackendErr> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendErr::Unavailable)
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendErr> {
        self.check_available()?;
        Ok(self.shards[self.shard_idx(key)].read().get(key).cloned())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), BackendErr> {
        self.check_available()?;

        if !self.writable.load(Ordering::SeqCst) {
            return Err(BackendErr::Unavailable);
        }

        // Lock every shard in index order so readers never observe half a batch
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.write()).collect();

        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    let idx = self.shard_idx(&key);
                    guards[idx].insert(key, value);
                }

                BatchOp::Delete(key) => {
                    let idx = self.shard_idx(&key);
                    guards[idx].remove(&key);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let backend = MemoryBackend::with_shards(4);
        backend.put(b"a", b"1").unwrap();
        assert_eq!(backend.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(backend.exists(b"a").unwrap());
        backend.delete(b"a").unwrap();
        assert_eq!(backend.get(b"a").unwrap(), None);
        assert!(backend.is_empty());
    }

    #[test]
    fn batch_applies_in_order() {
        let backend = MemoryBackend::with_shards(3);
        let mut batch = WriteBatch::default();
        batch.put(b"k".to_vec(), b"1".to_vec());
        batch.delete(b"k".to_vec());
        batch.put(b"k".to_vec(), b"2".to_vec());
        batch.put(b"j".to_vec(), b"3".to_vec());
        backend.write_batch(batch).unwrap();
        assert_eq!(backend.get(b"k").unwrap(), Some(b"2".to_vec()));
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn clones_share_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        clone.put(b"x", b"y").unwrap();
        assert_eq!(backend.get(b"x").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn unavailable_backend_fails() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        assert_eq!(backend.get(b"x"), Err(BackendErr::Unavailable));
        assert_eq!(backend.put(b"x", b"y"), Err(BackendErr::Unavailable));
        backend.set_available(true);
        assert!(backend.put(b"x", b"y").is_ok());
    }

    #[test]
    fn read_only_backend_rejects_writes() {
        let backend = MemoryBackend::new();
        backend.put(b"x", b"y").unwrap();
        backend.set_writable(false);
        assert_eq!(backend.get(b"x").unwrap(), Some(b"y".to_vec()));
        assert_eq!(backend.delete(b"x"), Err(BackendErr::Unavailable));
        backend.set_writable(true);
        assert!(backend.delete(b"x").is_ok());
    }
}
