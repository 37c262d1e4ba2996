// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

mod memory;

pub use memory::*;

/// Interface to the underlying key/value store. Keys live in one flat
/// namespace; callers partition it by prefixing keys with a table name.
pub trait StoreBackend: Clone + Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendErr>;

    /// Applies every operation of the batch or none of them.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), BackendErr>;

    fn exists(&self, key: &[u8]) -> Result<bool, BackendErr> {
        Ok(self.get(key)?.is_some())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), BackendErr> {
        let mut batch = WriteBatch::default();
        batch.put(key.to_vec(), value.to_vec());
        self.write_batch(batch)
    }

    fn delete(&self, key: &[u8]) -> Result<(), BackendErr> {
        let mut batch = WriteBatch::default();
        batch.delete(key.to_vec());
        self.write_batch(batch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendErr {
    /// The store cannot be reached right now. Retrying later may succeed.
    Unavailable,

    /// Generic error
    Error(&'static str),
}
