// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::backend::{StoreBackend, WriteBatch};
use crate::chain::store::{StoreErr, VersionedStore};
use crate::primitives::{Account, Address, Hash256, ADDRESS_BYTES};

/// Marker value for set-like tables.
const PRESENT: &[u8] = &[1];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerErr {
    /// Underlying store error
    Store(StoreErr),

    /// Stored account could not be decoded
    CorruptAccount,

    /// Account could not be encoded
    Encoding,
}

impl From<StoreErr> for LedgerErr {
    fn from(other: StoreErr) -> Self {
        Self::Store(other)
    }
}

/// Account state plus the uniqueness sets transactions are checked against.
/// Every table shares the same logical transaction boundaries.
#[derive(Debug)]
pub struct AccountLedger<B: StoreBackend> {
    backend: B,
    accounts: VersionedStore<B>,
    tx_hashes: VersionedStore<B>,
    zether_nonces: VersionedStore<B>,
}

impl<B: StoreBackend> AccountLedger<B> {
    pub fn new(backend: B) -> Self {
        Self {
            accounts: VersionedStore::new("accounts", ADDRESS_BYTES, backend.clone()),
            tx_hashes: VersionedStore::new("txs", 32, backend.clone()),
            zether_nonces: VersionedStore::new("zether_nonces", 32, backend.clone()),
            backend,
        }
    }

    pub fn get_account(&mut self, address: &Address) -> Result<Option<Account>, LedgerErr> {
        match self.accounts.get(address.as_bytes())? {
            Some(bytes) => crate::codec::decode(&bytes)
                .map(Some)
                .map_err(|_| LedgerErr::CorruptAccount),
            None => Ok(None),
        }
    }

    /// Stages the account. Empty accounts are deleted instead.
    pub fn update_account(
        &mut self,
        address: &Address,
        account: &Account,
    ) -> Result<(), LedgerErr> {
        if account.is_empty() {
            self.accounts.delete(address.as_bytes())?;
            return Ok(());
        }

        let bytes = crate::codec::encode_to_vec(account).map_err(|_| LedgerErr::Encoding)?;
        self.accounts.update(address.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn delete_account(&mut self, address: &Address) -> Result<(), LedgerErr> {
        self.accounts.delete(address.as_bytes())?;
        Ok(())
    }

    pub fn is_tx_included(&mut self, hash: &Hash256) -> Result<bool, LedgerErr> {
        Ok(self.tx_hashes.exists(hash.as_bytes())?)
    }

    pub fn include_tx(&mut self, hash: &Hash256) -> Result<(), LedgerErr> {
        self.tx_hashes.update(hash.as_bytes(), PRESENT.to_vec())?;
        Ok(())
    }

    pub fn is_zether_nonce_spent(&mut self, nonce: &Hash256) -> Result<bool, LedgerErr> {
        Ok(self.zether_nonces.exists(nonce.as_bytes())?)
    }

    pub fn spend_zether_nonce(&mut self, nonce: &Hash256) -> Result<(), LedgerErr> {
        self.zether_nonces.update(nonce.as_bytes(), PRESENT.to_vec())?;
        Ok(())
    }

    pub fn commit(&mut self) {
        for table in self.tables_mut() {
            table.commit();
        }
    }

    pub fn rollback(&mut self) {
        for table in self.tables_mut() {
            table.rollback();
        }
    }

    pub fn write_to_store(&mut self) -> Result<(), LedgerErr> {
        for table in self.tables_mut() {
            table.write_to_store()?;
        }

        Ok(())
    }

    /// Commits the staged changes and flushes everything not yet stored in
    /// one backend batch. If the batch fails the staged changes are discarded
    /// and the committed state is left as it was.
    pub fn commit_to_store(&mut self) -> Result<(), LedgerErr> {
        self.commit_batch(WriteBatch::default())
    }

    /// Same as [`Self::commit_to_store`], saving the transition log of the
    /// staged changes under `prefix` and dropping the logs under `expired`
    /// in the same batch.
    pub fn commit_to_store_with_transitions(
        &mut self,
        prefix: &[u8],
        expired: &[&[u8]],
    ) -> Result<(), LedgerErr> {
        let mut batch = WriteBatch::default();

        if let Err(err) = self.stage_transitions(prefix, expired, &mut batch) {
            self.rollback();
            return Err(err.into());
        }

        self.commit_batch(batch)
    }

    /// Commits the undo staged by [`Self::read_transitions`] and drops the
    /// log under `prefix` in one backend batch.
    pub fn commit_undo_to_store(&mut self, prefix: &[u8]) -> Result<(), LedgerErr> {
        let mut batch = WriteBatch::default();

        for table in self.tables() {
            table.stage_delete_transitions(prefix, &mut batch);
        }

        self.commit_batch(batch)
    }

    pub fn write_transitions(&mut self, prefix: &[u8]) -> Result<(), LedgerErr> {
        for table in self.tables_mut() {
            table.write_transitional_changes_to_store(prefix)?;
        }

        Ok(())
    }

    /// Stages the undo of the changes saved under `prefix`. Does not commit.
    pub fn read_transitions(&mut self, prefix: &[u8]) -> Result<(), LedgerErr> {
        let result = self
            .tables_mut()
            .into_iter()
            .try_for_each(|table| table.read_transitional_changes_from_store(prefix));

        if let Err(err) = result {
            self.rollback();
            return Err(err.into());
        }

        Ok(())
    }

    pub fn delete_transitions(&mut self, prefix: &[u8]) -> Result<(), LedgerErr> {
        for table in self.tables_mut() {
            table.delete_transitional_changes_from_store(prefix)?;
        }

        Ok(())
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.accounts.has_changes()
            || self.tx_hashes.has_changes()
            || self.zether_nonces.has_changes()
    }

    /// Drops cached reads once everything is flushed.
    pub fn clear_cache(&mut self) {
        for table in self.tables_mut() {
            table.clear_cache();
        }
    }

    fn stage_transitions(
        &self,
        prefix: &[u8],
        expired: &[&[u8]],
        batch: &mut WriteBatch,
    ) -> Result<(), StoreErr> {
        for table in self.tables() {
            table.stage_transitions(prefix, batch)?;

            for old in expired {
                table.stage_delete_transitions(old, batch);
            }
        }

        Ok(())
    }

    fn flush_batch(&self, mut batch: WriteBatch) -> Result<(), StoreErr> {
        for table in self.tables() {
            table.stage_flush(&mut batch)?;
        }

        if batch.is_empty() {
            return Ok(());
        }

        self.backend.write_batch(batch)?;
        Ok(())
    }

    fn commit_batch(&mut self, batch: WriteBatch) -> Result<(), LedgerErr> {
        if let Err(err) = self.flush_batch(batch) {
            self.rollback();
            return Err(err.into());
        }

        for table in self.tables_mut() {
            table.commit_stored();
        }

        Ok(())
    }

    fn tables(&self) -> [&VersionedStore<B>; 3] {
        [&self.accounts, &self.tx_hashes, &self.zether_nonces]
    }

    fn tables_mut(&mut self) -> [&mut VersionedStore<B>; 3] {
        [
            &mut self.accounts,
            &mut self.tx_hashes,
            &mut self.zether_nonces,
        ]
    }
}
