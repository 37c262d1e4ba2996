// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

mod worker;

use crate::chain::{ChainTip, StoreBackend};
use crate::consensus::*;
use crate::primitives::{Address, Asset, Hash256, Transaction, TxVerifyErr};
use arc_swap::ArcSwap;
use chrono::prelude::*;
use crossbeam_channel::{bounded, unbounded, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::*;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use worker::{Worker, WorkerCtrl};

#[derive(Debug, Clone, PartialEq)]
pub enum MempoolErr {
    /// A transaction with the same content hash is already pending
    AlreadyExists,

    /// The transaction can never fit in a block
    TooLarge,

    /// No fee asset pays at least the minimum rate per byte
    FeeTooLow,

    /// A pending transaction already spends one of the hidden balance nonces
    ZetherNonceExists,

    /// Transaction failed stateless verification
    Tx(TxVerifyErr),

    /// The worker thread is gone
    WorkerStopped,
}

impl From<TxVerifyErr> for MempoolErr {
    fn from(other: TxVerifyErr) -> Self {
        Self::Tx(other)
    }
}

#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Upper bound of the candidate set, in serialized bytes.
    pub max_block_size: u64,

    pub max_tx_size: u64,

    /// Minimum native fee per serialized byte accepted from peers.
    pub min_fee_per_byte: Money,

    /// Minimum fee per serialized byte of every other asset accepted as fee.
    pub asset_fees_per_byte: BTreeMap<Asset, Money>,

    /// Pending transactions older than this are evicted.
    pub tx_ttl_secs: u64,

    pub prune_interval_secs: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_block_size: MAX_BYTES_PER_BLOCK,
            max_tx_size: TRANSACTION_LIMIT_SIZE,
            min_fee_per_byte: NATIVE_FEE_PER_BYTE,
            asset_fees_per_byte: BTreeMap::new(),
            tx_ttl_secs: DEFAULT_MEMPOOL_TX_TTL_SECS,
            prune_interval_secs: 60,
        }
    }
}

impl MempoolConfig {
    /// Accepted fee assets with their minimum rate, native asset first.
    pub fn fee_rates(&self) -> impl Iterator<Item = (Asset, Money)> + '_ {
        std::iter::once((Asset::NATIVE, self.min_fee_per_byte)).chain(
            self.asset_fees_per_byte
                .iter()
                .filter(|(asset, _)| !asset.is_native())
                .map(|(asset, rate)| (*asset, *rate)),
        )
    }
}

/// A pending transaction along with the data it is ordered by.
#[derive(Debug, Clone, PartialEq)]
pub struct MempoolTx {
    pub tx: Transaction,
    pub hash: Hash256,
    pub size: u64,
    pub fee_per_byte: Money,

    /// Asset `fee_per_byte` is paid in.
    pub fee_asset: Asset,

    pub inserted_at: i64,
    pub chain_height_at_insertion: u64,

    /// Sender of transparent transactions.
    pub sender: Option<Address>,

    /// Sender nonce. Hidden balance transactions use 0.
    pub nonce: u64,
}

impl MempoolTx {
    /// Runs every check that doesn't need chain state. Transactions from the
    /// node's own wallets are accepted with the minimum rate when their fee
    /// doesn't qualify.
    pub fn new(
        tx: Transaction,
        config: &MempoolConfig,
        height: u64,
        local: bool,
    ) -> Result<Self, MempoolErr> {
        let size = tx.serialized_size()?.max(1);

        if size > config.max_tx_size || size > config.max_block_size {
            return Err(MempoolErr::TooLarge);
        }

        tx.verify_signature()?;

        let fees = tx.compute_fees();
        let selected = config.fee_rates().find_map(|(asset, min_rate)| {
            let rate = fees.get(&asset).map(|fee| fee / size)?;
            (rate > 0 && rate >= min_rate).then_some((asset, rate))
        });

        let (fee_asset, fee_per_byte) = match selected {
            Some(selected) => selected,
            None if local => (Asset::NATIVE, config.min_fee_per_byte),
            None => return Err(MempoolErr::FeeTooLow),
        };

        let (sender, nonce) = match tx.sender_nonce() {
            Some((sender, nonce)) => (Some(sender), nonce),
            None => (None, 0),
        };

        Ok(Self {
            hash: tx.content_hash()?,
            tx,
            size,
            fee_per_byte,
            fee_asset,
            inserted_at: Utc::now().timestamp(),
            chain_height_at_insertion: height,
            sender,
            nonce,
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: i64, ttl_secs: u64) -> bool {
        now.saturating_sub(self.inserted_at) >= ttl_secs as i64
    }
}

/// Candidate block body derived for one chain head.
#[derive(Debug, Clone, Default)]
pub struct MempoolResult {
    pub txs: Vec<Arc<MempoolTx>>,
    pub total_size_bytes: u64,
    pub chain_hash: Hash256,
    pub chain_height: u64,
}

impl MempoolResult {
    fn empty(chain_hash: Hash256, chain_height: u64) -> Self {
        Self {
            chain_hash,
            chain_height,
            ..Default::default()
        }
    }
}

/// Hash and hidden nonce index shared between the handle and the worker.
#[derive(Debug, Default)]
pub(crate) struct PoolIndex {
    txs: DashMap<Hash256, Arc<MempoolTx>>,
    zether_nonces: DashMap<Hash256, Hash256>,
}

impl PoolIndex {
    fn admit(&self, tx: Arc<MempoolTx>) -> Result<(), MempoolErr> {
        let nonces = tx.tx.zether_nonces();

        if nonces.iter().collect::<HashSet<_>>().len() != nonces.len() {
            return Err(MempoolErr::ZetherNonceExists);
        }

        match self.txs.entry(tx.hash) {
            Entry::Occupied(_) => Err(MempoolErr::AlreadyExists),
            Entry::Vacant(entry) => {
                let mut claimed = Vec::with_capacity(nonces.len());

                for nonce in &nonces {
                    // Shard guard is dropped before the next nonce is claimed
                    let taken = match self.zether_nonces.entry(*nonce) {
                        Entry::Occupied(_) => true,
                        Entry::Vacant(slot) => {
                            slot.insert(tx.hash);
                            false
                        }
                    };

                    if taken {
                        break;
                    }

                    claimed.push(*nonce);
                }

                if claimed.len() != nonces.len() {
                    for nonce in &claimed {
                        self.zether_nonces.remove_if(nonce, |_, owner| owner == &tx.hash);
                    }

                    return Err(MempoolErr::ZetherNonceExists);
                }

                entry.insert(tx);
                Ok(())
            }
        }
    }

    fn remove(&self, hash: &Hash256) -> Option<Arc<MempoolTx>> {
        let (_, tx) = self.txs.remove(hash)?;

        for nonce in tx.tx.zether_nonces() {
            self.zether_nonces.remove_if(&nonce, |_, owner| owner == hash);
        }

        Some(tx)
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.txs.contains_key(hash)
    }
}

/// Handle to the pending transaction pool. A single worker thread derives the
/// candidate block body; readers load the latest snapshot without locking.
pub struct Mempool {
    config: MempoolConfig,
    index: Arc<PoolIndex>,
    result: Arc<ArcSwap<MempoolResult>>,
    head_height: AtomicU64,
    ctrl_send: Sender<WorkerCtrl>,
    remove_send: Sender<Vec<Hash256>>,
    insert_send: Sender<Vec<Arc<MempoolTx>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Mempool {
    /// Spawns the worker. The candidate set is derived against state flushed
    /// to `backend` as of `head`.
    pub fn new<B: StoreBackend>(config: MempoolConfig, backend: B, head: ChainTip) -> Self {
        let (ctrl_send, ctrl_recv) = unbounded();
        let (remove_send, remove_recv) = unbounded();
        let (insert_send, insert_recv) = unbounded();
        let index = Arc::new(PoolIndex::default());
        let result = Arc::new(ArcSwap::from_pointee(MempoolResult::empty(
            head.hash,
            head.height,
        )));

        let worker = Worker::new(
            config.clone(),
            backend,
            head,
            index.clone(),
            result.clone(),
            ctrl_recv,
            remove_recv,
            insert_recv,
        );
        let handle = thread::spawn(move || worker.run());

        Self {
            config,
            index,
            result,
            head_height: AtomicU64::new(head.height),
            ctrl_send,
            remove_send,
            insert_send,
            worker: Mutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    pub fn insert(&self, tx: Transaction) -> Result<Arc<MempoolTx>, MempoolErr> {
        self.admit(tx, false)
    }

    /// Inserts a transaction created by this node's wallet.
    pub fn insert_local(&self, tx: Transaction) -> Result<Arc<MempoolTx>, MempoolErr> {
        self.admit(tx, true)
    }

    /// Verifies the batch in parallel and hands every accepted transaction to
    /// the worker in one message.
    pub fn insert_batch(&self, txs: Vec<Transaction>) -> Vec<Result<Arc<MempoolTx>, MempoolErr>> {
        let height = self.head_height.load(Ordering::Acquire);
        let prepared: Vec<_> = txs
            .into_par_iter()
            .map(|tx| MempoolTx::new(tx, &self.config, height, false).map(Arc::new))
            .collect();

        let mut admitted = Vec::with_capacity(prepared.len());
        let mut results = Vec::with_capacity(prepared.len());

        for tx in prepared {
            let result = tx.and_then(|tx| {
                self.index.admit(tx.clone())?;
                admitted.push(tx.clone());
                Ok(tx)
            });
            results.push(result);
        }

        if !admitted.is_empty() {
            debug!("Admitted {} of {} transactions", admitted.len(), results.len());

            if self.insert_send.send(admitted).is_err() {
                error!("Mempool worker is not running");
            }
        }

        results
    }

    /// Removes a pending transaction. Returns false if it was not pending.
    pub fn remove(&self, hash: &Hash256) -> bool {
        self.remove_batch(std::slice::from_ref(hash)) == 1
    }

    /// Removes pending transactions, returning how many were pending.
    pub fn remove_batch(&self, hashes: &[Hash256]) -> usize {
        let removed: Vec<_> = hashes
            .iter()
            .filter(|hash| self.index.remove(hash).is_some())
            .copied()
            .collect();
        let count = removed.len();

        if !removed.is_empty() && self.remove_send.send(removed).is_err() {
            error!("Mempool worker is not running");
        }

        count
    }

    #[must_use]
    pub fn exists_by_hash(&self, hash: &Hash256) -> bool {
        self.index.contains(hash)
    }

    #[must_use]
    pub fn get(&self, hash: &Hash256) -> Option<Arc<MempoolTx>> {
        self.index.txs.get(hash).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.txs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.txs.is_empty()
    }

    /// First nonce at or after `chain_nonce` not used by a pending transaction of `sender`.
    #[must_use]
    pub fn next_nonce(&self, sender: &Address, chain_nonce: u64) -> u64 {
        let taken: BTreeSet<u64> = self
            .index
            .txs
            .iter()
            .filter(|entry| entry.sender.as_ref() == Some(sender))
            .map(|entry| entry.nonce)
            .collect();

        let mut nonce = chain_nonce;
        while taken.contains(&nonce) {
            nonce += 1;
        }
        nonce
    }

    /// Pending transactions of `sender`, ordered by nonce.
    #[must_use]
    pub fn txs_by_sender(&self, sender: &Address) -> Vec<Arc<MempoolTx>> {
        let mut txs: Vec<_> = self
            .index
            .txs
            .iter()
            .filter(|entry| entry.sender.as_ref() == Some(sender))
            .map(|entry| entry.value().clone())
            .collect();
        txs.sort_by_key(|tx| tx.nonce);
        txs
    }

    /// Latest published candidate set.
    #[must_use]
    pub fn result(&self) -> Arc<MempoolResult> {
        self.result.load_full()
    }

    /// Candidate transactions if the latest result was derived for
    /// `chain_hash`, otherwise an empty set and `false`.
    #[must_use]
    pub fn candidate_block_body(&self, chain_hash: &Hash256) -> (Vec<Arc<MempoolTx>>, bool) {
        let result = self.result.load();

        if &result.chain_hash != chain_hash {
            return (vec![], false);
        }

        (result.txs.clone(), true)
    }

    /// Resets the candidate set for a new chain head. Returns once the worker
    /// has published an empty result for `hash`.
    pub fn update_work(&self, hash: Hash256, height: u64) -> Result<(), MempoolErr> {
        let (ack, ack_recv) = bounded(1);
        self.head_height.store(height, Ordering::Release);
        self.ctrl_send
            .send(WorkerCtrl::NewHead { hash, height, ack })
            .map_err(|_| MempoolErr::WorkerStopped)?;
        ack_recv.recv().map_err(|_| MempoolErr::WorkerStopped)
    }

    /// Blocks until the worker has processed every message sent so far and
    /// has nothing left to scan.
    pub fn settle(&self) -> Result<(), MempoolErr> {
        let (ack, ack_recv) = bounded(1);
        self.ctrl_send
            .send(WorkerCtrl::Settle(ack))
            .map_err(|_| MempoolErr::WorkerStopped)?;
        ack_recv.recv().map_err(|_| MempoolErr::WorkerStopped)
    }

    /// Stops the worker and waits for it to exit.
    pub fn shutdown(&self) {
        let _ = self.ctrl_send.send(WorkerCtrl::Shutdown);

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("Mempool worker panicked");
            }
        }
    }

    fn admit(&self, tx: Transaction, local: bool) -> Result<Arc<MempoolTx>, MempoolErr> {
        let height = self.head_height.load(Ordering::Acquire);
        let tx = Arc::new(MempoolTx::new(tx, &self.config, height, local)?);
        self.index.admit(tx.clone())?;
        trace!(
            "Admitted tx {} ({} bytes, {} per byte)",
            tx.hash,
            tx.size,
            tx.fee_per_byte
        );

        self.insert_send
            .send(vec![tx.clone()])
            .map_err(|_| MempoolErr::WorkerStopped)?;
        Ok(tx)
    }
}

impl Drop for Mempool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
