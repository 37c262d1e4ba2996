// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::{AccountLedger, ChainTip, StoreBackend};
use crate::node::mempool::{MempoolConfig, MempoolResult, MempoolTx, PoolIndex};
use crate::primitives::{Hash256, TxVerifyErr};
use arc_swap::ArcSwap;
use chrono::prelude::*;
use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use itertools::Itertools;
use log::*;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shortest interval between two prune passes.
const MIN_TICK: Duration = Duration::from_millis(50);

pub(crate) enum WorkerCtrl {
    /// Start over against a new chain head. `ack` is answered once the empty
    /// result for the new head is published.
    NewHead {
        hash: Hash256,
        height: u64,
        ack: Sender<()>,
    },

    /// Answered once the worker is idle.
    Settle(Sender<()>),

    Shutdown,
}

/// Candidate set under construction, along with the private ledger view it
/// was applied to. The view is never flushed.
struct Candidate<B: StoreBackend> {
    ledger: AccountLedger<B>,
    txs: Vec<Arc<MempoolTx>>,
    included: HashSet<Hash256>,
    total_size: u64,

    /// Set once a transaction didn't fit. Nothing else is accumulated until
    /// the candidate is rebuilt.
    full: bool,
}

impl<B: StoreBackend> Candidate<B> {
    fn new(backend: B) -> Self {
        Self {
            ledger: AccountLedger::new(backend),
            txs: vec![],
            included: HashSet::new(),
            total_size: 0,
            full: false,
        }
    }

    /// Applies `sorted` in order, pass after pass, until a pass includes
    /// nothing new or the block is full. Transactions the chain already
    /// contains are collected in `on_chain`. Returns true if anything was
    /// included.
    fn extend(
        &mut self,
        sorted: &[Arc<MempoolTx>],
        height: u64,
        max_block_size: u64,
        on_chain: &mut HashSet<Hash256>,
    ) -> bool {
        let mut changed = false;

        while !self.full {
            let mut progress = false;

            for tx in sorted {
                if self.included.contains(&tx.hash) || on_chain.contains(&tx.hash) {
                    continue;
                }

                match tx.tx.apply_to_ledger(height, &mut self.ledger) {
                    Ok(()) if self.total_size + tx.size > max_block_size => {
                        self.ledger.rollback();
                        self.full = true;
                        trace!("Candidate set is full at {} bytes", self.total_size);
                        break;
                    }

                    Ok(()) => {
                        self.ledger.commit();
                        self.total_size += tx.size;
                        self.included.insert(tx.hash);
                        self.txs.push(tx.clone());
                        progress = true;
                    }

                    Err(TxVerifyErr::AlreadyIncluded) => {
                        on_chain.insert(tx.hash);
                    }

                    Err(err) => {
                        trace!("Leaving out tx {}: {:?}", tx.hash, err);
                    }
                }
            }

            if !progress {
                break;
            }

            changed = true;
        }

        changed
    }

    fn same_txs(&self, other: &Self) -> bool {
        self.txs.iter().map(|tx| tx.hash).eq(other.txs.iter().map(|tx| tx.hash))
    }
}

/// Fee per byte descending, then sender nonce ascending.
fn priority(a: &Arc<MempoolTx>, b: &Arc<MempoolTx>) -> Ordering {
    b.fee_per_byte
        .cmp(&a.fee_per_byte)
        .then(a.nonce.cmp(&b.nonce))
        .then(a.hash.cmp(&b.hash))
}

pub(crate) struct Worker<B: StoreBackend> {
    config: MempoolConfig,
    backend: B,
    index: Arc<PoolIndex>,
    result: Arc<ArcSwap<MempoolResult>>,
    ctrl_recv: Receiver<WorkerCtrl>,
    remove_recv: Receiver<Vec<Hash256>>,
    insert_recv: Receiver<Vec<Arc<MempoolTx>>>,
    head_hash: Hash256,
    head_height: u64,
    pending: HashMap<Hash256, Arc<MempoolTx>>,
    candidate: Candidate<B>,

    /// New transactions arrived since the last scan.
    needs_scan: bool,

    /// An included transaction left the pool, the candidate must be derived anew.
    needs_rebuild: bool,

    settles: Vec<Sender<()>>,
    last_prune: Instant,
    running: bool,
}

impl<B: StoreBackend> Worker<B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: MempoolConfig,
        backend: B,
        head: ChainTip,
        index: Arc<PoolIndex>,
        result: Arc<ArcSwap<MempoolResult>>,
        ctrl_recv: Receiver<WorkerCtrl>,
        remove_recv: Receiver<Vec<Hash256>>,
        insert_recv: Receiver<Vec<Arc<MempoolTx>>>,
    ) -> Self {
        Self {
            candidate: Candidate::new(backend.clone()),
            config,
            backend,
            index,
            result,
            ctrl_recv,
            remove_recv,
            insert_recv,
            head_hash: head.hash,
            head_height: head.height,
            pending: HashMap::new(),
            needs_scan: false,
            needs_rebuild: false,
            settles: vec![],
            last_prune: Instant::now(),
            running: true,
        }
    }

    /// Event loop. Control messages take priority over removals, removals over
    /// insertions, and all of them over scanning.
    pub(crate) fn run(mut self) {
        debug!("Mempool worker started at height {}", self.head_height);

        while self.running {
            self.drain();

            if !self.running {
                break;
            }

            self.prune_if_due();

            if self.needs_rebuild || self.needs_scan {
                self.scan();
                continue;
            }

            if !(self.ctrl_recv.is_empty()
                && self.remove_recv.is_empty()
                && self.insert_recv.is_empty())
            {
                continue;
            }

            for ack in self.settles.drain(..) {
                let _ = ack.send(());
            }

            let tick = self.tick().saturating_sub(self.last_prune.elapsed());
            let ctrl_recv = self.ctrl_recv.clone();
            let remove_recv = self.remove_recv.clone();
            let insert_recv = self.insert_recv.clone();

            select! {
                recv(ctrl_recv) -> msg => match msg {
                    Ok(ctrl) => self.handle_ctrl(ctrl),
                    Err(_) => self.running = false,
                },
                recv(remove_recv) -> msg => match msg {
                    Ok(hashes) => self.handle_remove(hashes),
                    Err(_) => self.running = false,
                },
                recv(insert_recv) -> msg => match msg {
                    Ok(batch) => self.handle_insert(batch),
                    Err(_) => self.running = false,
                },
                default(tick) => {},
            }
        }

        debug!("Mempool worker stopped");
    }

    fn drain(&mut self) {
        while self.running {
            match self.ctrl_recv.try_recv() {
                Ok(ctrl) => self.handle_ctrl(ctrl),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.running = false,
            }
        }

        while let Ok(hashes) = self.remove_recv.try_recv() {
            self.handle_remove(hashes);
        }

        while let Ok(batch) = self.insert_recv.try_recv() {
            self.handle_insert(batch);
        }
    }

    fn handle_ctrl(&mut self, ctrl: WorkerCtrl) {
        match ctrl {
            WorkerCtrl::NewHead { hash, height, ack } => {
                self.head_hash = hash;
                self.head_height = height;
                self.candidate = Candidate::new(self.backend.clone());
                self.needs_rebuild = false;
                self.needs_scan = !self.pending.is_empty();
                self.publish();
                let _ = ack.send(());
                debug!("Mempool reset to head {} at height {}", hash, height);
            }

            WorkerCtrl::Settle(ack) => self.settles.push(ack),

            WorkerCtrl::Shutdown => self.running = false,
        }
    }

    fn handle_insert(&mut self, batch: Vec<Arc<MempoolTx>>) {
        for tx in batch {
            // Removed before we got to it
            if !self.index.contains(&tx.hash) {
                continue;
            }

            self.pending.insert(tx.hash, tx);

            if !self.candidate.full {
                self.needs_scan = true;
            }
        }
    }

    fn handle_remove(&mut self, hashes: Vec<Hash256>) {
        for hash in hashes {
            if self.pending.remove(&hash).is_some() && self.candidate.included.contains(&hash) {
                self.needs_rebuild = true;
            }
        }
    }

    fn scan(&mut self) {
        let sorted: Vec<_> = self.pending.values().cloned().sorted_by(priority).collect();
        let height = self.head_height + 1;
        let max_block_size = self.config.max_block_size;
        let mut on_chain = HashSet::new();
        let mut fresh = Candidate::new(self.backend.clone());
        fresh.extend(&sorted, height, max_block_size, &mut on_chain);

        let keeps_published = fresh.included.is_superset(&self.candidate.included);
        let changed = if self.needs_rebuild || keeps_published {
            let changed = !fresh.same_txs(&self.candidate);
            self.candidate = fresh;
            changed
        } else {
            // Published transactions stay included for this head
            self.candidate
                .extend(&sorted, height, max_block_size, &mut on_chain)
        };

        self.needs_scan = false;
        self.needs_rebuild = false;

        for hash in &on_chain {
            self.pending.remove(hash);
            self.index.remove(hash);
        }

        if !on_chain.is_empty() {
            debug!("Evicted {} transactions found on chain", on_chain.len());
        }

        if changed {
            self.publish();
        }
    }

    fn prune_if_due(&mut self) {
        if self.last_prune.elapsed() < self.tick() {
            return;
        }

        self.last_prune = Instant::now();
        let now = Utc::now().timestamp();
        let expired: Vec<_> = self
            .pending
            .values()
            .filter(|tx| tx.is_expired(now, self.config.tx_ttl_secs))
            .map(|tx| tx.hash)
            .collect();

        if !expired.is_empty() {
            for hash in &expired {
                self.index.remove(hash);
            }

            debug!("Evicted {} expired transactions", expired.len());
            self.handle_remove(expired);
        }

        debug!(
            "Mempool has {} pending transactions, {} in candidate set ({} bytes)",
            self.pending.len(),
            self.candidate.txs.len(),
            self.candidate.total_size
        );
    }

    fn publish(&self) {
        self.result.store(Arc::new(MempoolResult {
            txs: self.candidate.txs.clone(),
            total_size_bytes: self.candidate.total_size,
            chain_hash: self.head_hash,
            chain_height: self.head_height,
        }));
    }

    fn tick(&self) -> Duration {
        Duration::from_secs(self.config.prune_interval_secs).max(MIN_TICK)
    }
}
