// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

mod assembler;
mod wallet;
mod worker;

pub use assembler::*;
pub use wallet::*;
pub use worker::WorkerStatus;

use crate::chain::ChainTip;
use crate::consensus::{Money, BLOCK_TIMESTAMP_MAX};
use crate::primitives::{Account, Address, Block, BlockVerifyErr, Hash256, PrivateKey};
use crossbeam_channel::{bounded, unbounded, Sender};
use log::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use worker::{spawn_worker, WorkerCtrl};

#[derive(Debug, Clone, PartialEq)]
pub enum ForgingErr {
    /// The wallet's private key doesn't match its public key
    KeyMismatch,

    /// Header signing failed
    SigningFailed,

    /// Block could not be assembled
    Block(BlockVerifyErr),
}

impl From<BlockVerifyErr> for ForgingErr {
    fn from(other: BlockVerifyErr) -> Self {
        Self::Block(other)
    }
}

#[derive(Debug, Clone)]
pub struct ForgingConfig {
    /// Number of worker threads. 0 means one per CPU.
    pub threads: usize,

    pub max_clock_drift_secs: u64,
}

impl Default for ForgingConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_clock_drift_secs: BLOCK_TIMESTAMP_MAX,
        }
    }
}

impl ForgingConfig {
    fn worker_count(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }
}

/// One round of kernel scanning on top of a chain tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgingWork {
    /// Encoded kernel template of the next block.
    pub template: Vec<u8>,
    pub height: u64,
    pub prev_hash: Hash256,

    /// Timestamp of the tip. Scanning starts right after it.
    pub timestamp_seed: i64,

    pub target: Hash256,
    pub generation: u64,
}

impl ForgingWork {
    pub fn new(tip: &ChainTip, target: Hash256, generation: u64) -> Result<Self, ForgingErr> {
        let template = tip.next_kernel_template();

        Ok(Self {
            template: template.to_bytes()?,
            height: template.height,
            prev_hash: template.prev_hash,
            timestamp_seed: tip.timestamp,
            target,
            generation,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ForgingSolution {
    pub timestamp: i64,
    pub wallet: Arc<WalletIdentity>,
    pub staking_amount: Money,
    pub work: Arc<ForgingWork>,
}

#[derive(Default)]
struct Round {
    generation: u64,

    /// A solution was taken for this generation.
    accepted: bool,

    work: Option<Arc<ForgingWork>>,
}

/// State shared by the handle and the coordinator thread.
pub(crate) struct Dispatcher {
    ctrl_sends: Vec<Sender<WorkerCtrl>>,
    wallets: Mutex<WalletRegistry>,
    round: Mutex<Round>,
}

impl Dispatcher {
    fn broadcast<F>(&self, mut ctrl: F)
    where
        F: FnMut(usize) -> WorkerCtrl,
    {
        for (i, send) in self.ctrl_sends.iter().enumerate() {
            if send.send(ctrl(i)).is_err() {
                warn!("Forging worker {} is not running", i);
            }
        }
    }

    fn distribute_wallets(&self) {
        let mut assignments = self.wallets.lock().assignments();
        self.broadcast(|i| WorkerCtrl::Wallets(std::mem::take(&mut assignments[i])));
    }

    fn dispatch_current(&self) {
        let work = self.round.lock().work.clone();

        if let Some(work) = work {
            self.broadcast(|_| WorkerCtrl::Work(work.clone()));
        }
    }

    /// Stops scans of `generation` and older ones.
    fn pause(&self, generation: u64) {
        self.broadcast(|_| WorkerCtrl::Pause(generation));
    }
}

/// Forging engine: a pool of kernel scanning workers plus a coordinator
/// thread that turns the first valid solution of each generation into a
/// signed block.
pub struct Forging {
    config: ForgingConfig,
    dispatcher: Arc<Dispatcher>,
    coordinator: Arc<Coordinator>,
    statuses: Vec<Arc<Mutex<WorkerStatus>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop_send: Sender<()>,
}

impl Forging {
    /// Spawns the workers and the coordinator. Forged blocks are sent on `block_send`.
    pub fn new(
        config: ForgingConfig,
        candidates: Arc<dyn CandidateSource>,
        block_send: Sender<Block>,
    ) -> Self {
        let workers = config.worker_count();
        let (solution_send, solution_recv) = unbounded();
        let (stop_send, stop_recv) = bounded(1);
        let mut threads = Vec::with_capacity(workers + 1);
        let mut ctrl_sends = Vec::with_capacity(workers);
        let mut statuses = Vec::with_capacity(workers);

        for i in 0..workers {
            let (ctrl_send, ctrl_recv) = unbounded();
            let status = Arc::new(Mutex::new(WorkerStatus::Idle));
            threads.push(spawn_worker(
                i,
                config.max_clock_drift_secs,
                ctrl_recv,
                solution_send.clone(),
                status.clone(),
            ));
            ctrl_sends.push(ctrl_send);
            statuses.push(status);
        }

        let dispatcher = Arc::new(Dispatcher {
            ctrl_sends,
            wallets: Mutex::new(WalletRegistry::new(workers)),
            round: Mutex::new(Round::default()),
        });

        let coordinator = Arc::new(Coordinator::new(dispatcher.clone(), candidates, block_send));
        let coordinator_clone = coordinator.clone();
        threads.push(thread::spawn(move || {
            coordinator_clone.run(solution_recv, stop_recv);
        }));

        info!("Started forging with {} workers", workers);

        Self {
            config,
            dispatcher,
            coordinator,
            statuses,
            threads: Mutex::new(threads),
            stop_send,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ForgingConfig {
        &self.config
    }

    /// Adds a delegated key forging for `stake_address`. It starts scanning
    /// after the next stake refresh.
    pub fn register_wallet(&self, key: PrivateKey, stake_address: Address) -> bool {
        self.dispatcher.wallets.lock().register(key, stake_address)
    }

    /// Recomputes wallet stakes for a block at `height` and hands the
    /// stakable ones to the workers.
    pub fn refresh_stakes<F>(&self, height: u64, lookup: F)
    where
        F: FnMut(&Address) -> Option<Account>,
    {
        {
            let mut wallets = self.dispatcher.wallets.lock();
            wallets.refresh_stakes(height, lookup);
            debug!(
                "{} of {} wallets can forge at height {}",
                wallets.stakable_count(),
                wallets.len(),
                height
            );
        }

        self.dispatcher.distribute_wallets();
    }

    /// Starts a new generation on top of `tip`, superseding any scan in
    /// progress. Returns the new generation.
    pub fn update_work(&self, tip: &ChainTip, target: Hash256) -> Result<u64, ForgingErr> {
        let work = {
            let mut round = self.dispatcher.round.lock();
            let work = Arc::new(ForgingWork::new(tip, target, round.generation + 1)?);
            round.generation = work.generation;
            round.accepted = false;
            round.work = Some(work.clone());
            work
        };

        trace!(
            "Forging generation {} at height {}",
            work.generation,
            work.height
        );
        self.dispatcher
            .broadcast(|_| WorkerCtrl::Work(work.clone()));
        Ok(work.generation)
    }

    pub fn pause(&self) {
        let generation = {
            let mut round = self.dispatcher.round.lock();
            round.work = None;
            round.generation
        };

        self.dispatcher.pause(generation);
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.dispatcher.round.lock().generation
    }

    #[must_use]
    pub fn stakable_wallets(&self) -> usize {
        self.dispatcher.wallets.lock().stakable_count()
    }

    #[must_use]
    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.statuses.iter().map(|s| *s.lock()).collect()
    }

    /// Stops every thread and waits for them to exit.
    pub fn shutdown(&self) {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();

        if threads.is_empty() {
            return;
        }

        let _ = self.stop_send.try_send(());
        self.dispatcher.broadcast(|_| WorkerCtrl::Shutdown);

        for handle in threads {
            if handle.join().is_err() {
                error!("Forging thread panicked");
            }
        }
    }
}

impl Drop for Forging {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::COIN;
    use crate::primitives::{Asset, Transaction};
    use chrono::prelude::*;
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    struct FixedCandidates(Vec<Transaction>);

    impl CandidateSource for FixedCandidates {
        fn candidate_txs(&self, _parent: &Hash256) -> Vec<Transaction> {
            self.0.clone()
        }
    }

    fn staking_account(key: &PrivateKey) -> Account {
        Account {
            stake: 10 * COIN,
            delegated_public_key: Some(key.public_key()),
            ..Default::default()
        }
    }

    fn tip(age_secs: i64) -> ChainTip {
        ChainTip {
            hash: Hash256::hash_from_slice("tip", "test"),
            height: 0,
            timestamp: Utc::now().timestamp() - age_secs,
        }
    }

    fn setup(txs: Vec<Transaction>) -> (Forging, Receiver<Block>, PrivateKey, Address) {
        let (block_send, block_recv) = unbounded();
        let config = ForgingConfig {
            threads: 2,
            max_clock_drift_secs: 10,
        };
        let forging = Forging::new(config, Arc::new(FixedCandidates(txs)), block_send);
        let key = PrivateKey::random();
        let stake_address = Address::random();
        assert!(forging.register_wallet(key.clone(), stake_address));
        let account = staking_account(&key);
        forging.refresh_stakes(1, |_| Some(account.clone()));
        (forging, block_recv, key, stake_address)
    }

    fn solution_for(forging: &Forging, generation: u64) -> ForgingSolution {
        let wallet = forging
            .dispatcher
            .wallets
            .lock()
            .assignments()
            .into_iter()
            .flatten()
            .next()
            .unwrap();
        let work = forging.dispatcher.round.lock().work.clone().unwrap();
        let work = Arc::new(ForgingWork {
            generation,
            ..(*work).clone()
        });

        ForgingSolution {
            timestamp: work.timestamp_seed + 1,
            wallet,
            staking_amount: COIN,
            work,
        }
    }

    #[test]
    fn forges_signed_block() {
        let sender = PrivateKey::random();
        let txs = vec![
            Transaction::transfer(&sender, 0, 1_000, Address::zero(), Asset::NATIVE, 1).unwrap(),
        ];
        let (forging, blocks, key, stake_address) = setup(txs.clone());
        let tip = tip(100);
        forging.update_work(&tip, Hash256::max_value()).unwrap();

        let block = blocks.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(block.header.prev_hash, tip.hash);
        assert_eq!(block.header.height, 1);
        assert_eq!(block.header.timestamp, tip.timestamp + 1);
        assert_eq!(block.header.forger, key.public_key());
        assert_eq!(block.header.stake_address, stake_address);
        assert_eq!(block.header.staking_amount, COIN);
        assert_eq!(block.txs, txs);
        assert!(block.header.verify_signature().is_ok());
        assert!(block.verify_merkle_root().is_ok());

        // Only one block per generation
        assert!(blocks.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn only_first_current_solution_is_accepted() {
        let (forging, _blocks, _, _) = setup(vec![]);
        let tip = tip(0);
        let first = forging.update_work(&tip, Hash256::zero()).unwrap();
        let second = forging.update_work(&tip, Hash256::zero()).unwrap();
        assert_eq!(second, first + 1);

        let coordinator = &forging.coordinator;
        assert_eq!(coordinator.on_solution(solution_for(&forging, first)), Ok(None));

        let block = coordinator
            .on_solution(solution_for(&forging, second))
            .unwrap()
            .unwrap();
        assert!(block.txs.is_empty());
        assert_eq!(block.header.merkle_root, Hash256::zero());

        assert_eq!(coordinator.on_solution(solution_for(&forging, second)), Ok(None));
    }

    #[test]
    fn key_mismatch_disables_wallet() {
        let (forging, _blocks, key, stake_address) = setup(vec![]);
        let generation = forging.update_work(&tip(0), Hash256::zero()).unwrap();
        let mut solution = solution_for(&forging, generation);
        solution.wallet = Arc::new(WalletIdentity {
            key: PrivateKey::random(),
            public_key: key.public_key(),
            stake_address,
            stake: 10 * COIN,
            assigned_worker: 0,
        });

        assert_eq!(
            forging.coordinator.on_solution(solution.clone()),
            Err(ForgingErr::KeyMismatch)
        );
        assert_eq!(forging.stakable_wallets(), 0);

        // The round is still open for other wallets
        solution.wallet = Arc::new(WalletIdentity {
            key: key.clone(),
            ..(*solution.wallet).clone()
        });
        assert!(forging.coordinator.on_solution(solution).unwrap().is_some());
    }

    #[test]
    fn stake_refresh_excludes_undelegated_wallets() {
        let (forging, blocks, _, _) = setup(vec![]);
        forging.refresh_stakes(1, |_| Some(Account::with_balance(Asset::NATIVE, COIN)));
        assert_eq!(forging.stakable_wallets(), 0);

        forging
            .update_work(&tip(100), Hash256::max_value())
            .unwrap();
        assert!(blocks.recv_timeout(Duration::from_millis(500)).is_err());
        assert!(forging
            .worker_statuses()
            .iter()
            .all(|s| *s == WorkerStatus::Idle));
    }
}
