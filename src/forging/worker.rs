// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::{kernel_hash, meets_target, required_stake, staking_amount_used};
use crate::forging::{ForgingSolution, ForgingWork, WalletIdentity};
use chrono::prelude::*;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Interval between hash rate reports.
const HASH_RATE_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) enum WorkerCtrl {
    /// Scan this work, superseding any scan in progress.
    Work(Arc<ForgingWork>),

    /// Replace the wallets this worker scans with.
    Wallets(Vec<Arc<WalletIdentity>>),

    /// Drop the current work unless it is newer than the given generation.
    Pause(u64),

    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Scanning,
    SolutionFound,
    Superseded,
}

struct Worker {
    index: usize,
    max_clock_drift_secs: u64,
    ctrl_recv: Receiver<WorkerCtrl>,
    solution_send: Sender<ForgingSolution>,
    status: Arc<Mutex<WorkerStatus>>,
    work: Option<Arc<ForgingWork>>,
    wallets: Vec<Arc<WalletIdentity>>,
    next_timestamp: i64,
    kernels: u64,
    last_report: Instant,
    running: bool,
}

pub(crate) fn spawn_worker(
    index: usize,
    max_clock_drift_secs: u64,
    ctrl_recv: Receiver<WorkerCtrl>,
    solution_send: Sender<ForgingSolution>,
    status: Arc<Mutex<WorkerStatus>>,
) -> JoinHandle<()> {
    let worker = Worker {
        index,
        max_clock_drift_secs,
        ctrl_recv,
        solution_send,
        status,
        work: None,
        wallets: vec![],
        next_timestamp: 0,
        kernels: 0,
        last_report: Instant::now(),
        running: true,
    };

    thread::spawn(move || worker.run())
}

impl Worker {
    fn run(mut self) {
        while self.running {
            if self.is_scanning() {
                match self.ctrl_recv.try_recv() {
                    Ok(ctrl) => self.handle(ctrl),
                    Err(TryRecvError::Empty) => self.scan_next(),
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match self.ctrl_recv.recv() {
                    Ok(ctrl) => self.handle(ctrl),
                    Err(_) => break,
                }
            }
        }

        self.set_status(WorkerStatus::Idle);
        trace!("Forging worker {} stopped", self.index);
    }

    fn handle(&mut self, ctrl: WorkerCtrl) {
        match ctrl {
            WorkerCtrl::Work(work) => {
                if self.is_scanning() {
                    self.set_status(WorkerStatus::Superseded);
                    trace!("Worker {} superseded at height {}", self.index, work.height);
                }

                self.next_timestamp = work.timestamp_seed + 1;
                self.work = Some(work);
            }

            WorkerCtrl::Wallets(wallets) => self.wallets = wallets,

            WorkerCtrl::Pause(generation) => {
                if self.work.as_ref().map_or(false, |w| w.generation <= generation) {
                    self.work = None;
                }
            }

            WorkerCtrl::Shutdown => self.running = false,
        }

        self.refresh_status();
    }

    fn is_scanning(&self) -> bool {
        self.work.is_some() && !self.wallets.is_empty()
    }

    fn refresh_status(&self) {
        if self.is_scanning() {
            self.set_status(WorkerStatus::Scanning);
        } else {
            self.set_status(WorkerStatus::Idle);
        }
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status;
    }

    /// Tries every assigned wallet at the next timestamp.
    fn scan_next(&mut self) {
        let Some(work) = self.work.clone() else {
            return;
        };

        let max_timestamp = Utc::now().timestamp() + self.max_clock_drift_secs as i64;

        if self.next_timestamp > max_timestamp {
            // Caught up with the clock, wait for it while staying responsive
            match self.ctrl_recv.recv_timeout(Duration::from_millis(200)) {
                Ok(ctrl) => self.handle(ctrl),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.running = false,
            }
            return;
        }

        let timestamp = self.next_timestamp;

        for wallet in &self.wallets {
            let kernel = kernel_hash(&work.template, timestamp, &wallet.public_key);
            self.kernels += 1;

            if meets_target(&kernel, wallet.stake, &work.target) {
                let staking_amount = staking_amount_used(
                    &kernel,
                    &work.target,
                    wallet.stake,
                    required_stake(work.height),
                );

                debug!(
                    "Worker {} found kernel for height {} at timestamp {}",
                    self.index, work.height, timestamp
                );

                let solution = ForgingSolution {
                    timestamp,
                    wallet: wallet.clone(),
                    staking_amount,
                    work: work.clone(),
                };

                self.set_status(WorkerStatus::SolutionFound);
                self.work = None;

                if self.solution_send.send(solution).is_err() {
                    warn!("Forging coordinator is not running");
                }

                self.refresh_status();
                return;
            }
        }

        self.next_timestamp += 1;
        self.report_hash_rate();
    }

    fn report_hash_rate(&mut self) {
        let elapsed = self.last_report.elapsed();

        if elapsed < HASH_RATE_INTERVAL {
            return;
        }

        info!(
            "Forging worker {} hashed {:.2} kernels/s",
            self.index,
            self.kernels as f64 / elapsed.as_secs_f64()
        );
        self.kernels = 0;
        self.last_report = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{Address, Hash256, PrivateKey};
    use crossbeam_channel::unbounded;

    fn wallet(stake: u64) -> Arc<WalletIdentity> {
        let key = PrivateKey::random();
        Arc::new(WalletIdentity {
            public_key: key.public_key(),
            key,
            stake_address: Address::zero(),
            stake,
            assigned_worker: 0,
        })
    }

    fn work(seed: i64, target: Hash256, generation: u64) -> Arc<ForgingWork> {
        Arc::new(ForgingWork {
            template: b"template".to_vec(),
            height: 1,
            prev_hash: Hash256::zero(),
            timestamp_seed: seed,
            target,
            generation,
        })
    }

    fn start() -> (
        Sender<WorkerCtrl>,
        Receiver<ForgingSolution>,
        Arc<Mutex<WorkerStatus>>,
        JoinHandle<()>,
    ) {
        let (ctrl_send, ctrl_recv) = unbounded();
        let (solution_send, solution_recv) = unbounded();
        let status = Arc::new(Mutex::new(WorkerStatus::Idle));
        let handle = spawn_worker(0, 10, ctrl_recv, solution_send, status.clone());
        (ctrl_send, solution_recv, status, handle)
    }

    #[test]
    fn unit_stake_and_max_target_solve_first_timestamp() {
        let (ctrl, solutions, _, handle) = start();
        ctrl.send(WorkerCtrl::Wallets(vec![wallet(1)])).unwrap();
        ctrl.send(WorkerCtrl::Work(work(1_000, Hash256::max_value(), 1)))
            .unwrap();

        let solution = solutions.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(solution.timestamp, 1_001);
        assert_eq!(solution.work.generation, 1);

        ctrl.send(WorkerCtrl::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn solution_iff_kernel_meets_target() {
        let (ctrl, solutions, _, handle) = start();
        let wallet = wallet(3);
        let target = Hash256::from_hex(
            "1fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .unwrap();
        let work = work(1_000, target, 1);

        ctrl.send(WorkerCtrl::Wallets(vec![wallet.clone()])).unwrap();
        ctrl.send(WorkerCtrl::Work(work.clone())).unwrap();
        let solution = solutions.recv_timeout(Duration::from_secs(5)).unwrap();

        for timestamp in 1_001..solution.timestamp {
            let kernel = kernel_hash(&work.template, timestamp, &wallet.public_key);
            assert!(!meets_target(&kernel, 3, &target));
        }

        let kernel = kernel_hash(&work.template, solution.timestamp, &wallet.public_key);
        assert!(meets_target(&kernel, 3, &target));

        ctrl.send(WorkerCtrl::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn new_work_supersedes_scan() {
        let (ctrl, solutions, status, handle) = start();
        let now = Utc::now().timestamp();
        ctrl.send(WorkerCtrl::Wallets(vec![wallet(1)])).unwrap();
        ctrl.send(WorkerCtrl::Work(work(now, Hash256::zero(), 1)))
            .unwrap();

        assert!(solutions.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(*status.lock(), WorkerStatus::Scanning);

        ctrl.send(WorkerCtrl::Work(work(now, Hash256::max_value(), 2)))
            .unwrap();
        let solution = solutions.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(solution.work.generation, 2);
        assert_eq!(solution.timestamp, now + 1);

        ctrl.send(WorkerCtrl::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn pause_only_drops_older_work() {
        let (ctrl, solutions, status, handle) = start();
        let now = Utc::now().timestamp();
        ctrl.send(WorkerCtrl::Wallets(vec![wallet(1)])).unwrap();
        ctrl.send(WorkerCtrl::Work(work(now, Hash256::zero(), 6)))
            .unwrap();

        // A pause for the previous generation arriving late
        ctrl.send(WorkerCtrl::Pause(5)).unwrap();
        assert!(solutions.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(*status.lock(), WorkerStatus::Scanning);

        ctrl.send(WorkerCtrl::Pause(6)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while *status.lock() != WorkerStatus::Idle && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*status.lock(), WorkerStatus::Idle);

        ctrl.send(WorkerCtrl::Shutdown).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn idle_without_wallets() {
        let (ctrl, solutions, status, handle) = start();
        ctrl.send(WorkerCtrl::Work(work(1_000, Hash256::max_value(), 1)))
            .unwrap();

        assert!(solutions.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(*status.lock(), WorkerStatus::Idle);

        drop(ctrl);
        handle.join().unwrap();
    }
}
