// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::forging::{Dispatcher, ForgingErr, ForgingSolution};
use crate::node::Mempool;
use crate::primitives::{Block, BlockHeader, Hash256, Signature, Transaction};
use crossbeam_channel::{select, Receiver, Sender};
use log::*;
use std::sync::Arc;

/// Provides the transactions of a forged block.
pub trait CandidateSource: Send + Sync {
    /// Transactions to include on top of `parent`. Empty if none were derived
    /// for it yet.
    fn candidate_txs(&self, parent: &Hash256) -> Vec<Transaction>;
}

impl CandidateSource for Mempool {
    fn candidate_txs(&self, parent: &Hash256) -> Vec<Transaction> {
        let (txs, matches) = self.candidate_block_body(parent);

        if !matches {
            debug!("No candidate set for {} yet, forging an empty block", parent);
        }

        txs.iter().map(|tx| tx.tx.clone()).collect()
    }
}

pub(crate) struct Coordinator {
    dispatcher: Arc<Dispatcher>,
    candidates: Arc<dyn CandidateSource>,
    block_send: Sender<Block>,
}

impl Coordinator {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        candidates: Arc<dyn CandidateSource>,
        block_send: Sender<Block>,
    ) -> Self {
        Self {
            dispatcher,
            candidates,
            block_send,
        }
    }

    pub(crate) fn run(&self, solutions: Receiver<ForgingSolution>, stop: Receiver<()>) {
        let mut running = true;

        while running {
            select! {
                recv(solutions) -> msg => match msg {
                    Ok(solution) => self.handle_solution(solution),
                    Err(_) => running = false,
                },
                recv(stop) -> _ => running = false,
            }
        }

        trace!("Forging coordinator stopped");
    }

    fn handle_solution(&self, solution: ForgingSolution) {
        if let Ok(Some(block)) = self.on_solution(solution) {
            if self.block_send.send(block).is_err() {
                warn!("Forged block has no receiver");
            }
        }
    }

    /// Accepts the first solution of the current generation and assembles its
    /// block. Stale solutions yield `Ok(None)`. On failure the round is
    /// reopened and the wallet is no longer used if its key is at fault.
    pub(crate) fn on_solution(
        &self,
        solution: ForgingSolution,
    ) -> Result<Option<Block>, ForgingErr> {
        {
            let mut round = self.dispatcher.round.lock();

            if round.generation != solution.work.generation || round.accepted {
                debug!(
                    "Discarding solution of generation {}, current is {}",
                    solution.work.generation, round.generation
                );
                return Ok(None);
            }

            round.accepted = true;
        }

        // Workers may already be on a newer generation by the time this lands
        self.dispatcher.pause(solution.work.generation);

        match self.assemble(&solution) {
            Ok(block) => Ok(Some(block)),
            Err(err) => {
                error!(
                    "Could not forge block at height {} with wallet {}: {:?}",
                    solution.work.height, solution.wallet.stake_address, err
                );

                self.dispatcher.round.lock().accepted = false;

                if matches!(err, ForgingErr::KeyMismatch | ForgingErr::SigningFailed) {
                    self.dispatcher
                        .wallets
                        .lock()
                        .disable(&solution.wallet.public_key);
                    self.dispatcher.distribute_wallets();
                }

                self.dispatcher.dispatch_current();
                Err(err)
            }
        }
    }

    #[tracing::instrument(skip_all, fields(height = solution.work.height))]
    fn assemble(&self, solution: &ForgingSolution) -> Result<Block, ForgingErr> {
        let wallet = &solution.wallet;
        let work = &solution.work;

        if wallet.key.public_key() != wallet.public_key {
            return Err(ForgingErr::KeyMismatch);
        }

        let txs = self.candidates.candidate_txs(&work.prev_hash);
        let mut header = BlockHeader {
            height: work.height,
            prev_hash: work.prev_hash,
            timestamp: solution.timestamp,
            forger: wallet.public_key,
            stake_address: wallet.stake_address,
            staking_amount: solution.staking_amount,
            target: work.target,
            merkle_root: Block::compute_merkle_root(&txs)?,
            signature: Signature::zero(),
        };

        header
            .sign(&wallet.key)
            .map_err(|_| ForgingErr::SigningFailed)?;

        info!(
            "Forged block at height {} with {} transactions",
            header.height,
            txs.len()
        );

        Ok(Block { header, txs })
    }
}
