// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

pub mod mempool;

pub use mempool::*;

use crate::chain::{Chain, ChainConfig, ChainErr, ChainTip, StoreBackend};
#[cfg(feature = "forging")]
use crate::forging::{CandidateSource, Forging, ForgingConfig, ForgingErr};
#[cfg(feature = "forging")]
use crate::primitives::PrivateKey;
use crate::primitives::{Account, Address, Block, Hash256, Transaction};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long the node loop waits for a forged block before checking the exit flag.
const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq)]
pub enum NodeErr {
    Chain(ChainErr),
    Mempool(MempoolErr),
    #[cfg(feature = "forging")]
    Forging(ForgingErr),
}

impl From<ChainErr> for NodeErr {
    fn from(other: ChainErr) -> Self {
        Self::Chain(other)
    }
}

impl From<MempoolErr> for NodeErr {
    fn from(other: MempoolErr) -> Self {
        Self::Mempool(other)
    }
}

#[cfg(feature = "forging")]
impl From<ForgingErr> for NodeErr {
    fn from(other: ForgingErr) -> Self {
        Self::Forging(other)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub chain: ChainConfig,
    pub mempool: MempoolConfig,

    /// Forging is disabled when `None`.
    #[cfg(feature = "forging")]
    pub forging: Option<ForgingConfig>,
}

/// Owns the chain and both engines, and keeps them on the same head.
pub struct Node<B: StoreBackend> {
    chain: Arc<Chain<B>>,
    mempool: Arc<Mempool>,
    #[cfg(feature = "forging")]
    forging: Option<Forging>,
    block_send: Sender<Block>,
    block_recv: Receiver<Block>,
}

impl<B: StoreBackend> Node<B> {
    pub fn new(backend: B, config: NodeConfig) -> Self {
        let chain = Arc::new(Chain::new(backend.clone(), config.chain));
        let mempool = Arc::new(Mempool::new(config.mempool, backend, chain.tip()));
        let (block_send, block_recv) = unbounded();

        #[cfg(feature = "forging")]
        let forging = config.forging.map(|forging_config| {
            let candidates: Arc<dyn CandidateSource> = mempool.clone();
            Forging::new(forging_config, candidates, block_send.clone())
        });

        Self {
            chain,
            mempool,
            #[cfg(feature = "forging")]
            forging,
            block_send,
            block_recv,
        }
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<Chain<B>> {
        &self.chain
    }

    #[must_use]
    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    #[cfg(feature = "forging")]
    #[must_use]
    pub fn forging(&self) -> Option<&Forging> {
        self.forging.as_ref()
    }

    /// Sender for blocks to be appended by [`Node::run`].
    #[must_use]
    pub fn block_sender(&self) -> Sender<Block> {
        self.block_send.clone()
    }

    /// Writes initial balances. Only possible before the first block.
    pub fn seed_genesis_accounts(&self, accounts: &[(Address, Account)]) -> Result<(), NodeErr> {
        Ok(self.chain.seed_genesis_accounts(accounts)?)
    }

    /// Registers a delegated key to forge for `stake_address`. Returns false
    /// if forging is disabled or the pair is already registered.
    #[cfg(feature = "forging")]
    pub fn register_wallet(&self, key: PrivateKey, stake_address: Address) -> bool {
        match &self.forging {
            Some(forging) => forging.register_wallet(key, stake_address),
            None => false,
        }
    }

    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, NodeErr> {
        Ok(self.mempool.insert(tx)?.hash)
    }

    /// Submits a transaction created by this node's own wallet.
    pub fn submit_local_transaction(&self, tx: Transaction) -> Result<Hash256, NodeErr> {
        Ok(self.mempool.insert_local(tx)?.hash)
    }

    /// Points both engines at the current chain tip. The mempool derives its
    /// candidate set before forging starts, so forged blocks carry it.
    pub fn on_new_chain_head(&self) -> Result<ChainTip, NodeErr> {
        let tip = self.chain.tip();
        self.mempool.update_work(tip.hash, tip.height)?;
        self.mempool.settle()?;

        #[cfg(feature = "forging")]
        if let Some(forging) = &self.forging {
            let chain = &self.chain;
            forging.refresh_stakes(tip.height + 1, |address| match chain.account(address) {
                Ok(account) => account,
                Err(err) => {
                    warn!("Could not read stake account {}: {:?}", address, err);
                    None
                }
            });
            forging.update_work(&tip, chain.target())?;
        }

        debug!("New chain head {} at height {}", tip.hash, tip.height);
        Ok(tip)
    }

    /// Appends a block, drops its transactions from the mempool and moves
    /// both engines to the new tip.
    pub fn process_block(&self, block: &Block) -> Result<ChainTip, NodeErr> {
        self.chain.append_block(block)?;

        let included: Vec<_> = block
            .txs
            .iter()
            .filter_map(|tx| tx.content_hash().ok())
            .collect();
        let removed = self.mempool.remove_batch(&included);
        trace!("Removed {} included transactions from the mempool", removed);

        self.on_new_chain_head()
    }

    /// Undoes the tip block, returns its transactions to the mempool and
    /// moves both engines to the new tip.
    pub fn rewind(&self) -> Result<ChainTip, NodeErr> {
        let (_, block) = self.chain.rewind_block()?;
        let total = block.txs.len();
        let restored = self
            .mempool
            .insert_batch(block.txs)
            .iter()
            .filter(|result| result.is_ok())
            .count();
        debug!(
            "Returned {} of {} transactions of block {} to the mempool",
            restored,
            total,
            block.header.height
        );

        self.on_new_chain_head()
    }

    /// Appends blocks sent on [`Node::block_sender`] or forged locally until
    /// `exit` is set.
    pub fn run(&self, exit: &AtomicBool) -> Result<(), NodeErr> {
        self.on_new_chain_head()?;

        while !exit.load(Ordering::Relaxed) {
            match self.block_recv.recv_timeout(BLOCK_POLL_INTERVAL) {
                Ok(block) => {
                    if let Err(err) = self.process_block(&block) {
                        warn!(
                            "Rejected block at height {}: {:?}",
                            block.header.height, err
                        );

                        // Forging paused after its solution, resume on the same tip
                        self.on_new_chain_head()?;
                    }
                }

                Err(RecvTimeoutError::Timeout) => {}

                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("Node stopped at height {}", self.chain.height());
        Ok(())
    }

    /// Stops the engine threads.
    pub fn shutdown(&self) {
        #[cfg(feature = "forging")]
        if let Some(forging) = &self.forging {
            forging.shutdown();
        }

        self.mempool.shutdown();
    }
}
