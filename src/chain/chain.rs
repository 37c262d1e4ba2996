// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::{AccountLedger, ChainConfig, LedgerErr, StoreBackend};
use crate::consensus::{kernel_hash, meets_target, required_stake};
use crate::primitives::{
    Account, Address, Block, BlockHeader, BlockVerifyErr, Hash256, KernelTemplate,
};
use chrono::prelude::*;
use log::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub enum ChainErr {
    /// Block failed validation
    Block(BlockVerifyErr),

    /// Ledger error
    Ledger(LedgerErr),

    /// Rewinding past the oldest retained transition log
    ReorgTooDeep,

    /// Genesis state can only be seeded on an empty chain
    NotAtGenesis,
}

impl From<BlockVerifyErr> for ChainErr {
    fn from(other: BlockVerifyErr) -> Self {
        Self::Block(other)
    }
}

impl From<LedgerErr> for ChainErr {
    fn from(other: LedgerErr) -> Self {
        Self::Ledger(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u64,
    pub timestamp: i64,
}

impl ChainTip {
    fn from_header(header: &BlockHeader, hash: Hash256) -> Self {
        Self {
            hash,
            height: header.height,
            timestamp: header.timestamp,
        }
    }

    /// Template the next block's kernel is computed over.
    #[must_use]
    pub fn next_kernel_template(&self) -> KernelTemplate {
        KernelTemplate {
            height: self.height + 1,
            prev_hash: self.hash,
        }
    }
}

struct ChainState<B: StoreBackend> {
    ledger: AccountLedger<B>,

    /// Canonical tips, oldest first. Every entry but the first has a
    /// transition log stored under its hash.
    history: VecDeque<ChainTip>,

    /// Bodies of the blocks that can still be rewound.
    blocks: HashMap<Hash256, Block>,
}

/// Canonical chain over a single ledger. Blocks are applied one at a time and
/// flushed to the backend before the new tip becomes visible.
pub struct Chain<B: StoreBackend> {
    backend: B,
    config: ChainConfig,
    genesis: ChainTip,
    state: Mutex<ChainState<B>>,
}

impl<B: StoreBackend> ChainState<B> {
    fn tip(&self, genesis: &ChainTip) -> ChainTip {
        self.history.back().copied().unwrap_or(*genesis)
    }
}

impl<B: StoreBackend> Chain<B> {
    pub fn new(backend: B, config: ChainConfig) -> Self {
        let genesis = ChainTip {
            hash: config.genesis_hash(),
            height: 0,
            timestamp: config.genesis_timestamp,
        };
        let mut history = VecDeque::with_capacity(config.max_reorg_depth as usize + 1);
        history.push_back(genesis);

        Self {
            state: Mutex::new(ChainState {
                ledger: AccountLedger::new(backend.clone()),
                history,
                blocks: HashMap::new(),
            }),
            backend,
            config,
            genesis,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[must_use]
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    #[must_use]
    pub fn tip(&self) -> ChainTip {
        self.state.lock().tip(&self.genesis)
    }

    #[must_use]
    pub fn height(&self) -> u64 {
        self.tip().height
    }

    #[must_use]
    pub fn target(&self) -> Hash256 {
        self.config.target
    }

    /// Writes initial balances. Only possible before the first block.
    pub fn seed_genesis_accounts(&self, accounts: &[(Address, Account)]) -> Result<(), ChainErr> {
        let mut state = self.state.lock();

        if state.history.len() != 1 || state.history[0].height != 0 {
            return Err(ChainErr::NotAtGenesis);
        }

        for (address, account) in accounts {
            if let Err(err) = state.ledger.update_account(address, account) {
                state.ledger.rollback();
                return Err(err.into());
            }
        }

        state.ledger.commit_to_store()?;
        Ok(())
    }

    pub fn account(&self, address: &Address) -> Result<Option<Account>, ChainErr> {
        Ok(self.state.lock().ledger.get_account(address)?)
    }

    /// Validates and applies a block on top of the tip. On error the chain is
    /// left untouched.
    #[tracing::instrument(skip_all, fields(height = block.header.height))]
    pub fn append_block(&self, block: &Block) -> Result<ChainTip, ChainErr> {
        let mut state = self.state.lock();
        let tip = state.tip(&self.genesis);
        let header = &block.header;
        let hash = block.hash()?;

        self.validate_header(&tip, header)?;
        block.verify_merkle_root()?;
        Self::validate_stake(&mut state.ledger, header)?;

        for tx in &block.txs {
            if let Err(err) = tx.apply_to_ledger(header.height, &mut state.ledger) {
                debug!(
                    "Rejecting block {} at height {}: {:?}",
                    hash, header.height, err
                );
                state.ledger.rollback();
                return Err(BlockVerifyErr::Tx(err).into());
            }
        }

        let new_tip = ChainTip::from_header(header, hash);
        let mut history = state.history.clone();
        history.push_back(new_tip);
        let expired = self.prune_history(&mut history);
        let expired: Vec<&[u8]> = expired.iter().map(Hash256::as_bytes).collect();

        // Block effects, its transition log and the pruning of expired logs
        // land in one backend batch
        state
            .ledger
            .commit_to_store_with_transitions(hash.as_bytes(), &expired)?;
        state.ledger.clear_cache();
        state.history = history;
        state.blocks.insert(hash, block.clone());

        let ChainState {
            history, blocks, ..
        } = &mut *state;
        blocks.retain(|hash, _| history.iter().skip(1).any(|tip| &tip.hash == hash));

        info!(
            "Appended block {} at height {} with {} transactions",
            hash,
            header.height,
            block.txs.len()
        );

        Ok(new_tip)
    }

    /// Undoes the tip block through its transition log and returns the new tip.
    pub fn rewind(&self) -> Result<ChainTip, ChainErr> {
        self.rewind_block().map(|(tip, _)| tip)
    }

    /// Same as [`Self::rewind`], also handing back the undone block.
    pub fn rewind_block(&self) -> Result<(ChainTip, Block), ChainErr> {
        let mut state = self.state.lock();

        if state.history.len() < 2 {
            return Err(ChainErr::ReorgTooDeep);
        }

        let undone = state.tip(&self.genesis);
        let block = state
            .blocks
            .get(&undone.hash)
            .cloned()
            .ok_or(ChainErr::ReorgTooDeep)?;

        state.ledger.read_transitions(undone.hash.as_bytes())?;
        state.ledger.commit_undo_to_store(undone.hash.as_bytes())?;
        state.ledger.clear_cache();
        state.history.pop_back();
        state.blocks.remove(&undone.hash);

        let tip = state.tip(&self.genesis);
        info!(
            "Rewound block {} at height {}, new tip is {}",
            undone.hash, undone.height, tip.hash
        );

        Ok((tip, block))
    }

    fn validate_header(&self, tip: &ChainTip, header: &BlockHeader) -> Result<(), BlockVerifyErr> {
        if header.prev_hash != tip.hash {
            return Err(BlockVerifyErr::InvalidParent);
        }

        if header.height != tip.height + 1 {
            return Err(BlockVerifyErr::InvalidHeight);
        }

        let max_timestamp = Utc::now().timestamp() + self.config.max_clock_drift_secs as i64;

        if header.timestamp <= tip.timestamp || header.timestamp > max_timestamp {
            return Err(BlockVerifyErr::InvalidTimestamp);
        }

        if header.target != self.config.target {
            return Err(BlockVerifyErr::InvalidTarget);
        }

        header.verify_signature()
    }

    fn validate_stake(ledger: &mut AccountLedger<B>, header: &BlockHeader) -> Result<(), ChainErr> {
        let account = ledger
            .get_account(&header.stake_address)?
            .ok_or(BlockVerifyErr::StakeAccountNotFound)?;

        if account.delegated_public_key != Some(header.forger) {
            return Err(BlockVerifyErr::DelegatedKeyMismatch.into());
        }

        if header.staking_amount < required_stake(header.height)
            || header.staking_amount > account.stake_available(header.height)
        {
            return Err(BlockVerifyErr::InsufficientStake.into());
        }

        let template = header.kernel_template().to_bytes()?;
        let kernel = kernel_hash(&template, header.timestamp, &header.forger);

        if !meets_target(&kernel, header.staking_amount, &header.target) {
            return Err(BlockVerifyErr::InvalidKernel.into());
        }

        Ok(())
    }

    /// Trims `history` to the reorg window, returning the blocks whose
    /// transition logs are no longer needed.
    fn prune_history(&self, history: &mut VecDeque<ChainTip>) -> Vec<Hash256> {
        let mut expired = vec![];

        while history.len() as u64 > self.config.max_reorg_depth + 1 {
            history.pop_front();

            // The new oldest entry can no longer be rewound
            if let Some(floor) = history.front() {
                trace!("Pruning transitions of block {}", floor.hash);
                expired.push(floor.hash);
            }
        }

        expired
    }
}
