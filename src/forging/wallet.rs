// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::{required_stake, Money};
use crate::primitives::{Account, Address, PrivateKey, PublicKey};
use log::*;
use std::fmt;
use std::sync::Arc;

/// Snapshot of a stakable identity handed to a forging worker.
#[derive(Clone)]
pub struct WalletIdentity {
    pub(crate) key: PrivateKey,
    pub public_key: PublicKey,
    pub stake_address: Address,
    pub stake: Money,
    pub assigned_worker: usize,
}

impl fmt::Debug for WalletIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletIdentity")
            .field("public_key", &self.public_key)
            .field("stake_address", &self.stake_address)
            .field("stake", &self.stake)
            .field("assigned_worker", &self.assigned_worker)
            .finish()
    }
}

struct RegisteredWallet {
    key: PrivateKey,
    public_key: PublicKey,
    stake_address: Address,

    /// Stake available at the last refresh, if enough to forge.
    stake: Option<Money>,

    /// Set after the key failed to sign.
    disabled: bool,
}

/// Delegated keys this node forges with.
pub struct WalletRegistry {
    wallets: Vec<RegisteredWallet>,
    workers: usize,
}

impl WalletRegistry {
    pub fn new(workers: usize) -> Self {
        Self {
            wallets: vec![],
            workers: workers.max(1),
        }
    }

    /// Registers `key` as delegated forger of `stake_address`. Returns false if
    /// the pair is already registered.
    pub fn register(&mut self, key: PrivateKey, stake_address: Address) -> bool {
        let public_key = key.public_key();

        if self
            .wallets
            .iter()
            .any(|w| w.public_key == public_key && w.stake_address == stake_address)
        {
            return false;
        }

        self.wallets.push(RegisteredWallet {
            key,
            public_key,
            stake_address,
            stake: None,
            disabled: false,
        });
        true
    }

    /// Recomputes every wallet's stake for a block at `height`. A wallet is
    /// stakable only if its stake account delegates to its key and has at
    /// least the required stake available.
    pub fn refresh_stakes<F>(&mut self, height: u64, mut lookup: F)
    where
        F: FnMut(&Address) -> Option<Account>,
    {
        let min_stake = required_stake(height);

        for wallet in &mut self.wallets {
            wallet.stake = lookup(&wallet.stake_address)
                .filter(|account| account.delegated_public_key == Some(wallet.public_key))
                .map(|account| account.stake_available(height))
                .filter(|stake| *stake >= min_stake);

            if wallet.stake.is_none() {
                debug!(
                    "Wallet {} cannot forge at height {}",
                    wallet.stake_address, height
                );
            }
        }
    }

    /// Stops forging with the wallet using `public_key`.
    pub fn disable(&mut self, public_key: &PublicKey) {
        for wallet in &mut self.wallets {
            if &wallet.public_key == public_key {
                wallet.disabled = true;
            }
        }
    }

    #[must_use]
    pub fn stakable_count(&self) -> usize {
        self.stakable().count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    /// Splits stakable wallets across workers, largest stake first, each going
    /// to the worker with the fewest wallets so far.
    #[must_use]
    pub fn assignments(&self) -> Vec<Vec<Arc<WalletIdentity>>> {
        let mut stakable: Vec<_> = self.stakable().collect();
        stakable.sort_by(|a, b| b.1.cmp(&a.1));

        let mut assignments: Vec<Vec<Arc<WalletIdentity>>> = vec![vec![]; self.workers];

        for (wallet, stake) in stakable {
            let worker = assignments
                .iter()
                .enumerate()
                .min_by_key(|(_, assigned)| assigned.len())
                .map_or(0, |(i, _)| i);

            assignments[worker].push(Arc::new(WalletIdentity {
                key: wallet.key.clone(),
                public_key: wallet.public_key,
                stake_address: wallet.stake_address,
                stake,
                assigned_worker: worker,
            }));
        }

        assignments
    }

    fn stakable(&self) -> impl Iterator<Item = (&RegisteredWallet, Money)> {
        self.wallets
            .iter()
            .filter(|w| !w.disabled)
            .filter_map(|w| w.stake.map(|stake| (w, stake)))
    }
}
