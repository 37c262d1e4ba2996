// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::Money;
use crate::primitives::{Asset, PublicKey, TxVerifyErr};
use bincode::{Decode, Encode};
use std::collections::BTreeMap;

/// Delegated stake that becomes usable at `activation_height`.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PendingStake {
    pub activation_height: u64,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct Account {
    /// Number of transactions applied on behalf of this account.
    pub nonce: u64,

    pub balances: BTreeMap<Asset, Money>,

    /// Mature stake.
    pub stake: Money,

    pub pending_stake: Vec<PendingStake>,

    /// Key allowed to forge with this account's stake.
    pub delegated_public_key: Option<PublicKey>,
}

impl Account {
    #[must_use]
    pub fn with_balance(asset: Asset, amount: Money) -> Self {
        let mut account = Self::default();
        if amount > 0 {
            account.balances.insert(asset, amount);
        }
        account
    }

    #[must_use]
    pub fn balance(&self, asset: &Asset) -> Money {
        self.balances.get(asset).copied().unwrap_or(0)
    }

    /// Stake that can back a block at `height`, counting pending entries that have matured.
    #[must_use]
    pub fn stake_available(&self, height: u64) -> Money {
        self.pending_stake
            .iter()
            .filter(|p| p.activation_height <= height)
            .fold(self.stake, |acc, p| acc.saturating_add(p.amount))
    }

    pub fn apply_nonce_increment(&mut self) -> Result<(), TxVerifyErr> {
        self.nonce = self.nonce.checked_add(1).ok_or(TxVerifyErr::Overflow)?;
        Ok(())
    }

    pub fn apply_balance_delta(&mut self, asset: Asset, delta: i128) -> Result<(), TxVerifyErr> {
        let current = i128::from(self.balance(&asset));
        let next = current + delta;

        if next < 0 {
            return Err(TxVerifyErr::InsufficientBalance);
        }

        let next = Money::try_from(next).map_err(|_| TxVerifyErr::Overflow)?;

        if next == 0 {
            self.balances.remove(&asset);
        } else {
            self.balances.insert(asset, next);
        }

        Ok(())
    }

    /// Moves matured pending entries into `stake`.
    pub fn mature_stake(&mut self, height: u64) {
        let mut matured: Money = 0;
        self.pending_stake.retain(|p| {
            if p.activation_height <= height {
                matured = matured.saturating_add(p.amount);
                false
            } else {
                true
            }
        });
        self.stake = self.stake.saturating_add(matured);
    }

    pub fn add_pending_stake(&mut self, amount: Money, activation_height: u64) {
        self.pending_stake.push(PendingStake {
            activation_height,
            amount,
        });
    }

    /// Withdraws mature stake. Pending entries cannot be withdrawn.
    pub fn withdraw_stake(&mut self, amount: Money, height: u64) -> Result<(), TxVerifyErr> {
        self.mature_stake(height);

        if self.stake < amount {
            return Err(TxVerifyErr::InsufficientStake);
        }

        self.stake -= amount;
        Ok(())
    }

    /// Empty accounts are deleted from the ledger rather than stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nonce == 0
            && self.balances.is_empty()
            && self.stake == 0
            && self.pending_stake.is_empty()
            && self.delegated_public_key.is_none()
    }
}
