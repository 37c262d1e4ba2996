// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::{AccountLedger, LedgerErr, StoreBackend};
use crate::consensus::{Money, STAKE_MATURITY_BLOCKS};
use crate::primitives::{Address, Asset, Hash256, PrivateKey, PublicKey, Signature, SignatureErr};
use bincode::{Decode, Encode};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub enum TxVerifyErr {
    InvalidSignature,
    InvalidProof,
    InvalidNonce { expected: u64, got: u64 },
    AccountNotFound,
    InsufficientBalance,
    InsufficientStake,
    DuplicateZetherNonce,
    AlreadyIncluded,
    EmptyPayloads,
    Overflow,
    Encoding,
    Ledger(LedgerErr),
}

impl From<LedgerErr> for TxVerifyErr {
    fn from(err: LedgerErr) -> Self {
        Self::Ledger(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Script {
    Transfer {
        to: Address,
        asset: Asset,
        amount: Money,
    },

    /// Locks `amount` of the native asset as stake forged by `delegated_public_key`.
    Delegate {
        delegated_public_key: PublicKey,
        amount: Money,
    },

    Unstake {
        amount: Money,
    },
}

/// Transparent account transaction.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SimpleTx {
    pub nonce: u64,
    pub sender: PublicKey,
    pub fee_asset: Asset,
    pub fee: Money,
    pub script: Script,
    pub signature: Signature,
}

/// One hidden balance spend. The ring proof is opaque here; it only has to
/// commit to the payload statement.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ZetherPayload {
    pub asset: Asset,
    pub fee: Money,
    pub nonce: Hash256,
    pub ring: Vec<PublicKey>,
    pub proof: Vec<u8>,
}

impl ZetherPayload {
    fn statement_hash(&self) -> Result<Hash256, TxVerifyErr> {
        let statement = (&self.asset, self.fee, &self.nonce, &self.ring);
        let bytes = crate::codec::encode_to_vec(&statement).map_err(|_| TxVerifyErr::Encoding)?;
        Ok(Hash256::hash_from_slice(bytes, "zether.statement"))
    }

    fn verify_proof(&self) -> Result<(), TxVerifyErr> {
        if self.ring.is_empty() || self.proof.len() < 32 {
            return Err(TxVerifyErr::InvalidProof);
        }

        if self.proof[..32] != self.statement_hash()?.0 {
            return Err(TxVerifyErr::InvalidProof);
        }

        Ok(())
    }

    /// Binds the proof to the current statement.
    pub fn bind_proof(&mut self, mut proof_body: Vec<u8>) -> Result<(), TxVerifyErr> {
        let mut proof = self.statement_hash()?.0.to_vec();
        proof.append(&mut proof_body);
        self.proof = proof;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ZetherTx {
    pub payloads: Vec<ZetherPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Transaction {
    Simple(SimpleTx),
    Zether(ZetherTx),
}

impl Transaction {
    /// Builds and signs a transfer.
    pub fn transfer(
        key: &PrivateKey,
        nonce: u64,
        fee: Money,
        to: Address,
        asset: Asset,
        amount: Money,
    ) -> Result<Self, SignatureErr> {
        let mut tx = Self::Simple(SimpleTx {
            nonce,
            sender: key.public_key(),
            fee_asset: Asset::NATIVE,
            fee,
            script: Script::Transfer { to, asset, amount },
            signature: Signature::zero(),
        });
        tx.sign(key)?;
        Ok(tx)
    }

    /// Builds and signs a stake delegation.
    pub fn delegate(
        key: &PrivateKey,
        nonce: u64,
        fee: Money,
        delegated_public_key: PublicKey,
        amount: Money,
    ) -> Result<Self, SignatureErr> {
        let mut tx = Self::Simple(SimpleTx {
            nonce,
            sender: key.public_key(),
            fee_asset: Asset::NATIVE,
            fee,
            script: Script::Delegate {
                delegated_public_key,
                amount,
            },
            signature: Signature::zero(),
        });
        tx.sign(key)?;
        Ok(tx)
    }

    /// Size in bytes of the encoded transaction.
    pub fn serialized_size(&self) -> Result<u64, TxVerifyErr> {
        crate::codec::encoded_len(self)
            .map(|len| len as u64)
            .map_err(|_| TxVerifyErr::Encoding)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TxVerifyErr> {
        crate::codec::encode_to_vec(self).map_err(|_| TxVerifyErr::Encoding)
    }

    pub fn content_hash(&self) -> Result<Hash256, TxVerifyErr> {
        Ok(Hash256::hash_from_slice(self.to_bytes()?, "tx"))
    }

    /// Hash of everything except the signature.
    pub fn signing_hash(&self) -> Result<Hash256, TxVerifyErr> {
        let bytes = match self {
            Self::Simple(tx) => crate::codec::encode_to_vec(&(
                tx.nonce,
                &tx.sender,
                &tx.fee_asset,
                tx.fee,
                &tx.script,
            )),

            Self::Zether(tx) => {
                let statements: Vec<_> = tx
                    .payloads
                    .iter()
                    .map(|p| (p.asset, p.fee, p.nonce, p.ring.clone()))
                    .collect();
                crate::codec::encode_to_vec(&statements)
            }
        }
        .map_err(|_| TxVerifyErr::Encoding)?;

        Ok(Hash256::hash_from_slice(bytes, "tx.sign"))
    }

    /// Signs a transparent transaction with the sender key. Hidden balance
    /// transactions carry their own proofs and are left untouched.
    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), SignatureErr> {
        let hash = self
            .signing_hash()
            .map_err(|_| SignatureErr::SigningFailed)?;

        if let Self::Simple(tx) = self {
            tx.signature = key.sign(hash.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_signature(&self) -> Result<(), TxVerifyErr> {
        match self {
            Self::Simple(tx) => {
                let hash = self.signing_hash()?;

                if !tx.sender.verify(hash.as_bytes(), &tx.signature) {
                    return Err(TxVerifyErr::InvalidSignature);
                }

                Ok(())
            }

            Self::Zether(tx) => {
                if tx.payloads.is_empty() {
                    return Err(TxVerifyErr::EmptyPayloads);
                }

                tx.payloads.iter().try_for_each(ZetherPayload::verify_proof)
            }
        }
    }

    /// Fees paid, per asset.
    #[must_use]
    pub fn compute_fees(&self) -> BTreeMap<Asset, Money> {
        let mut fees = BTreeMap::new();

        match self {
            Self::Simple(tx) => {
                fees.insert(tx.fee_asset, tx.fee);
            }

            Self::Zether(tx) => {
                for payload in &tx.payloads {
                    let entry = fees.entry(payload.asset).or_insert(0_u64);
                    *entry = entry.saturating_add(payload.fee);
                }
            }
        }

        fees
    }

    /// Sender address and nonce of transparent transactions.
    #[must_use]
    pub fn sender_nonce(&self) -> Option<(Address, u64)> {
        match self {
            Self::Simple(tx) => Some((tx.sender.to_address(), tx.nonce)),
            Self::Zether(_) => None,
        }
    }

    #[must_use]
    pub fn zether_nonces(&self) -> Vec<Hash256> {
        match self {
            Self::Simple(_) => vec![],
            Self::Zether(tx) => tx.payloads.iter().map(|p| p.nonce).collect(),
        }
    }

    /// Stages the effects of the transaction in `ledger`. On error every change
    /// staged in the ledger is discarded, so callers applying several
    /// transactions in one scope must commit after each success they want to keep.
    pub fn apply_to_ledger<B: StoreBackend>(
        &self,
        height: u64,
        ledger: &mut AccountLedger<B>,
    ) -> Result<(), TxVerifyErr> {
        let result = self.stage(height, ledger);

        if result.is_err() {
            ledger.rollback();
        }

        result
    }

    fn stage<B: StoreBackend>(
        &self,
        height: u64,
        ledger: &mut AccountLedger<B>,
    ) -> Result<(), TxVerifyErr> {
        let hash = self.content_hash()?;

        if ledger.is_tx_included(&hash)? {
            return Err(TxVerifyErr::AlreadyIncluded);
        }

        match self {
            Self::Simple(tx) => stage_simple(tx, height, ledger)?,
            Self::Zether(tx) => stage_zether(tx, ledger)?,
        }

        ledger.include_tx(&hash)?;
        Ok(())
    }
}

fn stage_simple<B: StoreBackend>(
    tx: &SimpleTx,
    height: u64,
    ledger: &mut AccountLedger<B>,
) -> Result<(), TxVerifyErr> {
    let sender_address = tx.sender.to_address();
    let mut sender = ledger
        .get_account(&sender_address)?
        .ok_or(TxVerifyErr::AccountNotFound)?;

    if sender.nonce != tx.nonce {
        return Err(TxVerifyErr::InvalidNonce {
            expected: sender.nonce,
            got: tx.nonce,
        });
    }

    sender.apply_balance_delta(tx.fee_asset, -i128::from(tx.fee))?;

    match &tx.script {
        Script::Transfer { to, asset, amount } => {
            sender.apply_balance_delta(*asset, -i128::from(*amount))?;

            if to == &sender_address {
                sender.apply_balance_delta(*asset, i128::from(*amount))?;
            } else {
                let mut recipient = ledger.get_account(to)?.unwrap_or_default();
                recipient.apply_balance_delta(*asset, i128::from(*amount))?;
                ledger.update_account(to, &recipient)?;
            }
        }

        Script::Delegate {
            delegated_public_key,
            amount,
        } => {
            sender.apply_balance_delta(Asset::NATIVE, -i128::from(*amount))?;
            sender.delegated_public_key = Some(*delegated_public_key);
            let activation_height = height
                .checked_add(STAKE_MATURITY_BLOCKS)
                .ok_or(TxVerifyErr::Overflow)?;
            sender.add_pending_stake(*amount, activation_height);
        }

        Script::Unstake { amount } => {
            sender.withdraw_stake(*amount, height)?;
            sender.apply_balance_delta(Asset::NATIVE, i128::from(*amount))?;
        }
    }

    sender.apply_nonce_increment()?;
    ledger.update_account(&sender_address, &sender)?;
    Ok(())
}

fn stage_zether<B: StoreBackend>(
    tx: &ZetherTx,
    ledger: &mut AccountLedger<B>,
) -> Result<(), TxVerifyErr> {
    if tx.payloads.is_empty() {
        return Err(TxVerifyErr::EmptyPayloads);
    }

    let mut seen = HashSet::with_capacity(tx.payloads.len());

    for payload in &tx.payloads {
        if !seen.insert(payload.nonce) || ledger.is_zether_nonce_spent(&payload.nonce)? {
            return Err(TxVerifyErr::DuplicateZetherNonce);
        }

        ledger.spend_zether_nonce(&payload.nonce)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryBackend;
    use crate::consensus::COIN;
    use crate::primitives::Account;

    fn funded_ledger(key: &PrivateKey, amount: Money) -> AccountLedger<MemoryBackend> {
        let mut ledger = AccountLedger::new(MemoryBackend::new());
        let account = Account::with_balance(Asset::NATIVE, amount);
        ledger
            .update_account(&key.public_key().to_address(), &account)
            .unwrap();
        ledger.commit();
        ledger
    }

    fn zether_tx(nonces: &[u8]) -> Transaction {
        let ring = vec![PrivateKey::random().public_key()];
        let payloads = nonces
            .iter()
            .map(|n| {
                let mut payload = ZetherPayload {
                    asset: Asset::NATIVE,
                    fee: 100,
                    nonce: Hash256::hash_from_slice([*n], "test"),
                    ring: ring.clone(),
                    proof: vec![],
                };
                payload.bind_proof(vec![1, 2, 3]).unwrap();
                payload
            })
            .collect();
        Transaction::Zether(ZetherTx { payloads })
    }

    #[test]
    fn signed_transfer_verifies() {
        let key = PrivateKey::random();
        let tx = Transaction::transfer(&key, 0, 10, Address::zero(), Asset::NATIVE, 5).unwrap();
        assert!(tx.verify_signature().is_ok());

        let Transaction::Simple(mut inner) = tx else {
            unreachable!()
        };
        inner.fee += 1;
        assert_eq!(
            Transaction::Simple(inner).verify_signature(),
            Err(TxVerifyErr::InvalidSignature)
        );
    }

    #[test]
    fn content_hash_covers_signature() {
        let key = PrivateKey::random();
        let tx = Transaction::transfer(&key, 0, 10, Address::zero(), Asset::NATIVE, 5).unwrap();
        let Transaction::Simple(mut inner) = tx.clone() else {
            unreachable!()
        };
        inner.signature = Signature::zero();
        let unsigned = Transaction::Simple(inner);
        assert_eq!(tx.signing_hash(), unsigned.signing_hash());
        assert_ne!(tx.content_hash(), unsigned.content_hash());
    }

    #[test]
    fn transfer_moves_balance_and_fee() {
        let key = PrivateKey::random();
        let to = Address::random();
        let mut ledger = funded_ledger(&key, 1_000);
        let tx = Transaction::transfer(&key, 0, 10, to, Asset::NATIVE, 300).unwrap();
        tx.apply_to_ledger(1, &mut ledger).unwrap();
        ledger.commit();

        let sender = ledger
            .get_account(&key.public_key().to_address())
            .unwrap()
            .unwrap();
        assert_eq!(sender.balance(&Asset::NATIVE), 690);
        assert_eq!(sender.nonce, 1);
        let recipient = ledger.get_account(&to).unwrap().unwrap();
        assert_eq!(recipient.balance(&Asset::NATIVE), 300);
        assert!(ledger.is_tx_included(&tx.content_hash().unwrap()).unwrap());
    }

    #[test]
    fn failed_apply_leaves_nothing_staged() {
        let key = PrivateKey::random();
        let to = Address::random();
        let mut ledger = funded_ledger(&key, 100);
        let tx = Transaction::transfer(&key, 0, 10, to, Asset::NATIVE, 300).unwrap();
        assert_eq!(
            tx.apply_to_ledger(1, &mut ledger),
            Err(TxVerifyErr::InsufficientBalance)
        );
        assert!(!ledger.has_changes());
        assert!(ledger.get_account(&to).unwrap().is_none());
    }

    #[test]
    fn wrong_nonce_is_rejected() {
        let key = PrivateKey::random();
        let mut ledger = funded_ledger(&key, 1_000);
        let tx = Transaction::transfer(&key, 1, 10, Address::random(), Asset::NATIVE, 1).unwrap();
        assert_eq!(
            tx.apply_to_ledger(1, &mut ledger),
            Err(TxVerifyErr::InvalidNonce {
                expected: 0,
                got: 1
            })
        );
    }

    #[test]
    fn same_tx_cannot_apply_twice() {
        let key = PrivateKey::random();
        let mut ledger = funded_ledger(&key, 1_000);
        let tx = zether_tx(&[1]);
        tx.apply_to_ledger(1, &mut ledger).unwrap();
        ledger.commit();
        assert_eq!(
            tx.apply_to_ledger(1, &mut ledger),
            Err(TxVerifyErr::AlreadyIncluded)
        );
    }

    #[test]
    fn delegation_matures() {
        let key = PrivateKey::random();
        let forger = PrivateKey::random().public_key();
        let mut ledger = funded_ledger(&key, 10 * COIN);
        let tx = Transaction::delegate(&key, 0, 10, forger, 5 * COIN).unwrap();
        tx.apply_to_ledger(7, &mut ledger).unwrap();
        ledger.commit();

        let account = ledger
            .get_account(&key.public_key().to_address())
            .unwrap()
            .unwrap();
        assert_eq!(account.delegated_public_key, Some(forger));
        assert_eq!(account.stake_available(7), 0);
        assert_eq!(account.stake_available(7 + STAKE_MATURITY_BLOCKS), 5 * COIN);
    }

    #[test]
    fn zether_nonces_are_single_use() {
        let key = PrivateKey::random();
        let mut ledger = funded_ledger(&key, 0);
        assert_eq!(
            zether_tx(&[1, 1]).apply_to_ledger(1, &mut ledger),
            Err(TxVerifyErr::DuplicateZetherNonce)
        );

        zether_tx(&[1, 2]).apply_to_ledger(1, &mut ledger).unwrap();
        ledger.commit();
        assert_eq!(
            zether_tx(&[3, 2]).apply_to_ledger(1, &mut ledger),
            Err(TxVerifyErr::DuplicateZetherNonce)
        );
    }

    #[test]
    fn zether_signing_hash_covers_statements_only() {
        let tx = zether_tx(&[1, 2]);
        let Transaction::Zether(mut reproved) = tx.clone() else {
            unreachable!()
        };
        reproved.payloads[1].bind_proof(vec![9; 16]).unwrap();
        let reproved = Transaction::Zether(reproved);
        assert_eq!(tx.signing_hash(), reproved.signing_hash());
        assert_ne!(tx.content_hash(), reproved.content_hash());

        let Transaction::Zether(mut changed) = tx.clone() else {
            unreachable!()
        };
        changed.payloads[0].fee += 1;
        assert_ne!(
            tx.signing_hash().unwrap(),
            Transaction::Zether(changed).signing_hash().unwrap()
        );
    }

    #[test]
    fn zether_proof_must_bind_statement() {
        let tx = zether_tx(&[1]);
        assert!(tx.verify_signature().is_ok());

        let Transaction::Zether(mut inner) = tx else {
            unreachable!()
        };
        inner.payloads[0].fee += 1;
        assert_eq!(
            Transaction::Zether(inner).verify_signature(),
            Err(TxVerifyErr::InvalidProof)
        );
    }

    #[test]
    fn fees_are_summed_per_asset() {
        let fees = zether_tx(&[1, 2, 3]).compute_fees();
        assert_eq!(fees.get(&Asset::NATIVE), Some(&300));
    }
}
