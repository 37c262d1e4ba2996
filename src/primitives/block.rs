// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::Money;
use crate::primitives::{
    Address, Hash256, Hash256Algo, PrivateKey, PublicKey, Signature, SignatureErr, Transaction,
    TxVerifyErr,
};
use bincode::{Decode, Encode};
use merkletree::merkle::MerkleTree;
use merkletree::store::VecStore;

#[derive(Debug, Clone, PartialEq)]
pub enum BlockVerifyErr {
    InvalidParent,
    InvalidHeight,
    InvalidTimestamp,
    InvalidTarget,
    InvalidMerkleRoot,
    InvalidSignature,
    InvalidKernel,
    StakeAccountNotFound,
    DelegatedKeyMismatch,
    InsufficientStake,
    Encoding,
    Tx(TxVerifyErr),
}

impl From<TxVerifyErr> for BlockVerifyErr {
    fn from(err: TxVerifyErr) -> Self {
        Self::Tx(err)
    }
}

/// Fields hashed into the stake kernel. Transactions are chosen only once a
/// kernel is found, so they are not part of the template.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct KernelTemplate {
    pub height: u64,
    pub prev_hash: Hash256,
}

impl KernelTemplate {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockVerifyErr> {
        crate::codec::encode_to_vec(self).map_err(|_| BlockVerifyErr::Encoding)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_hash: Hash256,
    pub timestamp: i64,

    /// Delegated key of the forger. Signs the header.
    pub forger: PublicKey,

    /// Account whose stake backs the block.
    pub stake_address: Address,

    /// Stake disclosed by the forger. At most the account's available stake.
    pub staking_amount: Money,

    pub target: Hash256,
    pub merkle_root: Hash256,
    pub signature: Signature,
}

impl BlockHeader {
    #[must_use]
    pub fn kernel_template(&self) -> KernelTemplate {
        KernelTemplate {
            height: self.height,
            prev_hash: self.prev_hash,
        }
    }

    pub fn signing_hash(&self) -> Result<Hash256, BlockVerifyErr> {
        let mut unsigned = self.clone();
        unsigned.signature = Signature::zero();
        let bytes = crate::codec::encode_to_vec(&unsigned).map_err(|_| BlockVerifyErr::Encoding)?;
        Ok(Hash256::hash_from_slice(bytes, "block.sign"))
    }

    pub fn hash(&self) -> Result<Hash256, BlockVerifyErr> {
        let bytes = crate::codec::encode_to_vec(self).map_err(|_| BlockVerifyErr::Encoding)?;
        Ok(Hash256::hash_from_slice(bytes, "block"))
    }

    pub fn sign(&mut self, key: &PrivateKey) -> Result<(), SignatureErr> {
        let hash = self
            .signing_hash()
            .map_err(|_| SignatureErr::SigningFailed)?;
        self.signature = key.sign(hash.as_bytes())?;
        Ok(())
    }

    pub fn verify_signature(&self) -> Result<(), BlockVerifyErr> {
        let hash = self.signing_hash()?;

        if !self.forger.verify(hash.as_bytes(), &self.signature) {
            return Err(BlockVerifyErr::InvalidSignature);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Result<Hash256, BlockVerifyErr> {
        self.header.hash()
    }

    pub fn compute_merkle_root(txs: &[Transaction]) -> Result<Hash256, BlockVerifyErr> {
        if txs.is_empty() {
            return Ok(Hash256::zero());
        }

        let mut leaves = txs
            .iter()
            .map(Transaction::content_hash)
            .collect::<Result<Vec<_>, _>>()?;

        // The tree needs a power of two number of leaves, at least two
        let padded_len = leaves.len().next_power_of_two().max(2);
        leaves.resize(padded_len, Hash256::zero());

        let mt: MerkleTree<Hash256, Hash256Algo, VecStore<Hash256>> =
            MerkleTree::from_data::<Hash256, _>(leaves).map_err(|_| BlockVerifyErr::Encoding)?;
        Ok(mt.root())
    }

    pub fn verify_merkle_root(&self) -> Result<(), BlockVerifyErr> {
        if Self::compute_merkle_root(&self.txs)? != self.header.merkle_root {
            return Err(BlockVerifyErr::InvalidMerkleRoot);
        }

        Ok(())
    }
}
