// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use bincode::{Decode, Encode};
use ibig::UBig;
use merkletree::hash::{Algorithm, Hashable};
use merkletree::merkle::Element;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash as HashTrait;
use std::hash::Hasher;
use zeroize::Zeroize;

pub const ADDRESS_BYTES: usize = 20;
pub const ASSET_BYTES: usize = 20;

const HASH_KEY_PREFIX: &str = "stakenode.hash.32.";

#[derive(
    PartialEq,
    Eq,
    Encode,
    Decode,
    Clone,
    HashTrait,
    Zeroize,
    PartialOrd,
    Ord,
    Default,
    Copy,
    Serialize,
    Deserialize,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn zero() -> Self {
        Self([0; 32])
    }

    #[must_use]
    pub fn max_value() -> Self {
        Self([0xff; 32])
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(encoded).map_err(|_| "invalid hex")?;

        if bytes.len() != 32 {
            return Err("invalid hash length");
        }

        let mut out = Self::zero();
        out.0.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Keyed blake3 hash. The key separates hashing domains so that the same
    /// bytes hashed for two different purposes never collide.
    #[inline]
    pub fn hash_from_slice<T: AsRef<[u8]>>(slice: T, key: &str) -> Self {
        let mut out_hash = Hash256([0; 32]);
        let key = [HASH_KEY_PREFIX, key].concat();
        let mut hasher = blake3::Hasher::new_derive_key(&key);
        hasher.update(slice.as_ref());
        let mut out = hasher.finalize_xof();
        out.fill(&mut out_hash.0);
        out_hash
    }

    /// Interprets the hash as a big endian unsigned integer.
    #[must_use]
    pub fn to_ubig(&self) -> UBig {
        UBig::from_be_bytes(&self.0)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash256").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Element for Hash256 {
    fn byte_len() -> usize {
        32
    }

    fn from_slice(bytes: &[u8]) -> Self {
        assert!(bytes.len() == Self::byte_len(), "invalid slice len");

        let mut out = [0; 32];
        out.copy_from_slice(bytes);
        Self(out)
    }

    fn copy_to_slice(&self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.0);
    }
}

impl<H: Hasher> Hashable<H> for Hash256 {
    fn hash(&self, state: &mut H) {
        Hashable::hash(&self.0, state);
    }
}

#[derive(Default)]
pub struct Hash256Algo(Vec<u8>);

impl Hasher for Hash256Algo {
    #[inline]
    fn write(&mut self, msg: &[u8]) {
        self.0.extend_from_slice(msg);
    }

    #[inline]
    fn finish(&self) -> u64 {
        unimplemented!()
    }
}

impl Algorithm<Hash256> for Hash256Algo {
    #[inline]
    fn hash(&mut self) -> Hash256 {
        Hash256::hash_from_slice(&self.0, "merkle")
    }

    #[inline]
    fn reset(&mut self) {
        self.0.clear();
    }
}

/// Public key hash of an account.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, HashTrait, Encode, Decode, Default)]
pub struct Address(pub [u8; ADDRESS_BYTES]);

impl Address {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn zero() -> Self {
        Self([0; ADDRESS_BYTES])
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(encoded).map_err(|_| "invalid address")?;

        if bytes.len() != ADDRESS_BYTES {
            return Err("invalid address length");
        }

        let mut out = Self::zero();
        out.0.copy_from_slice(&bytes);
        Ok(out)
    }

    #[cfg(test)]
    #[must_use]
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Asset identifier. The all-zero asset is the native coin.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, HashTrait, Encode, Decode, Default)]
pub struct Asset(pub [u8; ASSET_BYTES]);

impl Asset {
    pub const NATIVE: Asset = Asset([0; ASSET_BYTES]);

    #[must_use]
    pub fn is_native(&self) -> bool {
        self == &Self::NATIVE
    }

    pub fn from_hex(encoded: &str) -> Result<Self, &'static str> {
        let bytes = hex::decode(encoded).map_err(|_| "invalid asset")?;

        if bytes.len() != ASSET_BYTES {
            return Err("invalid asset length");
        }

        let mut out = Self::NATIVE;
        out.0.copy_from_slice(&bytes);
        Ok(out)
    }
}

impl fmt::Debug for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_native() {
            f.debug_tuple("Asset").field(&"native").finish()
        } else {
            f.debug_tuple("Asset").field(&hex::encode(self.0)).finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merkletree::merkle::MerkleTree;
    use merkletree::store::VecStore;

    #[test]
    fn hash_keys_separate_domains() {
        let a = Hash256::hash_from_slice("stakenode", "tx");
        let b = Hash256::hash_from_slice("stakenode", "block");
        assert_ne!(a, b);
        assert_eq!(a, Hash256::hash_from_slice("stakenode", "tx"));
    }

    #[test]
    fn hex_round_trip() {
        let hash = Hash256::hash_from_slice("", "");
        assert_eq!(Hash256::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(Hash256::from_hex("abcd").is_err());
    }

    #[test]
    fn serialised_address_is_20_bytes() {
        let bytes = crate::codec::encode_to_vec(&Address::zero()).unwrap();
        assert_eq!(bytes.len(), 20);
    }

    #[test]
    fn to_ubig_is_big_endian() {
        let mut hash = Hash256::zero();
        hash.0[31] = 2;
        hash.0[30] = 1;
        assert_eq!(hash.to_ubig(), UBig::from(258_u16));
    }

    #[test]
    fn merkle_root_changes_with_leaves() {
        let leaves = |n: u8| -> Vec<Hash256> {
            (0..4).map(|i| Hash256::hash_from_slice([i, n], "test")).collect()
        };
        let a: MerkleTree<Hash256, Hash256Algo, VecStore<Hash256>> =
            MerkleTree::from_data::<Hash256, _>(leaves(0)).unwrap();
        let b: MerkleTree<Hash256, Hash256Algo, VecStore<Hash256>> =
            MerkleTree::from_data::<Hash256, _>(leaves(1)).unwrap();
        assert_ne!(a.root(), b.root());
    }
}
