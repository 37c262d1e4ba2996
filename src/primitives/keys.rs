// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::primitives::{Address, Hash256, ADDRESS_BYTES};
use bincode::{Decode, Encode};
use ed25519_dalek::{
    Signature as Ed25519Signature, Signer, SigningKey as Ed25519SigningKey,
    VerifyingKey as Ed25519VerifyingKey,
};
use std::fmt;
use std::hash::Hash as HashTrait;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const PUBLIC_KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, HashTrait, Encode, Decode)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_BYTES]);

impl PublicKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Public key hash used as the account key in the ledger.
    #[must_use]
    pub fn to_address(&self) -> Address {
        let hash = Hash256::hash_from_slice(self.0, "address");
        let mut out = Address::zero();
        out.0.copy_from_slice(&hash.0[..ADDRESS_BYTES]);
        out
    }

    /// Verifies `signature` over `message`. Malformed keys never verify.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = Ed25519VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let signature = Ed25519Signature::from_bytes(&signature.0);
        key.verify_strict(message, &signature).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&hex::encode(self.0))
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Signature(pub [u8; SIGNATURE_BYTES]);

impl Signature {
    #[must_use]
    pub fn zero() -> Self {
        Self([0; SIGNATURE_BYTES])
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature")
            .field(&hex::encode(self.0))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureErr {
    InvalidKeyEncoding,
    SigningFailed,
}

/// Ed25519 secret key. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self, SignatureErr> {
        let mut bytes = hex::decode(encoded.trim()).map_err(|_| SignatureErr::InvalidKeyEncoding)?;

        if bytes.len() != 32 {
            bytes.zeroize();
            return Err(SignatureErr::InvalidKeyEncoding);
        }

        let mut out = [0; 32];
        out.copy_from_slice(&bytes);
        bytes.zeroize();
        Ok(Self(out))
    }

    #[must_use]
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        let key = Ed25519SigningKey::from_bytes(&self.0);
        PublicKey(key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature, SignatureErr> {
        let key = Ed25519SigningKey::from_bytes(&self.0);
        let signature = key
            .try_sign(message)
            .map_err(|_| SignatureErr::SigningFailed)?;
        Ok(Signature(signature.to_bytes()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey").field(&"<redacted>").finish()
    }
}
