// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::Money;
use crate::primitives::{Hash256, PublicKey};
use ibig::UBig;
use sha3::{Digest, Sha3_256};

/// Computes the stake kernel of a block template for a forger at `timestamp`.
#[must_use]
pub fn kernel_hash(template: &[u8], timestamp: i64, public_key: &PublicKey) -> Hash256 {
    let mut hasher = Sha3_256::new();
    hasher.update(template);
    hasher.update(timestamp.to_le_bytes());
    hasher.update(public_key.as_bytes());
    let hash = hasher.finalize();
    let mut out = Hash256::zero();
    out.0.copy_from_slice(&hash[..]);
    out
}

/// Returns true if `kernel / stake <= target`. A zero stake never meets the target.
#[must_use]
pub fn meets_target(kernel: &Hash256, stake: Money, target: &Hash256) -> bool {
    if stake == 0 {
        return false;
    }

    let effective = kernel.to_ubig() / UBig::from(stake);
    effective <= target.to_ubig()
}

/// The smallest stake a winning kernel needs to disclose, clamped to `[min_stake, stake]`.
#[must_use]
pub fn staking_amount_used(
    kernel: &Hash256,
    target: &Hash256,
    stake: Money,
    min_stake: Money,
) -> Money {
    let target = target.to_ubig();

    if target == UBig::from(0_u8) {
        return stake.max(min_stake);
    }

    let needed = kernel.to_ubig() / target + UBig::from(1_u8);
    let needed = u64::try_from(&needed).unwrap_or(Money::MAX);
    needed.min(stake).max(min_stake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::PrivateKey;
    use quickcheck_macros::quickcheck;

    #[test]
    fn max_target_is_met_by_unit_stake() {
        let key = PrivateKey::random().public_key();
        let kernel = kernel_hash(b"template", 1_700_000_000, &key);
        assert!(meets_target(&kernel, 1, &Hash256::max_value()));
    }

    #[test]
    fn zero_target_is_met_only_by_zero_kernel() {
        assert!(meets_target(&Hash256::zero(), 1, &Hash256::zero()));

        let mut kernel = Hash256::zero();
        kernel.0[31] = 1;
        assert!(!meets_target(&kernel, 1, &Hash256::zero()));
    }

    #[test]
    fn zero_stake_never_meets_target() {
        assert!(!meets_target(&Hash256::zero(), 0, &Hash256::max_value()));
    }

    #[test]
    fn kernel_depends_on_every_input() {
        let a = PrivateKey::random().public_key();
        let b = PrivateKey::random().public_key();
        let base = kernel_hash(b"template", 10, &a);
        assert_ne!(base, kernel_hash(b"template", 11, &a));
        assert_ne!(base, kernel_hash(b"templatf", 10, &a));
        assert_ne!(base, kernel_hash(b"template", 10, &b));
    }

    #[quickcheck]
    fn staking_amount_used_still_meets_target(
        kernel: Vec<u8>,
        target: Vec<u8>,
        stake: u64,
    ) -> bool {
        let kernel = Hash256::hash_from_slice(kernel, "test");
        let target = Hash256::hash_from_slice(target, "test");
        let stake = stake.max(1);

        if !meets_target(&kernel, stake, &target) {
            return true;
        }

        let used = staking_amount_used(&kernel, &target, stake, 1);
        used <= stake && meets_target(&kernel, used, &target)
    }

    #[test]
    fn staking_amount_used_respects_minimum() {
        let kernel = Hash256::zero();
        let used = staking_amount_used(&kernel, &Hash256::max_value(), 500, 100);
        assert_eq!(used, 100);
    }
}
