// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use static_assertions::*;

/// Money type. Balances, fees and stakes are all expressed in the smallest unit.
pub type Money = u64;

/// Smallest units per coin.
pub const COIN: Money = 100_000_000;

/// Difficulty will be adjusted so that blocks are added in `n` secs
pub const BLOCK_TIME_SECONDS: u64 = 10;

/// New block with timestamps greater than `current_time + n` will be rejected. Forgers
/// also never scan kernels past this bound. Expressed in seconds
pub const BLOCK_TIMESTAMP_MAX: u64 = 10;

/// Maximum block size in bytes
pub const MAX_BYTES_PER_BLOCK: u64 = 380_000;

/// Max bytes per transaction
pub const TRANSACTION_LIMIT_SIZE: u64 = 10_000;

/// Minimum fee per byte paid in the native asset for a transaction to be relayed
pub const NATIVE_FEE_PER_BYTE: Money = 10;

/// Delegated stake becomes usable for forging only after `n` blocks
pub const STAKE_MATURITY_BLOCKS: u64 = 10;

/// Stake required to forge while the chain is bootstrapping
pub const BOOTSTRAP_REQUIRED_STAKE: Money = COIN;

/// Height at which the bootstrap stake requirement ends
pub const BOOTSTRAP_HEIGHT: u64 = 1_000;

/// Stake required to forge after the bootstrap period
pub const REQUIRED_STAKE: Money = 100 * COIN;

/// Transition logs older than `n` blocks are deleted by default
pub const DEFAULT_MAX_REORG_DEPTH: u64 = 100;

/// Unconfirmed transactions are evicted from the mempool after `n` seconds
pub const DEFAULT_MEMPOOL_TX_TTL_SECS: u64 = 3 * 60 * 60;

/// Initial kernel target, big endian.
pub const INITIAL_TARGET: [u8; 32] = [
    0x00, 0x00, 0x0f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Returns the minimum amount of mature stake an account needs at `height` to forge.
#[must_use]
pub fn required_stake(height: u64) -> Money {
    if height < BOOTSTRAP_HEIGHT {
        BOOTSTRAP_REQUIRED_STAKE
    } else {
        REQUIRED_STAKE
    }
}

const_assert!(COIN > 0);
const_assert!(MAX_BYTES_PER_BLOCK >= 380_000);
const_assert!(MAX_BYTES_PER_BLOCK <= 750_000);
const_assert!(TRANSACTION_LIMIT_SIZE < MAX_BYTES_PER_BLOCK);
const_assert!(BLOCK_TIMESTAMP_MAX >= BLOCK_TIME_SECONDS);
const_assert!(BOOTSTRAP_REQUIRED_STAKE <= REQUIRED_STAKE);
const_assert!(STAKE_MATURITY_BLOCKS > 0);
const_assert!(DEFAULT_MAX_REORG_DEPTH >= STAKE_MATURITY_BLOCKS);
