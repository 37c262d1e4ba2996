// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::consensus::*;
use crate::primitives::Hash256;

#[derive(Debug, Clone)]
pub struct ChainConfig {
    network_name: String,

    /// Blocks deeper than this below the tip can no longer be rewound.
    pub max_reorg_depth: u64,

    /// Forged blocks must meet this kernel target.
    pub target: Hash256,

    /// Blocks timestamped later than `now + n` seconds are rejected.
    pub max_clock_drift_secs: u64,

    pub genesis_timestamp: i64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::new("testnet")
    }
}

impl ChainConfig {
    pub fn new(network_name: &str) -> Self {
        Self {
            network_name: network_name.to_owned(),
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            target: Hash256(INITIAL_TARGET),
            max_clock_drift_secs: BLOCK_TIMESTAMP_MAX,
            genesis_timestamp: 0,
        }
    }

    #[must_use]
    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    #[must_use]
    pub fn genesis_hash(&self) -> Hash256 {
        Hash256::hash_from_slice(self.network_name.as_bytes(), "genesis")
    }
}
