// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! # Stakenode
//! Proof of stake node core: a versioned account store, a mempool that keeps
//! a candidate block body ready for the current chain head, and a forging
//! engine that scans stake kernels across worker threads and assembles
//! signed blocks.
//!
//! ## Layout
//! * [`chain`]: storage backends, the versioned store, the account ledger and
//!   the canonical chain with bounded rewind.
//! * [`node`]: the mempool and the [`node::Node`] wiring everything together.
//! * [`forging`]: kernel scanning workers and block assembly.
//! * [`settings`]: layered configuration.

pub mod chain;
pub mod codec;
pub mod consensus;
#[cfg(feature = "forging")]
pub mod forging;
pub mod global;
pub mod node;
pub mod primitives;
pub mod settings;
