// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use lazy_static::*;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

lazy_static! {
    /// Set once a termination signal is received.
    pub static ref EXIT_SIGNAL: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
}
