// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2023 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use anyhow::anyhow;
use log::*;
use mimalloc::MiMalloc;
use stakenode::chain::MemoryBackend;
use stakenode::global::EXIT_SIGNAL;
use stakenode::node::Node;
use stakenode::settings::Settings;
use tracing_subscriber::prelude::*;

#[cfg(not(windows))]
use signal_hook::consts::TERM_SIGNALS;
#[cfg(not(windows))]
use signal_hook::flag;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> anyhow::Result<()> {
    #[cfg(not(windows))]
    for sig in TERM_SIGNALS {
        // When terminated by a second term signal, exit with exit code 1.
        // This will do nothing the first time (because term_now is false).
        flag::register_conditional_shutdown(*sig, 1, EXIT_SIGNAL.clone())?;
        // But this will "arm" the above for the second time, by setting it to true.
        // The order of registering these is important, if you put this one first, it will
        // first arm and then terminate all in the first round.
        flag::register(*sig, EXIT_SIGNAL.clone())?;
    }

    init_tracing()?;
    let settings = Settings::new()?;

    let verifier_threads = if settings.node.verifier_threads == 0 {
        num_cpus::get()
    } else {
        settings.node.verifier_threads as usize
    };

    // Also set rayon thread count according to verifier_threads value
    rayon::ThreadPoolBuilder::new()
        .num_threads(verifier_threads)
        .build_global()?;

    let node = Node::new(MemoryBackend::new(), settings.node_config());

    #[cfg(feature = "forging")]
    for (key, stake_address) in settings.delegated_wallets()? {
        if node.register_wallet(key, stake_address) {
            info!("Forging for stake address {}", stake_address);
        }
    }

    info!(
        "Running Stakenode v{} on {} in memory only mode",
        env!("CARGO_PKG_VERSION"),
        settings.node.network_name
    );

    // This blocks until the exit signal is received
    node.run(&EXIT_SIGNAL)
        .map_err(|err| anyhow!("Node stopped with error: {:?}", err))?;
    node.shutdown();

    info!(
        "Stakenode v{} shutting down...",
        env!("CARGO_PKG_VERSION")
    );

    Ok(())
}

/// Installs a fmt subscriber filtered by `RUST_LOG`. Records emitted through
/// `log` are captured as well.
fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::filter::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
