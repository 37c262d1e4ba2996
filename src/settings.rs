// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022 The Purplecoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::chain::ChainConfig;
use crate::consensus::*;
#[cfg(feature = "forging")]
use crate::forging::ForgingConfig;
use crate::node::{MempoolConfig, NodeConfig};
use crate::primitives::{Address, Asset, PrivateKey};
use config::{Config, ConfigError, File};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{metadata, File as FsFile};
use std::io::Write;
use std::path::{Path, PathBuf};
use struct_field_names_as_array::FieldNamesAsArray;

const ENV_PREFIX: &str = "stakenode";

#[derive(Debug, Clone, Serialize, Deserialize, Default, FieldNamesAsArray)]
pub struct Settings {
    /// Node settings.
    pub node: Node,

    /// Mempool settings.
    pub mempool: Mempool,

    /// Forging settings.
    pub forging: Forging,
}

impl Settings {
    /// Loads `config.toml` from the platform config directory, writing the
    /// defaults there first if it doesn't exist, then applies environment
    /// overrides.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = default_config_path();

        if let Some(config_path) = &config_path {
            if metadata(config_path).is_err() {
                write_default_config(config_path);
            }
        }

        Self::load(config_path.as_deref(), std::env::vars())
    }

    /// Layers defaults, the file at `config_path` if present, and the
    /// `STAKENODE_<SECTION>_<KEY>` entries of `env_vars`.
    pub fn load<I>(config_path: Option<&Path>, env_vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut s = Config::builder();

        if let Some(config_path) = config_path {
            s = s.add_source(File::from(config_path).required(false));
        }

        // Set defaults
        let defaults = Self::defaults()?;
        for (k1, inner) in &defaults {
            for (k2, v) in inner {
                let key = format!("{k1}.{k2}");

                match v {
                    DynamicConfVal::String(v) => {
                        s = s.set_default(key, v.as_str())?;
                    }

                    DynamicConfVal::Sequence(v) => {
                        s = s.set_default(key, v.clone())?;
                    }

                    DynamicConfVal::Bool(v) => {
                        s = s.set_default(key, v.to_string())?;
                    }

                    DynamicConfVal::U64(v) => {
                        s = s.set_default(key, v.to_string())?;
                    }
                }
            }
        }

        // Make sure to list these in order
        let settings_modules: Vec<&[&str]> = vec![
            &Node::FIELD_NAMES_AS_ARRAY[..],
            &Mempool::FIELD_NAMES_AS_ARRAY[..],
            &Forging::FIELD_NAMES_AS_ARRAY[..],
        ];

        // Gather all possible settings keys
        let possible_keys: HashMap<String, (&str, &str)> = Settings::FIELD_NAMES_AS_ARRAY
            .iter()
            .zip(settings_modules)
            .flat_map(|(field, nested_fields)| {
                nested_fields.iter().map(move |nested| {
                    (
                        format!("{}_{}_{}", ENV_PREFIX, field, nested.replace('_', "")),
                        (*field, *nested),
                    )
                })
            })
            .collect();

        // Parse env vars manually and set overrides if they exist as the
        // config package `Environment` module seems to behave poorly.
        for (k, v) in env_vars {
            let Some((section, field)) = possible_keys.get(&k.to_lowercase()) else {
                continue;
            };

            // Filter empty values
            if v.is_empty() {
                continue;
            }

            let key = format!("{section}.{field}");
            let is_sequence = matches!(
                defaults.get(*section).and_then(|inner| inner.get(*field)),
                Some(DynamicConfVal::Sequence(_))
            );

            if is_sequence {
                let items: Vec<String> = v.split(',').map(|item| item.trim().to_owned()).collect();
                s = s.set_override(key, items)?;
            } else {
                s = s.set_override(key, v)?;
            }
        }

        let settings: Self = s.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn defaults() -> Result<HashMap<String, HashMap<String, DynamicConfVal>>, ConfigError> {
        let value = serde_yaml::to_value(Settings::default())
            .map_err(|err| ConfigError::Message(err.to_string()))?;
        serde_yaml::from_value(value).map_err(|err| ConfigError::Message(err.to_string()))
    }

    /// Checks values that deserialize fine but can't be used together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mempool.max_tx_size > self.mempool.max_block_size {
            return Err(ConfigError::Message(
                "mempool.max_tx_size is larger than mempool.max_block_size".to_owned(),
            ));
        }

        if self.forging.delegated_keys.len() != self.forging.stake_addresses.len() {
            return Err(ConfigError::Message(format!(
                "{} delegated keys configured for {} stake addresses",
                self.forging.delegated_keys.len(),
                self.forging.stake_addresses.len()
            )));
        }

        self.asset_fees_per_byte()?;
        self.delegated_wallets().map(|_| ())
    }

    /// Parses `mempool.asset_fees_per_byte` entries of the form `<asset hex>:<rate>`.
    pub fn asset_fees_per_byte(&self) -> Result<BTreeMap<Asset, Money>, ConfigError> {
        self.mempool
            .asset_fees_per_byte
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let invalid = |reason: &str| {
                    ConfigError::Message(format!("mempool.asset_fees_per_byte[{i}]: {reason}"))
                };
                let (asset, rate) = entry
                    .trim()
                    .split_once(':')
                    .ok_or_else(|| invalid("expected <asset>:<rate>"))?;
                let asset = Asset::from_hex(asset.trim()).map_err(|err| invalid(err))?;
                let rate = rate
                    .trim()
                    .parse::<Money>()
                    .map_err(|_| invalid("invalid rate"))?;
                Ok((asset, rate))
            })
            .collect()
    }

    /// Delegated keys paired with the stake address each forges for.
    pub fn delegated_wallets(&self) -> Result<Vec<(PrivateKey, Address)>, ConfigError> {
        self.forging
            .delegated_keys
            .iter()
            .zip(&self.forging.stake_addresses)
            .enumerate()
            .map(|(i, (key, address))| {
                let key = PrivateKey::from_hex(key).map_err(|_| {
                    ConfigError::Message(format!("forging.delegated_keys[{i}] is not a valid key"))
                })?;
                let address = Address::from_hex(address.trim()).map_err(|err| {
                    ConfigError::Message(format!("forging.stake_addresses[{i}]: {err}"))
                })?;
                Ok((key, address))
            })
            .collect()
    }

    #[must_use]
    pub fn chain_config(&self) -> ChainConfig {
        let mut config = ChainConfig::new(&self.node.network_name);
        config.max_reorg_depth = self.node.max_reorg_depth;
        config.max_clock_drift_secs = self.forging.max_clock_drift_secs;
        config
    }

    #[must_use]
    pub fn mempool_config(&self) -> MempoolConfig {
        MempoolConfig {
            max_block_size: self.mempool.max_block_size,
            max_tx_size: self.mempool.max_tx_size,
            min_fee_per_byte: self.mempool.min_fee_per_byte,
            // Checked by `validate`
            asset_fees_per_byte: self.asset_fees_per_byte().unwrap_or_default(),
            tx_ttl_secs: self.mempool.tx_ttl_secs,
            prune_interval_secs: self.mempool.prune_interval_secs,
        }
    }

    /// `None` if forging is disabled.
    #[cfg(feature = "forging")]
    #[must_use]
    pub fn forging_config(&self) -> Option<ForgingConfig> {
        if !self.forging.enabled {
            return None;
        }

        Some(ForgingConfig {
            threads: self.forging.threads as usize,
            max_clock_drift_secs: self.forging.max_clock_drift_secs,
        })
    }

    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            chain: self.chain_config(),
            mempool: self.mempool_config(),
            #[cfg(feature = "forging")]
            forging: self.forging_config(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FieldNamesAsArray)]
pub struct Node {
    /// The network name the node is running on.
    #[serde(alias = "networkname")]
    pub network_name: String,

    /// Blocks deeper than this can no longer be rewound.
    #[serde(alias = "maxreorgdepth")]
    pub max_reorg_depth: u64,

    /// Number of transaction verification threads.
    ///
    /// Default is 0 which means the number of cores of the system
    #[serde(alias = "verifierthreads")]
    pub verifier_threads: u64,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            network_name: "testnet".to_owned(), // Use testnet as default for now
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            verifier_threads: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FieldNamesAsArray)]
pub struct Mempool {
    /// Maximum size in bytes of the candidate block body.
    #[serde(alias = "maxblocksize")]
    pub max_block_size: u64,

    /// Maximum size in bytes of a single transaction.
    #[serde(alias = "maxtxsize")]
    pub max_tx_size: u64,

    /// Minimum native fee per byte accepted from peers.
    #[serde(alias = "minfeeperbyte")]
    pub min_fee_per_byte: u64,

    /// Other accepted fee assets, as `<asset hex>:<min fee per byte>`.
    #[serde(alias = "assetfeesperbyte")]
    pub asset_fees_per_byte: Vec<String>,

    /// Seconds after which a pending transaction is evicted.
    #[serde(alias = "txttlsecs")]
    pub tx_ttl_secs: u64,

    /// Seconds between two eviction passes.
    #[serde(alias = "pruneintervalsecs")]
    pub prune_interval_secs: u64,
}

impl Default for Mempool {
    fn default() -> Self {
        let config = MempoolConfig::default();

        Self {
            max_block_size: config.max_block_size,
            max_tx_size: config.max_tx_size,
            min_fee_per_byte: config.min_fee_per_byte,
            asset_fees_per_byte: vec![],
            tx_ttl_secs: config.tx_ttl_secs,
            prune_interval_secs: config.prune_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FieldNamesAsArray)]
pub struct Forging {
    /// Enable forging.
    pub enabled: bool,

    /// Number of forging threads
    ///
    /// Default is 0 which means the number of cores of the system
    pub threads: u64,

    /// Blocks are forged and accepted up to this many seconds in the future.
    #[serde(alias = "maxclockdriftsecs")]
    pub max_clock_drift_secs: u64,

    /// Hex encoded delegated private keys.
    #[serde(alias = "delegatedkeys")]
    pub delegated_keys: Vec<String>,

    /// Hex encoded stake addresses, one per delegated key.
    #[serde(alias = "stakeaddresses")]
    pub stake_addresses: Vec<String>,
}

impl Default for Forging {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: 0,
            max_clock_drift_secs: BLOCK_TIMESTAMP_MAX,
            delegated_keys: vec![],
            stake_addresses: vec![],
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    let mut config_path = dirs::config_dir()?;
    config_path.push("Stakenode");
    config_path.push("config.toml");
    Some(config_path)
}

fn write_default_config(config_path: &Path) {
    let settings_str = match toml::ser::to_string_pretty(&Settings::default()) {
        Ok(settings_str) => settings_str,
        Err(err) => {
            error!("Failed to serialize default configuration! Reason: {:#?}", err);
            return;
        }
    };

    if let Some(parent) = config_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    // Create configuration file
    match FsFile::create(config_path) {
        Ok(mut file) => {
            file.write_all(settings_str.as_bytes()).unwrap_or(());
        }
        Err(err) => {
            // If this fails, do nothing and fall back to envionment variables
            error!("Failed to create configuration! Reason: {:#?}", err);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DynamicConfVal {
    String(String),
    Sequence(Vec<String>),
    Bool(bool),
    U64(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn env(vars: &[(&str, &str)]) -> Vec<(String, String)> {
        vars.iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let settings = Settings::load(None, vec![]).unwrap();
        assert_eq!(settings.node.network_name, "testnet");
        assert_eq!(settings.node.max_reorg_depth, DEFAULT_MAX_REORG_DEPTH);
        assert_eq!(settings.mempool.max_block_size, MAX_BYTES_PER_BLOCK);
        assert_eq!(settings.mempool.tx_ttl_secs, DEFAULT_MEMPOOL_TX_TTL_SECS);
        assert!(!settings.forging.enabled);
        assert!(settings.forging.delegated_keys.is_empty());
    }

    #[test]
    fn env_overrides() {
        let settings = Settings::load(
            None,
            env(&[
                ("STAKENODE_NODE_NETWORKNAME", "mainnet"),
                ("STAKENODE_MEMPOOL_TXTTLSECS", "60"),
                ("STAKENODE_FORGING_ENABLED", "true"),
                ("STAKENODE_FORGING_THREADS", "3"),
                ("STAKENODE_MEMPOOL_MINFEEPERBYTE", ""),
                ("UNRELATED", "1"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.node.network_name, "mainnet");
        assert_eq!(settings.mempool.tx_ttl_secs, 60);
        assert_eq!(settings.mempool.min_fee_per_byte, NATIVE_FEE_PER_BYTE);
        assert!(settings.forging.enabled);
        assert_eq!(settings.forging.threads, 3);
        assert_eq!(settings.chain_config().network_name(), "mainnet");
        assert_eq!(settings.mempool_config().tx_ttl_secs, 60);

        #[cfg(feature = "forging")]
        assert_eq!(settings.forging_config().unwrap().threads, 3);
    }

    #[test]
    fn delegated_keys_from_env() {
        let keys = [PrivateKey::random(), PrivateKey::random()];
        let addresses = [Address::random(), Address::random()];
        let key_list = keys
            .iter()
            .map(PrivateKey::to_hex)
            .collect::<Vec<_>>()
            .join(",");
        let address_list = addresses
            .iter()
            .map(Address::to_hex)
            .collect::<Vec<_>>()
            .join(", ");

        let settings = Settings::load(
            None,
            env(&[
                ("STAKENODE_FORGING_DELEGATEDKEYS", &key_list),
                ("STAKENODE_FORGING_STAKEADDRESSES", &address_list),
            ]),
        )
        .unwrap();

        let wallets = settings.delegated_wallets().unwrap();
        assert_eq!(wallets.len(), 2);
        assert_eq!(wallets[0].0.public_key(), keys[0].public_key());
        assert_eq!(wallets[1].1, addresses[1]);
    }

    #[test]
    fn asset_fee_rates_from_env() {
        let asset = Asset([7; 20]);
        let entry = format!("{}:25", hex::encode(asset.0));
        let settings = Settings::load(
            None,
            env(&[("STAKENODE_MEMPOOL_ASSETFEESPERBYTE", &entry)]),
        )
        .unwrap();

        let config = settings.mempool_config();
        assert_eq!(config.asset_fees_per_byte.get(&asset), Some(&25));
        assert_eq!(config.fee_rates().next(), Some((Asset::NATIVE, NATIVE_FEE_PER_BYTE)));

        let malformed = Settings::load(
            None,
            env(&[("STAKENODE_MEMPOOL_ASSETFEESPERBYTE", "0707:x")]),
        );
        assert!(malformed.is_err());
    }

    #[test]
    fn rejects_unusable_settings() {
        let unpaired = Settings::load(
            None,
            env(&[("STAKENODE_FORGING_DELEGATEDKEYS", "00")]),
        );
        assert!(unpaired.is_err());

        let oversized = Settings::load(
            None,
            env(&[("STAKENODE_MEMPOOL_MAXTXSIZE", "1000000000")]),
        );
        assert!(oversized.is_err());

        let mut settings = Settings::default();
        settings.forging.delegated_keys = vec!["zz".to_owned()];
        settings.forging.stake_addresses = vec![Address::zero().to_hex()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn reads_config_file() {
        let dir = std::env::temp_dir()
            .join(format!("stakenode-settings-{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let mut settings = Settings::default();
        settings.node.max_reorg_depth = 7;
        settings.mempool.prune_interval_secs = 5;
        std::fs::write(&path, toml::ser::to_string_pretty(&settings).unwrap()).unwrap();

        let loaded = Settings::load(
            Some(&path),
            env(&[("STAKENODE_MEMPOOL_PRUNEINTERVALSECS", "9")]),
        )
        .unwrap();
        assert_eq!(loaded.node.max_reorg_depth, 7);
        assert_eq!(loaded.mempool.prune_interval_secs, 9);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    #[serial]
    fn process_env_is_picked_up() {
        std::env::set_var("STAKENODE_NODE_MAXREORGDEPTH", "12");
        let settings = Settings::load(None, std::env::vars()).unwrap();
        std::env::remove_var("STAKENODE_NODE_MAXREORGDEPTH");

        assert_eq!(settings.node.max_reorg_depth, 12);
        assert_eq!(settings.node_config().chain.max_reorg_depth, 12);
    }
}
