//! Node configuration for the Braid gossip node.
//!
//! Provides [`NodeConfig`] with defaults for the data directory, logging, and
//! the admission pipeline. [`NodeConfig::load`] layers defaults, an optional
//! TOML file, and `BRAID_*` environment variables (nested fields use `__`,
//! e.g. `BRAID_GOSSIP__MIN_SCORE`).

use std::path::{Path, PathBuf};

use braid_core::constants::{DEFAULT_NETWORK_NAME, TESTNET_NETWORK_NAME};
use braid_core::error::BraidError;
use braid_core::types::NetworkId;
use braid_gossip::GossipConfig;
use serde::Deserialize;

/// Prefix of the environment variables read by [`NodeConfig::load`].
pub const ENV_PREFIX: &str = "BRAID";

/// Configuration for a node instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Human-readable network name; the network id is derived from it.
    pub network_name: String,
    /// Log level filter string (e.g. "info", "debug", "braid_gossip=trace").
    pub log_level: String,
    /// Capacity of the inbound peer event channel.
    pub peer_event_buffer: usize,
    /// Admission pipeline configuration.
    pub gossip: GossipConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("braid");

        Self {
            data_dir,
            network_name: DEFAULT_NETWORK_NAME.to_string(),
            log_level: "info".to_string(),
            peer_event_buffer: 1_024,
            gossip: GossipConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Mainnet defaults.
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Testnet defaults: separate network and data directory, lower score.
    pub fn testnet() -> Self {
        let base = Self::default();
        Self {
            data_dir: base.data_dir.join("testnet"),
            network_name: TESTNET_NETWORK_NAME.to_string(),
            gossip: GossipConfig::testnet(),
            ..base
        }
    }

    /// Load configuration: defaults, then `path` if given, then the environment.
    ///
    /// The network id is re-derived from `network_name`, so a file or
    /// environment only needs to set the name.
    pub fn load(path: Option<&Path>) -> Result<Self, BraidError> {
        Self::load_over(&Self::mainnet(), path)
    }

    /// Like [`Self::load`], starting from the testnet preset.
    pub fn load_testnet(path: Option<&Path>) -> Result<Self, BraidError> {
        Self::load_over(&Self::testnet(), path)
    }

    /// Layer `path` and the environment over `preset`.
    ///
    /// Only the keys in which the presets differ are seeded; everything else
    /// falls back to [`Default`].
    fn load_over(preset: &Self, path: Option<&Path>) -> Result<Self, BraidError> {
        let config_err = |e: config::ConfigError| BraidError::Config(e.to_string());
        let mut builder = config::Config::builder()
            .set_default("data_dir", preset.data_dir.to_string_lossy().into_owned())
            .map_err(config_err)?
            .set_default("network_name", preset.network_name.clone())
            .map_err(config_err)?
            .set_default("gossip.min_score", preset.gossip.min_score)
            .map_err(config_err)?;
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_err)?;
        cfg.apply_network_name();
        Ok(cfg)
    }

    /// Switch to `name`, updating the derived network id.
    pub fn set_network(&mut self, name: impl Into<String>) {
        self.network_name = name.into();
        self.apply_network_name();
    }

    /// The network id derived from [`Self::network_name`].
    pub fn network_id(&self) -> NetworkId {
        NetworkId::from_name(&self.network_name)
    }

    /// Path to the RocksDB message database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("messages")
    }

    fn apply_network_name(&mut self) {
        self.gossip.network_id = self.network_id();
    }
}
