//! Configuration for the gossip admission pipeline.
//!
//! Read once at startup and immutable afterwards. Durations are stored as
//! milliseconds so the struct deserializes cleanly from config files.

use std::time::Duration;

use braid_core::constants::{
    DEFAULT_MIN_SCORE, DEFAULT_NETWORK_NAME, DEFAULT_STALENESS_WINDOW, TESTNET_NETWORK_NAME,
};
use braid_core::types::NetworkId;
use serde::Deserialize;

/// Configuration for the message processor, work unit cache, and request queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Network identifier every accepted message must declare.
    pub network_id: NetworkId,
    /// Minimum anti-spam score for acceptance.
    pub min_score: f64,
    /// Maximum distance behind the confirmed reference point.
    pub staleness_window: u32,
    /// Maximum number of resolved work units kept for short-circuiting.
    pub cache_capacity: usize,
    /// How long a resolved work unit is kept, in milliseconds.
    pub cache_ttl_ms: u64,
    /// Attempts after the first request before a pending request is dropped.
    pub max_retries: u32,
    /// Maximum simultaneously outstanding peer requests.
    pub max_in_flight: usize,
    /// How long to wait for a requested message, in milliseconds.
    pub request_timeout_ms: u64,
    /// Interval of the request queue's retry scan, in milliseconds.
    pub tick_interval_ms: u64,
    /// Number of inbound worker tasks.
    pub workers: usize,
    /// Capacity of the inbound channel feeding the workers.
    pub inbound_queue_size: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            network_id: NetworkId::from_name(DEFAULT_NETWORK_NAME),
            min_score: DEFAULT_MIN_SCORE,
            staleness_window: DEFAULT_STALENESS_WINDOW,
            cache_capacity: 10_000,
            cache_ttl_ms: 60_000,
            max_retries: 5,
            max_in_flight: 64,
            request_timeout_ms: 5_000,
            tick_interval_ms: 500,
            workers: 4,
            inbound_queue_size: 10_000,
        }
    }
}

impl GossipConfig {
    /// Configuration preset for the public test network.
    pub fn testnet() -> Self {
        Self {
            network_id: NetworkId::from_name(TESTNET_NETWORK_NAME),
            min_score: 1_000.0,
            ..Self::default()
        }
    }

    /// Configuration preset for mainnet.
    pub fn mainnet() -> Self {
        Self::default()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
