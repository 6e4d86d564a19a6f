//! # braid-node — Gossip node: RocksDB storage and orchestration.
//!
//! Composes the Braid admission pipeline into a running node:
//! - [`storage::RocksStore`] — persistent message storage backed by RocksDB
//! - [`node::Node`] — event loop wiring storage, the request queue, the
//!   message processor, and the peer layer channels
//! - [`config::NodeConfig`] — node configuration

pub mod config;
pub mod node;
pub mod storage;

pub use config::NodeConfig;
pub use node::{ChannelRequester, Node, PeerCommand, PeerEvent, PeerHandle};
pub use storage::RocksStore;
