//! # braid-core
//! Foundation types and traits for the Braid gossip admission pipeline.

pub mod constants;
pub mod error;
pub mod pow;
pub mod storage;
pub mod traits;
pub mod types;

pub use libp2p::PeerId;
