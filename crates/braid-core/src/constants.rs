//! Protocol constants shared by every Braid crate.

/// Minimum number of parents a message must reference.
pub const MIN_PARENTS: usize = 1;

/// Maximum number of parents a message may reference.
pub const MAX_PARENTS: usize = 8;

/// Maximum serialized message size in bytes (32 KiB).
///
/// Checked before decoding so oversized input never reaches the parser.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// Size of the trailing nonce in the serialized layout.
pub const NONCE_SIZE: usize = 8;

/// Maximum number of peer hints remembered per pending request.
pub const MAX_PEER_HINTS: usize = 8;

/// Default minimum anti-spam score for acceptance.
pub const DEFAULT_MIN_SCORE: f64 = 4000.0;

/// Default staleness window, in confirmation indexes.
pub const DEFAULT_STALENESS_WINDOW: u32 = 15;

/// Network name used when none is configured.
pub const DEFAULT_NETWORK_NAME: &str = "braid-mainnet";

/// Network name of the public test network.
pub const TESTNET_NETWORK_NAME: &str = "braid-testnet";
