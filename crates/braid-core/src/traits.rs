//! Trait interfaces between the admission pipeline and its collaborators.
//!
//! - [`MessageStore`] — DAG storage (braid-node implements with RocksDB,
//!   [`MemoryMessageStore`](crate::storage::MemoryMessageStore) in memory)
//! - [`PeerRequester`] — outbound message requests (the peer layer implements)

use libp2p::PeerId;

use crate::error::BraidError;
use crate::types::{Message, MessageId};

/// Narrow view of the message DAG storage.
///
/// All methods take `&self`: implementations synchronise internally so the
/// processor's workers can share one store. Writes are idempotent per
/// identity.
pub trait MessageStore: Send + Sync {
    /// Whether the identity is known: a stored message or a solid entry point.
    fn contains(&self, id: &MessageId) -> Result<bool, BraidError>;

    /// Get a stored message. Returns `None` if unknown or a solid entry point.
    fn get(&self, id: &MessageId) -> Result<Option<Message>, BraidError>;

    /// Persist a validated message.
    ///
    /// Returns `true` if the message was newly written, `false` if it was
    /// already present (no write happens). Computes the message's solidity
    /// from its parents and propagates solidity to stored descendants.
    fn put(&self, message: &Message) -> Result<bool, BraidError>;

    /// Whether the identity is solid: its full ancestry is present and solid.
    fn is_solid(&self, id: &MessageId) -> Result<bool, BraidError>;

    /// The most recent confirmed reference point.
    fn confirmed_index(&self) -> Result<u32, BraidError>;

    /// Confirmation index of the oldest confirmed root the identity references.
    ///
    /// Returns `None` if the identity is unknown.
    fn root_index(&self, id: &MessageId) -> Result<Option<u32>, BraidError>;
}

/// Outbound request channel to the peer layer.
///
/// Fire-and-forget: the peer layer answers by delivering the message through
/// the normal inbound path, or stays silent and lets the request time out.
pub trait PeerRequester: Send + Sync {
    /// Ask peers (preferring `peers`, which may be empty) for a message.
    fn request_message(&self, id: MessageId, peers: &[PeerId]);
}
