//! Message model: identities, network identifiers, and the immutable [`Message`].
//!
//! A message is stored and gossiped as its serialized bytes. The layout is
//! bincode (standard config, fixed-int encoding) of
//! `(network_id: u64, parents: Vec<MessageId>, payload: Vec<u8>, nonce: u64)`,
//! so the nonce always occupies the final [`NONCE_SIZE`] bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{MAX_MESSAGE_SIZE, MAX_PARENTS, MIN_PARENTS, NONCE_SIZE};
use crate::error::MessageError;

/// Content hash (BLAKE3) of a message's serialized bytes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct MessageId(pub [u8; 32]);

impl MessageId {
    /// The all-zero identity. Always a solid entry point (genesis).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Identity of the given serialized bytes.
    pub fn hash(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).into())
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero identity.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for MessageId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identifier of the network a message was built for.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct NetworkId(pub u64);

impl NetworkId {
    /// Derive a network identifier from a human-readable network name.
    ///
    /// Takes the first 8 bytes (little-endian) of the BLAKE3 hash of the name.
    ///
    /// # Examples
    ///
    /// ```
    /// use braid_core::types::NetworkId;
    /// assert_eq!(NetworkId::from_name("testnet"), NetworkId::from_name("testnet"));
    /// assert_ne!(NetworkId::from_name("testnet"), NetworkId::from_name("mainnet"));
    /// ```
    pub fn from_name(name: &str) -> Self {
        let digest = blake3::hash(name.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_le_bytes(prefix))
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Borrowed view used for encoding; decodes as [`WireMessage`].
#[derive(bincode::Encode)]
struct WireMessageRef<'a> {
    network_id: u64,
    parents: &'a [MessageId],
    payload: &'a [u8],
    nonce: u64,
}

#[derive(bincode::Decode)]
struct WireMessage {
    network_id: u64,
    parents: Vec<MessageId>,
    payload: Vec<u8>,
    nonce: u64,
}

/// Decoding is capped at [`MAX_MESSAGE_SIZE`] so a forged length prefix
/// cannot trigger a large allocation.
fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_fixed_int_encoding()
        .with_limit::<MAX_MESSAGE_SIZE>()
}

fn check_parents(parents: &[MessageId]) -> Result<(), MessageError> {
    if parents.len() < MIN_PARENTS {
        return Err(MessageError::NoParents);
    }
    if parents.len() > MAX_PARENTS {
        return Err(MessageError::TooManyParents { count: parents.len(), max: MAX_PARENTS });
    }
    if parents.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(MessageError::ParentsNotSorted);
    }
    Ok(())
}

/// An immutable, content-addressed gossip message.
///
/// The identity is derived from the serialized bytes at construction and can
/// never drift from them: every "modification" builds a new message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    network_id: NetworkId,
    parents: Vec<MessageId>,
    payload: Vec<u8>,
    nonce: u64,
    bytes: Vec<u8>,
}

impl Message {
    /// Build a message, normalising the parents into ascending unique order.
    pub fn new(
        network_id: NetworkId,
        mut parents: Vec<MessageId>,
        payload: Vec<u8>,
        nonce: u64,
    ) -> Result<Self, MessageError> {
        parents.sort_unstable();
        parents.dedup();
        check_parents(&parents)?;

        let wire = WireMessageRef {
            network_id: network_id.0,
            parents: &parents,
            payload: &payload,
            nonce,
        };
        let bytes = bincode::encode_to_vec(&wire, wire_config())
            .map_err(|e| MessageError::Malformed(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
        }

        Ok(Self {
            id: MessageId::hash(&bytes),
            network_id,
            parents,
            payload,
            nonce,
            bytes,
        })
    }

    /// Parse a message from its serialized bytes.
    ///
    /// Rejects oversized input before decoding, unsorted or duplicate
    /// parents, and trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
        }
        let (wire, read): (WireMessage, usize) = bincode::decode_from_slice(bytes, wire_config())
            .map_err(|e| MessageError::Malformed(e.to_string()))?;
        if read != bytes.len() {
            return Err(MessageError::TrailingBytes(bytes.len() - read));
        }
        check_parents(&wire.parents)?;

        Ok(Self {
            id: MessageId::hash(bytes),
            network_id: NetworkId(wire.network_id),
            parents: wire.parents,
            payload: wire.payload,
            nonce: wire.nonce,
            bytes: bytes.to_vec(),
        })
    }

    /// The same message with a different nonce (and therefore a new identity).
    pub fn with_nonce(&self, nonce: u64) -> Self {
        let mut bytes = self.bytes.clone();
        let start = bytes.len() - NONCE_SIZE;
        bytes[start..].copy_from_slice(&nonce.to_le_bytes());
        Self {
            id: MessageId::hash(&bytes),
            network_id: self.network_id,
            parents: self.parents.clone(),
            payload: self.payload.clone(),
            nonce,
            bytes,
        }
    }

    /// Content hash of the serialized bytes.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Declared network identifier.
    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    /// Parent identities in ascending order.
    pub fn parents(&self) -> &[MessageId] {
        &self.parents
    }

    /// Opaque payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Anti-spam nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Serialized bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Serialized size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`: a serialized message carries at least its header.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
