//! Anti-spam score ("proof of work") over serialized message bytes.
//!
//! # Score semantics
//!
//! The score is a pure function of the serialized bytes:
//!
//! 1. `prefix = BLAKE3(bytes[..len - 8])` (everything but the nonce)
//! 2. `digest = BLAKE3(prefix ‖ nonce_le)`
//! 3. `z` = number of leading zero bits of `digest`
//! 4. `score = 2^z / len`
//!
//! Each additional required zero bit doubles the expected work, and the
//! score is strictly increasing in `z`. Dividing by the length makes larger
//! messages pay proportionally more. Nothing is cached between calls, so a
//! changed nonce is always re-scored from scratch.

use crate::constants::NONCE_SIZE;
use crate::types::Message;

/// Hash of everything before the nonce.
fn prefix_digest(bytes: &[u8]) -> [u8; 32] {
    blake3::hash(&bytes[..bytes.len() - NONCE_SIZE]).into()
}

/// Leading zero bits of `BLAKE3(prefix ‖ nonce_le)`.
fn zero_bits(prefix: &[u8; 32], nonce: u64) -> u32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(prefix);
    hasher.update(&nonce.to_le_bytes());
    let digest = hasher.finalize();

    let mut zeros = 0;
    for byte in digest.as_bytes() {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}

fn score_from_bits(zeros: u32, len: usize) -> f64 {
    2f64.powi(zeros as i32) / len as f64
}

/// Anti-spam score of serialized message bytes.
///
/// Returns `0.0` for input too short to carry a nonce.
pub fn score(bytes: &[u8]) -> f64 {
    if bytes.len() <= NONCE_SIZE {
        return 0.0;
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&bytes[bytes.len() - NONCE_SIZE..]);
    let zeros = zero_bits(&prefix_digest(bytes), u64::from_le_bytes(nonce));
    score_from_bits(zeros, bytes.len())
}

/// Number of leading zero bits required to reach `min_score` for a message of `len` bytes.
pub fn required_zero_bits(min_score: f64, len: usize) -> u32 {
    let needed = (min_score * len as f64).max(1.0);
    needed.log2().ceil() as u32
}

/// Search for a nonce giving `message` a score of at least `min_score`.
///
/// Tries nonces `0..=max_nonce` and returns the re-encoded message on
/// success, `None` if no nonce in range qualifies.
pub fn mine(message: &Message, min_score: f64, max_nonce: u64) -> Option<Message> {
    let prefix = prefix_digest(message.bytes());
    let len = message.len();
    (0..=max_nonce)
        .find(|nonce| score_from_bits(zero_bits(&prefix, *nonce), len) >= min_score)
        .map(|nonce| message.with_nonce(nonce))
}
