//! Error types for the Braid admission pipeline.
use thiserror::Error;

use crate::types::{MessageId, NetworkId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message has no parents")] NoParents,
    #[error("too many parents: {count} > {max}")] TooManyParents { count: usize, max: usize },
    #[error("parents are not sorted and unique")] ParentsNotSorted,
    #[error("oversized: {size} > {max}")] TooLarge { size: usize, max: usize },
    #[error("malformed message: {0}")] Malformed(String),
    #[error("{0} trailing bytes after message")] TrailingBytes(usize),
}

/// Terminal verdict for a message's content. Never retried automatically.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error(transparent)] Malformed(#[from] MessageError),
    #[error("wrong network: expected {expected}, got {got}")] WrongNetwork { expected: NetworkId, got: NetworkId },
    #[error("insufficient score: {score:.2} < {min:.2}")] InsufficientScore { score: f64, min: f64 },
    #[error("stale: {distance} indexes behind, window {window}")] Stale { distance: u32, window: u32 },
    #[error("storage write failed: {0}")] StorageWrite(String),
    #[error("work unit dropped before resolution")] Abandoned,
}

impl RejectReason {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::WrongNetwork { .. } => "wrong_network",
            Self::InsufficientScore { .. } => "insufficient_score",
            Self::Stale { .. } => "stale",
            Self::StorageWrite(_) => "storage_write",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Result of a synchronous submission through the processor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error(transparent)] Rejected(#[from] RejectReason),
    #[error("{} parents missing or unsolid", parents.len())] Unsolid { parents: Vec<MessageId> },
    #[error("storage: {0}")] Storage(String),
    #[error("processor is shutting down")] ShuttingDown,
}

#[derive(Error, Debug)]
pub enum BraidError {
    #[error(transparent)] Message(#[from] MessageError),
    #[error(transparent)] Process(#[from] ProcessError),
    #[error("storage: {0}")] Storage(String),
    #[error("config: {0}")] Config(String),
}
