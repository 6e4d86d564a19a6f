//! Stateless admission checks applied to a parsed message.
//!
//! The chain runs in a fixed order and stops at the first failure:
//!
//! 1. network identity
//! 2. anti-spam score
//! 3. staleness against the confirmed reference point
//!
//! All three are terminal: a rejected message is never stored. Parent
//! solidity is not checked here; it never rejects a message.

use braid_core::error::{BraidError, RejectReason};
use braid_core::pow;
use braid_core::traits::MessageStore;
use braid_core::types::{Message, NetworkId};

use crate::config::GossipConfig;

/// The admission checks, parameterised by the network identity parameters.
#[derive(Debug, Clone)]
pub struct ValidatorChain {
    network_id: NetworkId,
    min_score: f64,
    staleness_window: u32,
}

impl ValidatorChain {
    pub fn new(network_id: NetworkId, min_score: f64, staleness_window: u32) -> Self {
        Self {
            network_id,
            min_score,
            staleness_window,
        }
    }

    pub fn from_config(config: &GossipConfig) -> Self {
        Self::new(config.network_id, config.min_score, config.staleness_window)
    }

    /// Run every check in order.
    ///
    /// The outer `Result` carries storage read failures from the staleness
    /// check; the inner one is the verdict.
    pub fn validate(
        &self,
        message: &Message,
        store: &dyn MessageStore,
    ) -> Result<Result<(), RejectReason>, BraidError> {
        if let Err(reason) = self.check_network(message) {
            return Ok(Err(reason));
        }
        if let Err(reason) = self.check_score(message) {
            return Ok(Err(reason));
        }
        self.check_staleness(message, store)
    }

    pub fn check_network(&self, message: &Message) -> Result<(), RejectReason> {
        if message.network_id() != self.network_id {
            return Err(RejectReason::WrongNetwork {
                expected: self.network_id,
                got: message.network_id(),
            });
        }
        Ok(())
    }

    /// Recompute the score from the current bytes and compare to the minimum.
    pub fn check_score(&self, message: &Message) -> Result<(), RejectReason> {
        let score = pow::score(message.bytes());
        if score < self.min_score {
            return Err(RejectReason::InsufficientScore {
                score,
                min: self.min_score,
            });
        }
        Ok(())
    }

    /// Reject if any known parent's root lies beyond the staleness window.
    ///
    /// Parents absent from storage are skipped; their depth is unknown until
    /// they arrive.
    pub fn check_staleness(
        &self,
        message: &Message,
        store: &dyn MessageStore,
    ) -> Result<Result<(), RejectReason>, BraidError> {
        let confirmed = store.confirmed_index()?;
        for parent in message.parents() {
            let Some(root) = store.root_index(parent)? else {
                continue;
            };
            let distance = confirmed.saturating_sub(root);
            if distance > self.staleness_window {
                return Ok(Err(RejectReason::Stale {
                    distance,
                    window: self.staleness_window,
                }));
            }
        }
        Ok(Ok(()))
    }
}
