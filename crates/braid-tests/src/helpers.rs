//! Shared test helpers for integration and adversarial tests.

use std::sync::Arc;

use braid_core::pow;
use braid_core::storage::MemoryMessageStore;
use braid_core::types::{Message, MessageId, NetworkId};
use braid_gossip::{GossipConfig, GossipMetrics, MessageProcessor, RequestQueue};

/// Low score target so tests mine in milliseconds.
pub const TEST_MIN_SCORE: f64 = 100.0;

/// Staleness window used by the test pipelines.
pub const TEST_WINDOW: u32 = 15;

/// Network every test pipeline accepts.
pub fn test_network() -> NetworkId {
    NetworkId::from_name("braid-test")
}

/// Gossip configuration for the test network.
pub fn gossip_config() -> GossipConfig {
    GossipConfig {
        network_id: test_network(),
        min_score: TEST_MIN_SCORE,
        staleness_window: TEST_WINDOW,
        request_timeout_ms: 200,
        tick_interval_ms: 10,
        ..GossipConfig::default()
    }
}

/// A processor over in-memory storage, with handles to its collaborators.
pub struct Pipeline {
    pub processor: Arc<MessageProcessor>,
    pub store: Arc<MemoryMessageStore>,
    pub queue: Arc<RequestQueue>,
    pub metrics: Arc<GossipMetrics>,
}

impl Pipeline {
    pub fn new(config: GossipConfig) -> Self {
        let store = Arc::new(MemoryMessageStore::new());
        let metrics = Arc::new(GossipMetrics::new());
        let queue = Arc::new(RequestQueue::new(&config, store.clone(), metrics.clone()));
        let processor = MessageProcessor::new(config, store.clone(), queue.clone(), metrics.clone());
        Self {
            processor,
            store,
            queue,
            metrics,
        }
    }
}

/// Pipeline with [`gossip_config`].
pub fn pipeline() -> Pipeline {
    Pipeline::new(gossip_config())
}

/// Build a message and mine it to [`TEST_MIN_SCORE`].
pub fn mined(network: NetworkId, parents: Vec<MessageId>, payload: &[u8]) -> Message {
    let draft = Message::new(network, parents, payload.to_vec(), 0).unwrap();
    pow::mine(&draft, TEST_MIN_SCORE, u64::MAX).unwrap()
}

/// The same message with the first nonce at or after `start` scoring below
/// [`TEST_MIN_SCORE`].
pub fn unmined(message: &Message, start: u64) -> Message {
    (start..)
        .map(|nonce| message.with_nonce(nonce))
        .find(|m| pow::score(m.bytes()) < TEST_MIN_SCORE)
        .unwrap()
}

/// Deterministic identity from a seed byte.
pub fn id(seed: u8) -> MessageId {
    MessageId([seed; 32])
}
