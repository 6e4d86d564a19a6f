//! Observational counters for the admission pipeline.
//!
//! Plain atomics shared by the processor and request queue. Nothing reads
//! them on the hot path; operators pull a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use braid_core::error::RejectReason;

/// Pipeline counters. All updates use relaxed ordering.
#[derive(Debug, Default)]
pub struct GossipMetrics {
    pub messages_received: AtomicU64,
    pub accepted: AtomicU64,
    pub rejected_malformed: AtomicU64,
    pub rejected_network: AtomicU64,
    pub rejected_score: AtomicU64,
    pub rejected_stale: AtomicU64,
    pub storage_failures: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    /// Inbound messages dropped because the worker channel was full.
    pub inbound_dropped: AtomicU64,
    pub requests_issued: AtomicU64,
    pub requests_retried: AtomicU64,
    /// Ancestor requests abandoned after exhausting their retries.
    pub requests_dropped: AtomicU64,
    /// Messages served to peers that requested them.
    pub requests_served: AtomicU64,
    /// Current number of pending ancestor requests.
    pub queue_depth: AtomicU64,
}

/// Point-in-time copy of [`GossipMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub accepted: u64,
    pub rejected_malformed: u64,
    pub rejected_network: u64,
    pub rejected_score: u64,
    pub rejected_stale: u64,
    pub storage_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub inbound_dropped: u64,
    pub requests_issued: u64,
    pub requests_retried: u64,
    pub requests_dropped: u64,
    pub requests_served: u64,
    pub queue_depth: u64,
}

impl MetricsSnapshot {
    /// Sum of every rejection counter.
    pub fn rejected(&self) -> u64 {
        self.rejected_malformed
            + self.rejected_network
            + self.rejected_score
            + self.rejected_stale
            + self.storage_failures
    }
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl GossipMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a terminal rejection under its reason.
    pub fn record_rejection(&self, reason: &RejectReason) {
        let counter = match reason {
            RejectReason::Malformed(_) => &self.rejected_malformed,
            RejectReason::WrongNetwork { .. } => &self.rejected_network,
            RejectReason::InsufficientScore { .. } => &self.rejected_score,
            RejectReason::Stale { .. } => &self.rejected_stale,
            RejectReason::StorageWrite(_) | RejectReason::Abandoned => &self.storage_failures,
        };
        incr(counter);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_received: load(&self.messages_received),
            accepted: load(&self.accepted),
            rejected_malformed: load(&self.rejected_malformed),
            rejected_network: load(&self.rejected_network),
            rejected_score: load(&self.rejected_score),
            rejected_stale: load(&self.rejected_stale),
            storage_failures: load(&self.storage_failures),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            inbound_dropped: load(&self.inbound_dropped),
            requests_issued: load(&self.requests_issued),
            requests_retried: load(&self.requests_retried),
            requests_dropped: load(&self.requests_dropped),
            requests_served: load(&self.requests_served),
            queue_depth: load(&self.queue_depth),
        }
    }
}
