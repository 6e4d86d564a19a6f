//! Ancestor request queue.
//!
//! Tracks identities referenced as parents but not yet stored, and makes
//! sure each one is requested from peers at most once at a time.
//!
//! An entry is either *queued* (waiting in insertion order for an in-flight
//! slot) or *in flight* (requested, with a deadline). When the deadline
//! passes, [`RequestQueue::tick`] moves the entry to the back of the queue
//! for another attempt, or drops it once `max_retries` attempts have timed
//! out. [`RequestQueue::mark_received`] removes the entry whatever its state.
//!
//! Both the ready deque and the deadline heap are invalidated lazily: every
//! state change stamps the entry with a fresh generation, and positions
//! carrying an old generation are skipped when popped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use braid_core::constants::MAX_PEER_HINTS;
use braid_core::error::BraidError;
use braid_core::traits::{MessageStore, PeerRequester};
use braid_core::types::MessageId;
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::GossipConfig;
use crate::metrics::{GossipMetrics, incr};

/// An identity known as someone's parent but absent locally.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: MessageId,
    /// Peers likely to have the message, in the order they were learned.
    pub peers: Vec<PeerId>,
    pub enqueued_at: Instant,
    /// Attempts that timed out so far.
    pub retries: u32,
    in_flight: bool,
    generation: u64,
}

impl PendingRequest {
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    fn add_hint(&mut self, peer: PeerId) {
        if self.peers.len() < MAX_PEER_HINTS && !self.peers.contains(&peer) {
            self.peers.push(peer);
        }
    }
}

/// Result of one retry scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    /// Entries moved back to the queue for another attempt.
    pub retried: Vec<MessageId>,
    /// Entries abandoned after exhausting their retries.
    pub dropped: Vec<MessageId>,
}

#[derive(Default)]
struct QueueInner {
    entries: HashMap<MessageId, PendingRequest>,
    ready: VecDeque<(MessageId, u64)>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, MessageId)>>,
    in_flight: usize,
    next_generation: u64,
}

impl QueueInner {
    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Deduplicating, bounded-retry queue of ancestor requests.
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    store: Arc<dyn MessageStore>,
    metrics: Arc<GossipMetrics>,
    notify: Notify,
    max_retries: u32,
    max_in_flight: usize,
    request_timeout: Duration,
    tick_interval: Duration,
}

impl RequestQueue {
    pub fn new(
        config: &GossipConfig,
        store: Arc<dyn MessageStore>,
        metrics: Arc<GossipMetrics>,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            store,
            metrics,
            notify: Notify::new(),
            max_retries: config.max_retries,
            max_in_flight: config.max_in_flight,
            request_timeout: config.request_timeout(),
            tick_interval: config.tick_interval(),
        }
    }

    /// Queue `id` for a peer request.
    ///
    /// Returns `true` if a new entry was created. Identities already in
    /// storage are ignored; identities already queued only gain `hint` as an
    /// extra candidate peer.
    pub fn enqueue(&self, id: MessageId, hint: Option<PeerId>) -> Result<bool, BraidError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&id) {
            if let Some(peer) = hint {
                entry.add_hint(peer);
            }
            return Ok(false);
        }
        // Checked under the lock: a message stored before this point is
        // seen here, one stored after it closes the entry via `mark_received`.
        if self.store.contains(&id)? {
            return Ok(false);
        }

        let generation = inner.bump();
        let mut entry = PendingRequest {
            id,
            peers: Vec::new(),
            enqueued_at: Instant::now(),
            retries: 0,
            in_flight: false,
            generation,
        };
        if let Some(peer) = hint {
            entry.add_hint(peer);
        }
        inner.entries.insert(id, entry);
        inner.ready.push_back((id, generation));
        self.metrics.set_queue_depth(inner.entries.len());
        drop(inner);

        debug!(%id, "request_queue: enqueued");
        self.notify.notify_one();
        Ok(true)
    }

    /// Take the next queued identity and mark it in flight.
    ///
    /// Entries whose message is already stored are closed instead of issued.
    /// Returns `None` when nothing is queued or `max_in_flight` requests are
    /// already outstanding.
    pub fn next(&self) -> Option<(MessageId, Vec<PeerId>)> {
        let mut inner = self.inner.lock();
        while inner.in_flight < self.max_in_flight {
            let (id, generation) = inner.ready.pop_front()?;
            let live = inner
                .entries
                .get(&id)
                .is_some_and(|e| e.generation == generation && !e.in_flight);
            if !live {
                continue;
            }
            match self.store.contains(&id) {
                Ok(true) => {
                    inner.entries.remove(&id);
                    self.metrics.set_queue_depth(inner.entries.len());
                    debug!(%id, "request_queue: already stored, closing");
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(%id, "request_queue: storage lookup failed: {e}"),
            }

            let fresh = inner.bump();
            let deadline = Instant::now() + self.request_timeout;
            let Some(entry) = inner.entries.get_mut(&id) else {
                continue;
            };
            entry.in_flight = true;
            entry.generation = fresh;
            let peers = entry.peers.clone();
            let retry = entry.retries > 0;
            inner.deadlines.push(Reverse((deadline, fresh, id)));
            inner.in_flight += 1;

            if retry {
                incr(&self.metrics.requests_retried);
            }
            incr(&self.metrics.requests_issued);
            return Some((id, peers));
        }
        None
    }

    /// Close the request for `id`, if any. Returns `true` if an entry existed.
    pub fn mark_received(&self, id: &MessageId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.remove(id) else {
            return false;
        };
        if entry.in_flight {
            inner.in_flight -= 1;
        }
        self.metrics.set_queue_depth(inner.entries.len());
        drop(inner);

        debug!(%id, retries = entry.retries, "request_queue: received");
        // A slot may have opened up.
        self.notify.notify_one();
        true
    }

    /// Expire in-flight requests whose deadline is at or before `now`.
    pub fn tick(&self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let mut inner = self.inner.lock();

        while let Some(Reverse((deadline, generation, id))) = inner.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            inner.deadlines.pop();

            let live = inner
                .entries
                .get(&id)
                .is_some_and(|e| e.generation == generation && e.in_flight);
            if !live {
                continue;
            }
            inner.in_flight -= 1;

            let exhausted = inner.entries.get(&id).is_some_and(|e| e.retries >= self.max_retries);
            if exhausted {
                inner.entries.remove(&id);
                outcome.dropped.push(id);
                continue;
            }

            let fresh = inner.bump();
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.in_flight = false;
                entry.retries += 1;
                entry.generation = fresh;
            }
            inner.ready.push_back((id, fresh));
            outcome.retried.push(id);
        }

        self.metrics.set_queue_depth(inner.entries.len());
        drop(inner);

        for id in &outcome.dropped {
            warn!(%id, max_retries = self.max_retries, "request_queue: request timed out, dropping");
            incr(&self.metrics.requests_dropped);
        }
        if !outcome.retried.is_empty() {
            debug!(count = outcome.retried.len(), "request_queue: requeued timed out requests");
        }
        outcome
    }

    /// Hand every currently issuable request to `requester`.
    pub fn dispatch(&self, requester: &dyn PeerRequester) -> usize {
        let mut issued = 0;
        while let Some((id, peers)) = self.next() {
            debug!(%id, peers = peers.len(), "request_queue: requesting message");
            requester.request_message(id, &peers);
            issued += 1;
        }
        issued
    }

    /// Requester loop: tick and dispatch on every enqueue, received message,
    /// or `tick_interval`, until `shutdown` flips to `true`.
    pub async fn run(
        self: Arc<Self>,
        requester: Arc<dyn PeerRequester>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            max_in_flight = self.max_in_flight,
            max_retries = self.max_retries,
            "request_queue: requester loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Instant::now());
                }
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
            self.dispatch(requester.as_ref());
        }

        info!("request_queue: requester loop stopped");
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Number of outstanding peer requests.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Snapshot of the entry for `id`.
    pub fn get(&self, id: &MessageId) -> Option<PendingRequest> {
        self.inner.lock().entries.get(id).cloned()
    }
}
