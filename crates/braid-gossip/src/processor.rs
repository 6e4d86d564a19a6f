//! Message processor: the entry point of the admission pipeline.
//!
//! Two ways in:
//!
//! - [`MessageProcessor::process_inbound`] for network traffic. Fire and
//!   forget: the bytes go onto a bounded channel drained by a pool of worker
//!   tasks, and outcomes are only visible through events and metrics.
//! - [`MessageProcessor::emit`] for locally built messages. The caller
//!   awaits the verdict, even when a concurrent inbound delivery of the same
//!   bytes is the one doing the work.
//!
//! Both funnel into the same pipeline: work unit cache, validator chain,
//! storage, then ancestor requests for every parent not yet stored.

use std::sync::Arc;

use braid_core::error::{BraidError, MessageError, ProcessError, RejectReason};
use braid_core::traits::MessageStore;
use braid_core::types::{Message, MessageId};
use libp2p::PeerId;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::GossipConfig;
use crate::metrics::{GossipMetrics, incr};
use crate::request_queue::RequestQueue;
use crate::validation::ValidatorChain;
use crate::work_unit::{Verdict, WorkUnitCache};

/// Capacity of the processor event broadcast channel.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Outcome notifications for freshly processed messages.
///
/// Emitted once per work unit, by whoever computed it; cache hits do not
/// produce events.
#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    /// A message passed validation and was stored.
    MessageAccepted {
        message: Message,
        /// Peers that delivered it before the verdict was reached.
        sources: Vec<PeerId>,
    },
    /// A message was terminally rejected.
    MessageRejected { id: MessageId, reason: RejectReason },
}

struct InboundMessage {
    bytes: Vec<u8>,
    peer: PeerId,
}

/// Orchestrates validation, deduplication, persistence, and ancestor requests.
pub struct MessageProcessor {
    config: GossipConfig,
    validator: ValidatorChain,
    cache: WorkUnitCache,
    store: Arc<dyn MessageStore>,
    queue: Arc<RequestQueue>,
    metrics: Arc<GossipMetrics>,
    events: broadcast::Sender<ProcessorEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    shutdown: watch::Sender<bool>,
}

impl MessageProcessor {
    pub fn new(
        config: GossipConfig,
        store: Arc<dyn MessageStore>,
        queue: Arc<RequestQueue>,
        metrics: Arc<GossipMetrics>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size.max(1));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            validator: ValidatorChain::from_config(&config),
            cache: WorkUnitCache::new(config.cache_capacity, config.cache_ttl()),
            config,
            store,
            queue,
            metrics,
            events,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            shutdown,
        })
    }

    /// Spawn the inbound worker pool. Must be called within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers.max(1);
        info!(workers, "processor: starting inbound workers");
        (0..workers)
            .map(|index| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.worker(index).await })
            })
            .collect()
    }

    /// Queue network bytes for asynchronous processing.
    ///
    /// Returns `false` if the message was not queued: the processor is
    /// shutting down or the inbound channel is full.
    pub fn process_inbound(&self, bytes: Vec<u8>, peer: PeerId) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        incr(&self.metrics.messages_received);
        match self.inbound_tx.try_send(InboundMessage { bytes, peer }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                incr(&self.metrics.inbound_dropped);
                debug!(%peer, "processor: inbound channel full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Process a local message and wait for the result.
    ///
    /// `Ok` means the message is stored and every parent is solid. An
    /// accepted message with absent or unsolid parents yields
    /// [`ProcessError::Unsolid`]; absent parents are queued for request, and
    /// emitting the same message again once they are solid succeeds.
    pub async fn emit(&self, message: Message) -> Result<MessageId, ProcessError> {
        if self.is_shutting_down() {
            return Err(ProcessError::ShuttingDown);
        }
        incr(&self.metrics.messages_received);

        let id = message.id();
        let parents = message.parents().to_vec();
        match self.process(id, None, move || Ok(message)).await {
            Verdict::Rejected(reason) => Err(reason.into()),
            Verdict::Accepted => self.check_parents_solid(id, &parents),
        }
    }

    /// Serialized bytes of a stored message, for answering peer requests.
    pub fn serve_request(&self, id: &MessageId) -> Result<Option<Vec<u8>>, BraidError> {
        let bytes = self.store.get(id)?.map(|m| m.bytes().to_vec());
        if bytes.is_some() {
            incr(&self.metrics.requests_served);
        }
        Ok(bytes)
    }

    /// Stop admitting messages. Workers drain what is already queued and exit.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("processor: shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessorEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<GossipMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &WorkUnitCache {
        &self.cache
    }

    async fn worker(self: Arc<Self>, index: usize) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    msg = rx.recv() => msg,
                    _ = shutdown.changed() => None,
                }
            };
            match next {
                Some(msg) => self.handle_inbound(msg).await,
                None => break,
            }
        }

        // Drain whatever was admitted before shutdown.
        loop {
            let next = self.inbound_rx.lock().await.try_recv().ok();
            match next {
                Some(msg) => self.handle_inbound(msg).await,
                None => break,
            }
        }
        debug!(index, "processor: worker stopped");
    }

    async fn handle_inbound(&self, msg: InboundMessage) {
        let InboundMessage { bytes, peer } = msg;
        let id = MessageId::hash(&bytes);
        let verdict = self.process(id, Some(peer), || Message::from_bytes(&bytes)).await;
        if let Verdict::Rejected(reason) = verdict {
            debug!(%id, %peer, reason = reason.label(), "processor: inbound message rejected");
        }
    }

    /// Run the shared pipeline for one identity.
    ///
    /// The first caller for `id` parses and validates; everyone else waits on
    /// the same work unit. `parse` is only invoked by the first caller.
    async fn process<F>(&self, id: MessageId, source: Option<PeerId>, parse: F) -> Verdict
    where
        F: FnOnce() -> Result<Message, MessageError>,
    {
        let (unit, created) = self.cache.get_or_create(id);
        if let Some(peer) = source {
            unit.add_source(peer);
        }
        if !created {
            incr(&self.metrics.cache_hits);
            let verdict = unit.wait().await;
            if verdict.is_accepted() {
                self.queue.mark_received(&id);
            }
            return verdict;
        }
        incr(&self.metrics.cache_misses);

        let (verdict, accepted) = match parse() {
            Ok(message) => {
                let verdict = self.admit(&message, source);
                (verdict, Some(message))
            }
            Err(e) => (Verdict::Rejected(RejectReason::Malformed(e)), None),
        };
        self.cache.resolve(&unit, verdict.clone());

        match (&verdict, accepted) {
            (Verdict::Accepted, Some(message)) => {
                incr(&self.metrics.accepted);
                let _ = self.events.send(ProcessorEvent::MessageAccepted {
                    message,
                    sources: unit.sources(),
                });
            }
            (Verdict::Rejected(reason), _) => {
                self.metrics.record_rejection(reason);
                let _ = self.events.send(ProcessorEvent::MessageRejected {
                    id,
                    reason: reason.clone(),
                });
            }
            (Verdict::Accepted, None) => {}
        }
        verdict
    }

    /// Validate, persist, and request missing ancestry.
    fn admit(&self, message: &Message, source: Option<PeerId>) -> Verdict {
        let id = message.id();
        match self.validator.validate(message, self.store.as_ref()) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Verdict::Rejected(reason),
            Err(e) => {
                warn!(%id, "processor: storage read failed during validation: {e}");
                return Verdict::Rejected(RejectReason::StorageWrite(e.to_string()));
            }
        }

        match self.store.put(message) {
            Ok(true) => debug!(%id, parents = message.parents().len(), "processor: message stored"),
            Ok(false) => debug!(%id, "processor: message already stored"),
            Err(e) => {
                warn!(%id, "processor: storage write failed: {e}");
                return Verdict::Rejected(RejectReason::StorageWrite(e.to_string()));
            }
        }
        self.queue.mark_received(&id);

        for parent in message.parents() {
            if let Err(e) = self.queue.enqueue(*parent, source) {
                warn!(%id, %parent, "processor: failed to queue parent request: {e}");
            }
        }
        Verdict::Accepted
    }

    /// Live solidity check of an accepted message's parents.
    fn check_parents_solid(
        &self,
        id: MessageId,
        parents: &[MessageId],
    ) -> Result<MessageId, ProcessError> {
        let storage = |e: BraidError| ProcessError::Storage(e.to_string());
        let mut unsolid = Vec::new();
        for parent in parents {
            if self.store.is_solid(parent).map_err(storage)? {
                continue;
            }
            self.queue.enqueue(*parent, None).map_err(storage)?;
            unsolid.push(*parent);
        }
        if unsolid.is_empty() {
            Ok(id)
        } else {
            debug!(%id, missing = unsolid.len(), "processor: emitted message is unsolid");
            Err(ProcessError::Unsolid { parents: unsolid })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::pow;
    use braid_core::storage::MemoryMessageStore;
    use braid_core::types::NetworkId;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const MIN_SCORE: f64 = 100.0;

    struct Harness {
        processor: Arc<MessageProcessor>,
        store: Arc<MemoryMessageStore>,
        queue: Arc<RequestQueue>,
    }

    fn config() -> GossipConfig {
        GossipConfig {
            network_id: NetworkId(1),
            min_score: MIN_SCORE,
            workers: 2,
            ..GossipConfig::default()
        }
    }

    fn harness_with(config: GossipConfig) -> Harness {
        let store = Arc::new(MemoryMessageStore::new());
        let metrics = Arc::new(GossipMetrics::new());
        let queue = Arc::new(RequestQueue::new(&config, store.clone(), metrics.clone()));
        let processor = MessageProcessor::new(config, store.clone(), queue.clone(), metrics);
        Harness { processor, store, queue }
    }

    fn harness() -> Harness {
        harness_with(config())
    }

    fn mined(parents: Vec<MessageId>, tag: u8) -> Message {
        let draft = Message::new(NetworkId(1), parents, vec![tag; 16], 0).unwrap();
        pow::mine(&draft, MIN_SCORE, u64::MAX).unwrap()
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// In-memory store with injectable faults: failing writes, and one
    /// lookup that misses a message already stored.
    struct FaultyStore {
        inner: MemoryMessageStore,
        fail_puts: AtomicBool,
        lag: parking_lot::Mutex<Option<MessageId>>,
    }

    impl FaultyStore {
        fn new() -> Self {
            Self {
                inner: MemoryMessageStore::new(),
                fail_puts: AtomicBool::new(false),
                lag: parking_lot::Mutex::new(None),
            }
        }
    }

    impl MessageStore for FaultyStore {
        fn contains(&self, id: &MessageId) -> Result<bool, BraidError> {
            {
                let mut lag = self.lag.lock();
                if *lag == Some(*id) {
                    *lag = None;
                    return Ok(false);
                }
            }
            self.inner.contains(id)
        }
        fn get(&self, id: &MessageId) -> Result<Option<Message>, BraidError> {
            self.inner.get(id)
        }
        fn put(&self, message: &Message) -> Result<bool, BraidError> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(BraidError::Storage("disk full".into()));
            }
            self.inner.put(message)
        }
        fn is_solid(&self, id: &MessageId) -> Result<bool, BraidError> {
            self.inner.is_solid(id)
        }
        fn confirmed_index(&self) -> Result<u32, BraidError> {
            self.inner.confirmed_index()
        }
        fn root_index(&self, id: &MessageId) -> Result<Option<u32>, BraidError> {
            self.inner.root_index(id)
        }
    }

    fn faulty_harness() -> (Arc<MessageProcessor>, Arc<FaultyStore>, Arc<RequestQueue>) {
        let config = config();
        let store = Arc::new(FaultyStore::new());
        let metrics = Arc::new(GossipMetrics::new());
        let queue = Arc::new(RequestQueue::new(&config, store.clone(), metrics.clone()));
        let processor = MessageProcessor::new(config, store.clone(), queue.clone(), metrics);
        (processor, store, queue)
    }

    #[tokio::test]
    async fn emit_accepts_solid_message() {
        let h = harness();
        let msg = mined(vec![MessageId::ZERO], 1);
        assert_eq!(h.processor.emit(msg.clone()).await, Ok(msg.id()));
        assert!(h.store.is_solid(&msg.id()).unwrap());
        assert_eq!(h.processor.metrics().snapshot().accepted, 1);
    }

    #[tokio::test]
    async fn emit_reports_unsolid_then_succeeds() {
        let h = harness();
        let parent = mined(vec![MessageId::ZERO], 1);
        let child = mined(vec![parent.id()], 2);

        let err = h.processor.emit(child.clone()).await.unwrap_err();
        assert_eq!(err, ProcessError::Unsolid { parents: vec![parent.id()] });
        assert!(h.queue.contains(&parent.id()));
        assert!(h.store.contains(&child.id()).unwrap());

        h.processor.emit(parent.clone()).await.unwrap();
        assert!(!h.queue.contains(&parent.id()));
        assert_eq!(h.processor.emit(child.clone()).await, Ok(child.id()));
        assert_eq!(h.store.write_count(), 2);
    }

    #[tokio::test]
    async fn repeated_emit_hits_cache() {
        let h = harness();
        let msg = mined(vec![MessageId::ZERO], 1);
        for _ in 0..3 {
            h.processor.emit(msg.clone()).await.unwrap();
        }
        let snap = h.processor.metrics().snapshot();
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(h.store.write_count(), 1);
    }

    #[tokio::test]
    async fn emit_rejects_wrong_network() {
        let h = harness();
        let draft = Message::new(NetworkId(2), vec![MessageId::ZERO], vec![0; 16], 0).unwrap();
        let msg = pow::mine(&draft, MIN_SCORE, u64::MAX).unwrap();
        let err = h.processor.emit(msg).await.unwrap_err();
        assert!(matches!(err, ProcessError::Rejected(RejectReason::WrongNetwork { .. })));
        assert!(h.store.is_empty());
        assert_eq!(h.processor.metrics().snapshot().rejected_network, 1);
    }

    #[tokio::test]
    async fn inbound_message_is_stored_and_announced() {
        let h = harness();
        let mut events = h.processor.subscribe();
        let workers = h.processor.start();

        let peer = PeerId::random();
        let msg = mined(vec![MessageId::ZERO], 1);
        assert!(h.processor.process_inbound(msg.bytes().to_vec(), peer));

        match events.recv().await.unwrap() {
            ProcessorEvent::MessageAccepted { message, sources } => {
                assert_eq!(message, msg);
                assert_eq!(sources, vec![peer]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(h.store.contains(&msg.id()).unwrap());

        h.processor.shutdown();
        for w in workers {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn malformed_inbound_is_rejected() {
        let h = harness();
        let mut events = h.processor.subscribe();
        let workers = h.processor.start();

        assert!(h.processor.process_inbound(vec![0xFF; 3], PeerId::random()));
        match events.recv().await.unwrap() {
            ProcessorEvent::MessageRejected { reason, .. } => {
                assert!(matches!(reason, RejectReason::Malformed(_)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.processor.metrics().snapshot().rejected_malformed, 1);

        h.processor.shutdown();
        for w in workers {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn inbound_queues_missing_parents_with_peer_hint() {
        let h = harness();
        let workers = h.processor.start();

        let peer = PeerId::random();
        let missing = MessageId([9; 32]);
        let msg = mined(vec![missing], 1);
        h.processor.process_inbound(msg.bytes().to_vec(), peer);

        wait_until(|| h.queue.contains(&missing)).await;
        assert_eq!(h.queue.get(&missing).unwrap().peers, vec![peer]);
        assert!(!h.store.is_solid(&msg.id()).unwrap());

        h.processor.shutdown();
        for w in workers {
            w.await.unwrap();
        }
    }

    #[tokio::test]
    async fn full_inbound_channel_drops() {
        let h = harness_with(GossipConfig {
            inbound_queue_size: 1,
            ..config()
        });
        // No workers: nothing drains the channel.
        assert!(h.processor.process_inbound(vec![1], PeerId::random()));
        assert!(!h.processor.process_inbound(vec![2], PeerId::random()));
        assert_eq!(h.processor.metrics().snapshot().inbound_dropped, 1);
    }

    #[tokio::test]
    async fn shutdown_drains_and_refuses() {
        let h = harness();
        let msg = mined(vec![MessageId::ZERO], 1);
        assert!(h.processor.process_inbound(msg.bytes().to_vec(), PeerId::random()));

        // Workers start after shutdown and still drain the admitted message.
        h.processor.shutdown();
        for w in h.processor.start() {
            w.await.unwrap();
        }
        assert!(h.store.contains(&msg.id()).unwrap());

        assert!(!h.processor.process_inbound(msg.bytes().to_vec(), PeerId::random()));
        let err = h.processor.emit(msg).await.unwrap_err();
        assert_eq!(err, ProcessError::ShuttingDown);
    }

    #[tokio::test]
    async fn serve_request_returns_stored_bytes() {
        let h = harness();
        let msg = mined(vec![MessageId::ZERO], 1);
        h.processor.emit(msg.clone()).await.unwrap();

        let served = h.processor.serve_request(&msg.id()).unwrap();
        assert_eq!(served.as_deref(), Some(msg.bytes()));
        assert_eq!(h.processor.serve_request(&MessageId([4; 32])).unwrap(), None);
        assert_eq!(h.processor.metrics().snapshot().requests_served, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn storage_write_failure_rejects_every_waiter() {
        let (processor, store, _) = faulty_harness();
        let mut events = processor.subscribe();
        store.fail_puts.store(true, Ordering::SeqCst);

        let msg = mined(vec![MessageId::ZERO], 1);
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let processor = Arc::clone(&processor);
                let msg = msg.clone();
                tokio::spawn(async move { processor.emit(msg).await })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        assert!(matches!(
            &results[0],
            Err(ProcessError::Rejected(RejectReason::StorageWrite(_)))
        ));
        assert!(results.iter().all(|r| *r == results[0]));

        match events.recv().await.unwrap() {
            ProcessorEvent::MessageRejected { id, reason } => {
                assert_eq!(id, msg.id());
                assert!(matches!(reason, RejectReason::StorageWrite(_)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let snap = processor.metrics().snapshot();
        assert_eq!(snap.storage_failures, 1);
        assert_eq!(snap.accepted, 0);
        assert!(!store.contains(&msg.id()).unwrap());

        // The pipeline keeps admitting other messages.
        store.fail_puts.store(false, Ordering::SeqCst);
        let next = mined(vec![MessageId::ZERO], 2);
        assert_eq!(processor.emit(next.clone()).await, Ok(next.id()));
    }

    #[tokio::test]
    async fn redelivered_message_closes_leftover_request() {
        let (processor, store, queue) = faulty_harness();
        let workers = processor.start();

        let parent = mined(vec![MessageId::ZERO], 1);
        processor.emit(parent.clone()).await.unwrap();

        // A lookup racing the write lets a request for the stored parent in.
        *store.lag.lock() = Some(parent.id());
        let peer = PeerId::random();
        assert!(queue.enqueue(parent.id(), Some(peer)).unwrap());

        // The peer answers; the delivery hits the cached acceptance.
        assert!(processor.process_inbound(parent.bytes().to_vec(), peer));
        wait_until(|| !queue.contains(&parent.id())).await;

        let snap = processor.metrics().snapshot();
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.requests_issued, 0);

        processor.shutdown();
        for w in workers {
            w.await.unwrap();
        }
    }
}
