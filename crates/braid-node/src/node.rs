//! Node composition and event loop.
//!
//! The [`Node`] wires RocksDB storage, the request queue, and the message
//! processor together, and talks to the peer layer through two channels:
//! [`PeerEvent`]s flow in (received messages, requests for our messages) and
//! [`PeerCommand`]s flow out (ancestor requests, replies, gossip).

use std::sync::Arc;

use libp2p::PeerId;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use braid_core::error::{BraidError, ProcessError};
use braid_core::traits::PeerRequester;
use braid_core::types::{Message, MessageId};
use braid_gossip::{GossipMetrics, MessageProcessor, MetricsSnapshot, ProcessorEvent, RequestQueue};

use crate::config::NodeConfig;
use crate::storage::RocksStore;

/// Events delivered by the peer layer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A peer gossiped or answered with serialized message bytes.
    MessageReceived { bytes: Vec<u8>, peer: PeerId },
    /// A peer asked for one of our messages.
    MessageRequested { id: MessageId, peer: PeerId },
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

/// Instructions for the peer layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Ask peers for a missing message, preferring `peers`.
    RequestMessage { id: MessageId, peers: Vec<PeerId> },
    /// Reply to a single peer.
    SendMessage { peer: PeerId, bytes: Vec<u8> },
    /// Gossip to every connected peer except `exclude`.
    Broadcast { bytes: Vec<u8>, exclude: Vec<PeerId> },
}

/// The peer layer's ends of the node's channels.
pub struct PeerHandle {
    pub events: mpsc::Sender<PeerEvent>,
    pub commands: mpsc::UnboundedReceiver<PeerCommand>,
}

/// [`PeerRequester`] that turns requests into [`PeerCommand::RequestMessage`].
pub struct ChannelRequester {
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl ChannelRequester {
    pub fn new(commands: mpsc::UnboundedSender<PeerCommand>) -> Self {
        Self { commands }
    }
}

impl PeerRequester for ChannelRequester {
    fn request_message(&self, id: MessageId, peers: &[PeerId]) {
        let command = PeerCommand::RequestMessage { id, peers: peers.to_vec() };
        if self.commands.send(command).is_err() {
            debug!(%id, "peer command channel closed, request not sent");
        }
    }
}

/// A gossip node: storage plus the admission pipeline.
pub struct Node {
    store: Arc<RocksStore>,
    metrics: Arc<GossipMetrics>,
    queue: Arc<RequestQueue>,
    processor: Arc<MessageProcessor>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    /// Receiver for peer events (behind tokio Mutex for async recv).
    event_rx: tokio::sync::Mutex<mpsc::Receiver<PeerEvent>>,
    config: NodeConfig,
}

impl Node {
    /// Create a node with the given configuration.
    ///
    /// Opens storage (seeding genesis if empty) and builds the pipeline.
    /// Nothing runs until [`Node::run`].
    pub fn new(config: NodeConfig) -> Result<(Arc<Self>, PeerHandle), BraidError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| BraidError::Storage(format!("{}: {e}", config.data_dir.display())))?;
        let store = Arc::new(RocksStore::open(config.db_path())?);

        let metrics = Arc::new(GossipMetrics::new());
        let queue = Arc::new(RequestQueue::new(&config.gossip, store.clone(), Arc::clone(&metrics)));
        let processor = MessageProcessor::new(
            config.gossip.clone(),
            store.clone(),
            Arc::clone(&queue),
            Arc::clone(&metrics),
        );

        let (event_tx, event_rx) = mpsc::channel(config.peer_event_buffer.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        info!(
            network = %config.network_name,
            network_id = %config.gossip.network_id,
            min_score = config.gossip.min_score,
            path = %config.db_path().display(),
            "node initialised"
        );

        let node = Arc::new(Self {
            store,
            metrics,
            queue,
            processor,
            commands: command_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
            config,
        });
        let handle = PeerHandle {
            events: event_tx,
            commands: command_rx,
        };
        Ok((node, handle))
    }

    /// Run until `shutdown` flips to `true` or the peer layer hangs up.
    ///
    /// Starts the processor workers, the requester loop, and the gossip
    /// forwarder, then dispatches peer events. On exit, stops admission and
    /// waits for the workers to drain.
    pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let workers = self.processor.start();
        let (stop_tx, stop_rx) = watch::channel(false);

        let requester: Arc<dyn PeerRequester> = Arc::new(ChannelRequester::new(self.commands.clone()));
        let requester_task = tokio::spawn(Arc::clone(&self.queue).run(requester, stop_rx.clone()));
        let forwarder = tokio::spawn(forward_accepted(
            self.processor.subscribe(),
            self.commands.clone(),
            stop_rx,
        ));

        info!("node running");
        {
            let mut events = self.event_rx.lock().await;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => self.handle_peer_event(event),
                        None => {
                            info!("peer event channel closed, shutting down");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        self.processor.shutdown();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("processor worker failed: {e}");
            }
        }
        let _ = stop_tx.send(true);
        for task in [requester_task, forwarder] {
            if let Err(e) = task.await {
                warn!("node task failed: {e}");
            }
        }
        if let Err(e) = self.store.flush() {
            warn!("failed to flush storage: {e}");
        }
        info!("node stopped");
    }

    fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::MessageReceived { bytes, peer } => {
                if !self.processor.process_inbound(bytes, peer) {
                    debug!(%peer, "inbound message not admitted");
                }
            }
            PeerEvent::MessageRequested { id, peer } => match self.processor.serve_request(&id) {
                Ok(Some(bytes)) => {
                    let _ = self.commands.send(PeerCommand::SendMessage { peer, bytes });
                }
                Ok(None) => debug!(%id, %peer, "peer requested unknown message"),
                Err(e) => warn!(%id, %peer, "failed to serve request: {e}"),
            },
            PeerEvent::PeerConnected(peer) => info!(%peer, "peer connected"),
            PeerEvent::PeerDisconnected(peer) => info!(%peer, "peer disconnected"),
        }
    }

    /// Submit a locally built message and wait for the verdict.
    pub async fn emit(&self, message: Message) -> Result<MessageId, ProcessError> {
        self.processor.emit(message).await
    }

    /// Confirm a message at `index`, advancing the staleness reference point.
    pub fn confirm(&self, id: &MessageId, index: u32) -> Result<bool, BraidError> {
        self.store.confirm(id, index)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn store(&self) -> &Arc<RocksStore> {
        &self.store
    }

    pub fn processor(&self) -> &Arc<MessageProcessor> {
        &self.processor
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}

/// Gossip every freshly accepted message, skipping the peers it came from.
async fn forward_accepted(
    mut events: broadcast::Receiver<ProcessorEvent>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(ProcessorEvent::MessageAccepted { message, sources }) => {
                    let command = PeerCommand::Broadcast {
                        bytes: message.bytes().to_vec(),
                        exclude: sources,
                    };
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                Ok(ProcessorEvent::MessageRejected { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "gossip forwarder lagged behind processor events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = stop.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::pow;
    use braid_core::traits::MessageStore;
    use std::time::Duration;

    const MIN_SCORE: f64 = 100.0;

    /// Create a test node backed by a temp directory.
    fn test_node() -> (Arc<Node>, PeerHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..NodeConfig::default()
        };
        config.gossip.min_score = MIN_SCORE;
        config.gossip.tick_interval_ms = 10;
        let (node, handle) = Node::new(config).unwrap();
        (node, handle, dir)
    }

    fn mined(node: &Node, parents: Vec<MessageId>, tag: u8) -> Message {
        let network = node.config().gossip.network_id;
        let draft = Message::new(network, parents, vec![tag; 16], 0).unwrap();
        pow::mine(&draft, MIN_SCORE, u64::MAX).unwrap()
    }

    /// Receive commands until one matches.
    async fn next_matching(
        commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
        mut pred: impl FnMut(&PeerCommand) -> bool,
    ) -> PeerCommand {
        loop {
            let command = tokio::time::timeout(Duration::from_secs(5), commands.recv())
                .await
                .expect("timed out waiting for peer command")
                .expect("command channel closed");
            if pred(&command) {
                return command;
            }
        }
    }

    #[test]
    fn node_starts_with_genesis() {
        let (node, _handle, _dir) = test_node();
        assert!(node.store().is_solid(&MessageId::ZERO).unwrap());
        assert_eq!(node.metrics(), MetricsSnapshot::default());
    }

    #[tokio::test]
    async fn emit_stores_message() {
        let (node, _handle, _dir) = test_node();
        let msg = mined(&node, vec![MessageId::ZERO], 1);
        assert_eq!(node.emit(msg.clone()).await, Ok(msg.id()));
        assert_eq!(node.store().get(&msg.id()).unwrap(), Some(msg));
        assert_eq!(node.metrics().accepted, 1);
    }

    #[tokio::test]
    async fn confirm_advances_reference_point() {
        let (node, _handle, _dir) = test_node();
        let msg = mined(&node, vec![MessageId::ZERO], 1);
        node.emit(msg.clone()).await.unwrap();
        assert!(node.confirm(&msg.id(), 3).unwrap());
        assert_eq!(node.store().confirmed_index().unwrap(), 3);
    }

    #[tokio::test]
    async fn inbound_message_is_gossiped_to_other_peers() {
        let (node, mut handle, _dir) = test_node();
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run(stop_rx).await })
        };

        let peer = PeerId::random();
        let msg = mined(&node, vec![MessageId::ZERO], 1);
        handle
            .events
            .send(PeerEvent::MessageReceived { bytes: msg.bytes().to_vec(), peer })
            .await
            .unwrap();

        let command =
            next_matching(&mut handle.commands, |c| matches!(c, PeerCommand::Broadcast { .. })).await;
        assert_eq!(
            command,
            PeerCommand::Broadcast { bytes: msg.bytes().to_vec(), exclude: vec![peer] }
        );

        stop_tx.send(true).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn missing_parent_is_requested_from_source() {
        let (node, mut handle, _dir) = test_node();
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run(stop_rx).await })
        };

        let peer = PeerId::random();
        let missing = MessageId([9; 32]);
        let msg = mined(&node, vec![missing], 1);
        handle
            .events
            .send(PeerEvent::MessageReceived { bytes: msg.bytes().to_vec(), peer })
            .await
            .unwrap();

        let command = next_matching(&mut handle.commands, |c| {
            matches!(c, PeerCommand::RequestMessage { .. })
        })
        .await;
        assert_eq!(command, PeerCommand::RequestMessage { id: missing, peers: vec![peer] });

        stop_tx.send(true).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn requested_message_is_served() {
        let (node, mut handle, _dir) = test_node();
        let msg = mined(&node, vec![MessageId::ZERO], 1);
        node.emit(msg.clone()).await.unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run(stop_rx).await })
        };

        let peer = PeerId::random();
        handle
            .events
            .send(PeerEvent::MessageRequested { id: msg.id(), peer })
            .await
            .unwrap();

        let command =
            next_matching(&mut handle.commands, |c| matches!(c, PeerCommand::SendMessage { .. })).await;
        assert_eq!(command, PeerCommand::SendMessage { peer, bytes: msg.bytes().to_vec() });
        assert_eq!(node.metrics().requests_served, 1);

        stop_tx.send(true).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn run_returns_when_peer_layer_hangs_up() {
        let (node, handle, _dir) = test_node();
        let (_stop_tx, stop_rx) = watch::channel(false);
        drop(handle);
        node.run(stop_rx).await;
        assert!(node.processor().is_shutting_down());
    }
}
