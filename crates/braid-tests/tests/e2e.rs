//! End-to-end admission tests.
//!
//! Drive `emit` through the whole pipeline against in-memory storage and a
//! full node backed by RocksDB, covering the terminal rejections, unsolid
//! parents, and re-submission once ancestry arrives.

use std::sync::Arc;

use braid_core::error::{ProcessError, RejectReason};
use braid_core::traits::MessageStore;
use braid_core::types::{MessageId, NetworkId};
use braid_node_lib::config::NodeConfig;
use braid_node_lib::node::{Node, PeerHandle};
use braid_tests::helpers::*;

/// Create a test node backed by a temp directory.
fn test_node() -> (Arc<Node>, PeerHandle, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = NodeConfig {
        data_dir: dir.path().to_path_buf(),
        gossip: gossip_config(),
        ..NodeConfig::default()
    };
    let (node, handle) = Node::new(config).unwrap();
    (node, handle, dir)
}

#[tokio::test]
async fn emit_scenario() {
    let p = pipeline();
    let network = test_network();

    // Four parents nobody has seen: accepted but unsolid.
    let unknown: Vec<MessageId> = (1..=4).map(id).collect();
    let orphan = mined(network, unknown.clone(), b"orphan");
    match p.processor.emit(orphan.clone()).await {
        Err(ProcessError::Unsolid { parents }) => assert_eq!(parents, unknown),
        other => panic!("expected unsolid, got {other:?}"),
    }
    for parent in &unknown {
        assert!(p.queue.contains(parent));
    }

    // Genesis parent with a valid proof.
    let good = mined(network, vec![MessageId::ZERO], b"hello");
    assert_eq!(p.processor.emit(good.clone()).await, Ok(good.id()));

    // Mismatching network id, valid proof.
    let foreign = mined(NetworkId(1), vec![MessageId::ZERO], b"hello");
    let err = p.processor.emit(foreign).await.unwrap_err();
    assert!(matches!(err, ProcessError::Rejected(RejectReason::WrongNetwork { .. })));

    // Network id restored, same content re-mined: identical bytes, so the
    // accepted verdict comes from the cache.
    let restored = mined(network, vec![MessageId::ZERO], b"hello");
    assert_eq!(restored, good);
    assert_eq!(p.processor.emit(restored.clone()).await, Ok(restored.id()));

    // Arbitrary nonce without proof.
    let weak = unmined(&restored, 123);
    let err = p.processor.emit(weak).await.unwrap_err();
    assert!(matches!(err, ProcessError::Rejected(RejectReason::InsufficientScore { .. })));

    let snap = p.metrics.snapshot();
    assert_eq!(snap.accepted, 2);
    assert_eq!(snap.cache_hits, 1);
    assert_eq!(snap.rejected_network, 1);
    assert_eq!(snap.rejected_score, 1);
    assert_eq!(p.store.write_count(), 2);
}

#[tokio::test]
async fn resubmission_succeeds_once_parents_arrive() {
    let p = pipeline();
    let network = test_network();

    let a = mined(network, vec![MessageId::ZERO], b"a");
    let b = mined(network, vec![a.id()], b"b");
    let c = mined(network, vec![a.id(), b.id()], b"c");

    let mut missing = vec![a.id(), b.id()];
    missing.sort();
    let err = p.processor.emit(c.clone()).await.unwrap_err();
    assert_eq!(err, ProcessError::Unsolid { parents: missing });

    // `b` is stored but its own parent is still missing.
    let err = p.processor.emit(b.clone()).await.unwrap_err();
    assert_eq!(err, ProcessError::Unsolid { parents: vec![a.id()] });
    let err = p.processor.emit(c.clone()).await.unwrap_err();
    assert!(matches!(err, ProcessError::Unsolid { .. }));

    assert_eq!(p.processor.emit(a.clone()).await, Ok(a.id()));
    assert!(p.queue.is_empty());
    assert_eq!(p.processor.emit(b.clone()).await, Ok(b.id()));
    assert_eq!(p.processor.emit(c.clone()).await, Ok(c.id()));
    assert_eq!(p.store.write_count(), 3);
}

#[tokio::test]
async fn wrong_network_rejected_regardless_of_parent_state() {
    let p = pipeline();
    for parents in [vec![MessageId::ZERO], vec![id(7)], vec![MessageId::ZERO, id(8)]] {
        let msg = mined(NetworkId(42), parents, b"foreign");
        let err = p.processor.emit(msg).await.unwrap_err();
        assert!(matches!(err, ProcessError::Rejected(RejectReason::WrongNetwork { .. })));
    }
    assert!(p.store.is_empty());
    assert!(p.queue.is_empty());
}

#[tokio::test]
async fn stale_parent_rejected_after_reference_point_advances() {
    let p = pipeline();
    let network = test_network();

    let old = mined(network, vec![MessageId::ZERO], b"old");
    p.processor.emit(old.clone()).await.unwrap();
    p.store.confirm(&old.id(), 1);

    let fresh = mined(network, vec![old.id()], b"fresh");
    assert_eq!(p.processor.emit(fresh.clone()).await, Ok(fresh.id()));

    // Move the reference point past the window.
    p.store.confirm(&id(99), 1 + TEST_WINDOW + 1);
    let late = mined(network, vec![old.id()], b"late");
    let err = p.processor.emit(late.clone()).await.unwrap_err();
    assert_eq!(
        err,
        ProcessError::Rejected(RejectReason::Stale { distance: TEST_WINDOW + 1, window: TEST_WINDOW })
    );
    assert!(!p.store.contains(&late.id()).unwrap());
}

#[tokio::test]
async fn descendant_of_confirmed_message_stays_fresh() {
    let p = pipeline();
    let network = test_network();

    let a = mined(network, vec![MessageId::ZERO], b"a");
    let b = mined(network, vec![a.id()], b"b");
    p.processor.emit(a.clone()).await.unwrap();
    p.processor.emit(b.clone()).await.unwrap();

    p.store.confirm(&a.id(), 20);

    let on_a = mined(network, vec![a.id()], b"on a");
    assert_eq!(p.processor.emit(on_a.clone()).await, Ok(on_a.id()));
    let on_b = mined(network, vec![b.id()], b"on b");
    assert_eq!(p.processor.emit(on_b.clone()).await, Ok(on_b.id()));
    assert_eq!(p.store.root_index(&b.id()).unwrap(), Some(20));

    // Genesis itself is now beyond the window.
    let on_genesis = mined(network, vec![MessageId::ZERO], b"on genesis");
    let err = p.processor.emit(on_genesis).await.unwrap_err();
    assert_eq!(
        err,
        ProcessError::Rejected(RejectReason::Stale { distance: 20, window: TEST_WINDOW })
    );
}

#[tokio::test]
async fn node_emit_scenario_on_rocksdb() {
    let (node, _handle, _dir) = test_node();
    let network = test_network();

    let parent = mined(network, vec![MessageId::ZERO], b"parent");
    let child = mined(network, vec![parent.id()], b"child");

    let err = node.emit(child.clone()).await.unwrap_err();
    assert_eq!(err, ProcessError::Unsolid { parents: vec![parent.id()] });
    assert!(!node.store().is_solid(&child.id()).unwrap());

    assert_eq!(node.emit(parent.clone()).await, Ok(parent.id()));
    assert!(node.store().is_solid(&child.id()).unwrap());
    assert_eq!(node.emit(child.clone()).await, Ok(child.id()));

    let foreign = mined(NetworkId(1), vec![MessageId::ZERO], b"parent");
    assert!(matches!(
        node.emit(foreign).await,
        Err(ProcessError::Rejected(RejectReason::WrongNetwork { .. }))
    ));

    assert_eq!(node.store().write_count().unwrap(), 2);
    let snap = node.metrics();
    assert_eq!(snap.accepted, 2);
    assert_eq!(snap.rejected_network, 1);
}
