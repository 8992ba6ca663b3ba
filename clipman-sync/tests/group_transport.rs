//! Group Transport acceptance tests (spec §8 scenarios 2 and 3): content
//! fan-out to other group members without self-delivery, and outright
//! rejection of a self-dial.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clipman_sync::{ClipboardPayload, ContentType, SyncManager};
use clipman_sync::error::GroupName;
use clipman_sync::identity::Identity;
use clipman_sync::node::Node;

#[tokio::test]
async fn group_content_fans_out_without_self_delivery() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let config_a = support::config_at(dir_a.path(), "a");
    let config_b = support::config_at(dir_b.path(), "b");

    let node_a = SyncManager::new(config_a).unwrap();
    let node_b = SyncManager::new(config_b).unwrap();
    node_a.start().await.unwrap();
    node_b.start().await.unwrap();

    // Each side learns the other's address through manual discovery so
    // the group join below has a real bootstrap peer to dial.
    let addr_a = node_a.local_addresses().await.unwrap().into_iter().next().unwrap();
    let addr_b = node_b.local_addresses().await.unwrap().into_iter().next().unwrap();
    node_a.add_peer(addr_b).await.unwrap();
    node_b.add_peer(addr_a).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let group = GroupName::from("default");
    node_a.join_group(&group).await.unwrap();
    node_b.join_group(&group).await.unwrap();

    let a_received = Arc::new(AtomicUsize::new(0));
    let a_received2 = Arc::clone(&a_received);
    node_a
        .set_content_handler(Arc::new(move |_payload, _source| {
            a_received2.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

    let b_received = Arc::new(AtomicUsize::new(0));
    let b_received2 = Arc::clone(&b_received);
    node_b
        .set_content_handler(Arc::new(move |payload, _source| {
            assert_eq!(payload.bytes, b"hello group");
            b_received2.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

    // Gossip needs a moment to establish its mesh after both sides join.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let payload = ClipboardPayload::new(ContentType::Text, b"hello group".to_vec());
    node_a.send_content(payload, &group).await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while b_received.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(b_received.load(Ordering::SeqCst), 1, "b should receive exactly one message");
    assert_eq!(a_received.load(Ordering::SeqCst), 0, "a must never receive its own publish");

    node_a.stop().await;
    node_b.stop().await;
}

#[tokio::test]
async fn dialing_own_advertised_address_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = support::config_at(dir.path(), "solo");
    let identity = Identity::load_or_create(None, &config.identity_key_path()).unwrap();
    let node = Node::new(identity, &config);
    node.start(&config).await.unwrap();

    let own_address = node.local_addresses().await.unwrap().into_iter().next().unwrap();

    let before = node.connected_peers().await;
    let result = node.dial(&own_address).await;
    assert!(matches!(result, Err(clipman_sync::SyncError::SelfDial)));
    assert_eq!(node.connected_peers().await, before);

    node.stop().await;
}
