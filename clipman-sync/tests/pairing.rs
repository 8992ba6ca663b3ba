//! Pairing Subsystem acceptance tests (spec §8 scenarios 1 and 6):
//! two local nodes completing mutual pairing, and a pairing request
//! against an unreachable address timing out cleanly.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clipman_sync::{PeerAddress, SyncManager};

#[tokio::test]
async fn two_nodes_complete_mutual_pairing() {
    let laptop_dir = tempfile::tempdir().unwrap();
    let phone_dir = tempfile::tempdir().unwrap();

    let laptop = SyncManager::new(support::config_at(laptop_dir.path(), "laptop")).unwrap();
    let phone = SyncManager::new(support::config_at(phone_dir.path(), "phone")).unwrap();

    laptop.start().await.unwrap();
    phone.start().await.unwrap();

    let accepted = Arc::new(AtomicBool::new(false));
    let accepted2 = Arc::clone(&accepted);
    let address = laptop
        .enable_pairing(
            Arc::new(move |_request, _remote| {
                accepted2.store(true, Ordering::SeqCst);
                true
            }),
            None,
        )
        .await
        .unwrap();

    let response = phone.request_pairing(&address).await.unwrap();

    assert!(response.accepted);
    assert!(accepted.load(Ordering::SeqCst), "laptop's callback should have run");
    assert!(response.pairing_code.is_some());
    assert_eq!(response.pairing_code.as_ref().unwrap().len(), 6);

    assert!(phone.is_paired(&laptop_peer_id(&laptop).await).await.unwrap());
    let phone_paired = phone.paired_devices().await.unwrap();
    assert_eq!(phone_paired.len(), 1);
    assert_eq!(phone_paired[0].display_name, "laptop");

    laptop.stop().await;
    phone.stop().await;
}

#[tokio::test]
async fn pairing_request_to_unreachable_address_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = support::config_at(dir.path(), "laptop");
    config.pairing_timeout_seconds = 2;
    let laptop = SyncManager::new(config).unwrap();
    laptop.start().await.unwrap();

    // A syntactically valid address nobody is listening on.
    let unreachable: PeerAddress = format!(
        "peer/{}/ip/127.0.0.1:1",
        unused_peer_id().await
    )
    .parse()
    .unwrap();

    let started = std::time::Instant::now();
    let result = laptop.request_pairing(&unreachable).await;
    assert!(result.is_err(), "pairing against an unreachable peer must fail");
    assert!(started.elapsed() < Duration::from_secs(15));

    assert!(laptop.paired_devices().await.unwrap().is_empty());

    laptop.stop().await;
}

async fn laptop_peer_id(manager: &SyncManager) -> clipman_sync::PeerId {
    manager.local_addresses().await.unwrap()[0].peer_id.clone()
}

async fn unused_peer_id() -> clipman_sync::PeerId {
    let dir = tempfile::tempdir().unwrap();
    let config = support::config_at(dir.path(), "ghost");
    let manager = SyncManager::new(config).unwrap();
    manager.start().await.unwrap();
    let peer_id = manager.local_addresses().await.unwrap()[0].peer_id.clone();
    manager.stop().await;
    peer_id
}
