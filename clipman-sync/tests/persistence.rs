//! Persistence acceptance test (spec §8 scenario 4): paired devices
//! survive a stop/restart against the same data directory without
//! re-pairing.

mod support;

use std::sync::Arc;

use clipman_sync::SyncManager;

#[tokio::test]
async fn paired_devices_survive_restart() {
    let laptop_dir = tempfile::tempdir().unwrap();
    let phone_dir = tempfile::tempdir().unwrap();

    let laptop = SyncManager::new(support::config_at(laptop_dir.path(), "laptop")).unwrap();
    let phone = SyncManager::new(support::config_at(phone_dir.path(), "phone")).unwrap();
    laptop.start().await.unwrap();
    phone.start().await.unwrap();

    let address = laptop
        .enable_pairing(Arc::new(|_request, _remote| true), None)
        .await
        .unwrap();
    let response = phone.request_pairing(&address).await.unwrap();
    assert!(response.accepted);

    laptop.stop().await;
    phone.stop().await;

    // Fresh SyncManager instances over the same data directories reload
    // the same persisted identity key and paired-device registry.
    let laptop2 = SyncManager::new(support::config_at(laptop_dir.path(), "laptop")).unwrap();
    let phone2 = SyncManager::new(support::config_at(phone_dir.path(), "phone")).unwrap();
    laptop2.start().await.unwrap();
    phone2.start().await.unwrap();

    let laptop_paired = laptop2.paired_devices().await.unwrap();
    let phone_paired = phone2.paired_devices().await.unwrap();
    assert_eq!(laptop_paired.len(), 1, "laptop's paired registry must survive restart");
    assert_eq!(phone_paired.len(), 1, "phone's paired registry must survive restart");
    assert_eq!(phone_paired[0].display_name, "laptop");

    laptop2.stop().await;
    phone2.stop().await;
}
