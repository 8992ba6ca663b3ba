//! Manual discovery (spec §4.2): always present, exposes
//! `add_peer`/`remove_peer` for explicit user-driven discovery.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{DiscoveredCallback, DiscoveryService};
use crate::error::SyncResult;
use crate::identity::PeerId;
use crate::types::{DeviceType, PeerAddress, PeerInfo};

pub struct ManualDiscovery {
    callback: Mutex<Option<DiscoveredCallback>>,
    added: Mutex<HashMap<PeerId, PeerAddress>>,
}

impl ManualDiscovery {
    pub fn new() -> Self {
        ManualDiscovery {
            callback: Mutex::new(None),
            added: Mutex::new(HashMap::new()),
        }
    }

    /// Records `address` and, if discovery has started, reports it
    /// through the pipeline's callback immediately.
    pub fn add_peer(&self, address: PeerAddress) {
        self.added.lock().insert(address.peer_id.clone(), address.clone());
        if let Some(cb) = self.callback.lock().clone() {
            cb(peer_info(address));
        }
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.added.lock().remove(peer_id);
    }
}

fn peer_info(address: PeerAddress) -> PeerInfo {
    PeerInfo {
        peer_id: address.peer_id.clone(),
        name: address.peer_id.to_string(),
        device_type: DeviceType::Unknown,
        addresses: vec![address],
        groups: Vec::new(),
        capabilities: Default::default(),
        version: String::new(),
        last_seen: chrono::Utc::now(),
    }
}

#[async_trait::async_trait]
impl DiscoveryService for ManualDiscovery {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn start(self: Arc<Self>, on_discovered: DiscoveredCallback) -> SyncResult<()> {
        let existing: Vec<PeerAddress> = self.added.lock().values().cloned().collect();
        *self.callback.lock() = Some(on_discovered.clone());
        for address in existing {
            on_discovered(peer_info(address));
        }
        Ok(())
    }

    async fn stop(&self) {
        *self.callback.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_address(byte: u8) -> PeerAddress {
        let key = iroh::SecretKey::from_bytes(&[byte; 32]);
        PeerAddress {
            peer_id: PeerId::from_endpoint_id(key.public().into()),
            direct_addrs: Default::default(),
            relay_url: None,
        }
    }

    #[tokio::test]
    async fn add_peer_after_start_invokes_callback_immediately() {
        let manual = Arc::new(ManualDiscovery::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        Arc::clone(&manual)
            .start(Arc::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        manual.add_peer(sample_address(9));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peers_added_before_start_replay_on_start() {
        let manual = Arc::new(ManualDiscovery::new());
        manual.add_peer(sample_address(11));

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        Arc::clone(&manual)
            .start(Arc::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
