//! DHT rendezvous discovery (spec §4.2).
//!
//! No dedicated DHT crate appears anywhere in this workspace's dependency
//! corpus, so rendezvous is built on `iroh-gossip`, the one pubsub-style
//! overlay the corpus already relies on for Group Transport: every
//! participant subscribes to a fixed rendezvous topic and periodically
//! re-broadcasts a signed-free JSON record of its own addresses, exactly
//! the "periodically re-advertises a record under a deterministic
//! rendezvous key" behavior the spec asks for, without a real Kademlia
//! routing table. `dht_server_mode`/`dht_persistent_storage` are accepted
//! for configuration-surface completeness but do not change this
//! mechanism's behavior — there is no separate server role to run.
//!
//! Subscribes on the Node's shared `Gossip` instance rather than binding
//! a second endpoint, the same as Group Transport; bootstrap addresses
//! are registered with the node's endpoint before subscribing.

use std::sync::Arc;
use std::time::Duration;

use super::{DiscoveredCallback, DiscoveryService};
use crate::error::{SyncError, SyncResult};
use crate::identity::PeerId;
use crate::node::Node;
use crate::types::{DeviceType, PeerAddress, PeerInfo};

const RENDEZVOUS_KEY: &str = "/clipman/rendezvous/clipman-peers";
const REBROADCAST_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(serde::Serialize, serde::Deserialize)]
struct Record {
    peer_id: PeerId,
    addrs: Vec<String>,
    app: String,
    version: String,
    time: i64,
}

pub struct DhtDiscovery {
    node: Arc<Node>,
    bootstrap: Vec<String>,
    #[allow(dead_code)]
    server_mode: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DhtDiscovery {
    pub fn new(node: Arc<Node>, bootstrap: Vec<String>, server_mode: bool) -> Self {
        DhtDiscovery { node, bootstrap, server_mode, tasks: Mutex::new(Vec::new()) }
    }
}

fn topic_id() -> iroh_gossip::proto::TopicId {
    use sha2::Digest;
    let digest = sha2::Sha256::digest(RENDEZVOUS_KEY.as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    iroh_gossip::proto::TopicId::from_bytes(bytes)
}

#[async_trait::async_trait]
impl DiscoveryService for DhtDiscovery {
    fn name(&self) -> &'static str {
        "dht"
    }

    fn address_ttl(&self) -> Duration {
        super::NETWORK_ADDRESS_TTL
    }

    async fn start(self: Arc<Self>, on_discovered: DiscoveredCallback) -> SyncResult<()> {
        let gossip = self.node.gossip().await?;

        let bootstrap_addrs: Vec<PeerAddress> =
            self.bootstrap.iter().filter_map(|s| s.parse::<PeerAddress>().ok()).collect();
        let mut bootstrap_ids = Vec::with_capacity(bootstrap_addrs.len());
        for address in &bootstrap_addrs {
            self.node.add_known_address(address).await?;
            bootstrap_ids.push(address.peer_id.to_endpoint_id()?);
        }

        let topic = gossip
            .subscribe(topic_id(), bootstrap_ids)
            .map_err(|e| SyncError::Protocol(format!("dht gossip subscribe failed: {e}")))?;
        let (sender, mut receiver) = topic.split();

        let local_peer_id = self.node.peer_id();
        let local_addrs = self.node.local_addresses().await.unwrap_or_default();

        let broadcast_task = tokio::spawn({
            let sender = sender.clone();
            async move {
                let mut interval = tokio::time::interval(REBROADCAST_INTERVAL);
                loop {
                    interval.tick().await;
                    let record = Record {
                        peer_id: local_peer_id.clone(),
                        addrs: local_addrs.iter().map(|a| a.to_string()).collect(),
                        app: "clipman".to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        time: chrono::Utc::now().timestamp(),
                    };
                    if let Ok(bytes) = serde_json::to_vec(&record) {
                        if let Err(e) = sender.broadcast(bytes.into()).await {
                            tracing::warn!(error = %e, "dht rendezvous re-advertise failed");
                        }
                    }
                }
            }
        });

        let local_peer_id = self.node.peer_id();
        let read_task = tokio::spawn(async move {
            use futures_lite::StreamExt;
            while let Some(event) = receiver.next().await {
                let Ok(iroh_gossip::api::Event::Received(message)) = event else { continue };
                let Ok(record): Result<Record, _> = serde_json::from_slice(&message.content) else {
                    continue;
                };
                if record.peer_id == local_peer_id {
                    continue;
                }
                let addresses: Vec<PeerAddress> =
                    record.addrs.iter().filter_map(|s| s.parse().ok()).collect();
                if addresses.is_empty() {
                    continue;
                }
                on_discovered(PeerInfo {
                    peer_id: record.peer_id.clone(),
                    name: record.peer_id.to_string(),
                    device_type: DeviceType::Unknown,
                    addresses,
                    groups: Vec::new(),
                    capabilities: Default::default(),
                    version: record.version,
                    last_seen: chrono::Utc::now(),
                });
            }
        });

        *self.tasks.lock().await = vec![broadcast_task, read_task];
        Ok(())
    }

    async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}
