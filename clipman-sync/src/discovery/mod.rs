//! Peer discovery (spec §4.2): pluggable mechanisms feeding one
//! deduplicated known-peers map and a single `on_peer_discovered`
//! callback.
//!
//! Grounded in the teacher's subsystem-trait pattern (`verifiers/mod.rs`:
//! a small trait, one struct per mechanism, a registry keyed by name) and
//! in spacedrive's `core/p2p2/src/discovery/mdns.rs` for the mDNS
//! mechanism itself.

pub mod dht;
pub mod manual;
pub mod mdns;
pub mod paired;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::{DiscoveryMethod, SyncConfig};
use crate::error::SyncResult;
use crate::identity::PeerId;
use crate::node::Node;
use crate::persistence;
use crate::types::PeerInfo;

pub use manual::ManualDiscovery;

/// TTLs applied to addresses a discovery mechanism contributes to the
/// known-peers map (spec §4.2b).
pub const LAN_ADDRESS_TTL: Duration = Duration::from_secs(60 * 60);
pub const NETWORK_ADDRESS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MANUAL_ADDRESS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const PERSIST_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Current known-peers file format version (spec §5's supplemented
/// behavior: wrap the persisted list in a versioned envelope, the way
/// the teacher wraps every S2S message in a tagged `S2sMessage`, so a
/// future format change can be detected rather than silently misread).
const KNOWN_PEERS_FILE_VERSION: u32 = 1;

#[derive(serde::Serialize, serde::Deserialize)]
struct KnownPeersFile {
    version: u32,
    peers: Vec<PeerInfo>,
}

impl Default for KnownPeersFile {
    fn default() -> Self {
        KnownPeersFile { version: KNOWN_PEERS_FILE_VERSION, peers: Vec::new() }
    }
}

/// One pluggable discovery mechanism. `start`/`stop` bound its lifetime;
/// discovered peers are reported through the shared callback the
/// pipeline installs, not returned from these methods.
#[async_trait::async_trait]
pub trait DiscoveryService: Send + Sync {
    fn name(&self) -> &'static str;

    /// TTL applied to addresses this mechanism contributes (spec §4.2b).
    /// Defaults to the long-lived manual/paired TTL; mechanisms whose
    /// addresses go stale faster override this.
    fn address_ttl(&self) -> Duration {
        MANUAL_ADDRESS_TTL
    }

    async fn start(self: Arc<Self>, on_discovered: DiscoveredCallback) -> SyncResult<()>;
    async fn stop(&self);
}

pub type DiscoveredCallback = Arc<dyn Fn(PeerInfo) + Send + Sync>;

struct KnownPeer {
    info: PeerInfo,
    expires_at: std::time::Instant,
}

/// Owns the known-peers map, runs whichever `DiscoveryService`s the
/// configuration selects, and periodically persists the map to disk.
pub struct DiscoveryPipeline {
    services: Vec<Arc<dyn DiscoveryService>>,
    paired: Option<Arc<paired::PairedDiscovery>>,
    known_peers: Arc<RwLock<HashMap<PeerId, KnownPeer>>>,
    manual: Arc<ManualDiscovery>,
    persist_path: Option<std::path::PathBuf>,
    max_stored_peers: usize,
    persist_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryPipeline {
    pub fn new(config: &SyncConfig, node: Arc<Node>) -> Self {
        let manual = Arc::new(ManualDiscovery::new());

        let mut services: Vec<Arc<dyn DiscoveryService>> = vec![manual.clone()];
        let mut paired = None;
        match config.discovery_method {
            DiscoveryMethod::Manual => {}
            DiscoveryMethod::Mdns => {
                services.push(Arc::new(mdns::MdnsDiscovery::new(node.peer_id())));
            }
            DiscoveryMethod::Dht => {
                services.push(Arc::new(dht::DhtDiscovery::new(
                    node,
                    config.dht_bootstrap_peers.clone(),
                    config.dht_server_mode,
                )));
            }
            DiscoveryMethod::Paired => {
                let service = Arc::new(paired::PairedDiscovery::new());
                paired = Some(service.clone());
                services.push(service);
            }
        }

        DiscoveryPipeline {
            services,
            paired,
            known_peers: Arc::new(RwLock::new(HashMap::new())),
            manual,
            persist_path: config.persist_discovered_peers.then(|| config.known_peers_path()),
            max_stored_peers: config.max_stored_peers,
            persist_task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn manual(&self) -> Arc<ManualDiscovery> {
        self.manual.clone()
    }

    /// Registers the paired-device set the `paired` mechanism consults.
    /// No-op when that mechanism isn't active.
    pub fn set_paired_devices(&self, devices: Vec<PeerInfo>) {
        if let Some(paired) = &self.paired {
            paired.set_known(devices);
        }
    }

    pub async fn start(&self) -> SyncResult<()> {
        if let Some(path) = &self.persist_path {
            let file: KnownPeersFile = persistence::read_json_or_default(path)?;
            if file.version != KNOWN_PEERS_FILE_VERSION {
                tracing::warn!(
                    found = file.version,
                    expected = KNOWN_PEERS_FILE_VERSION,
                    "known-peers file has an unrecognized version, ignoring its contents"
                );
            } else {
                let mut known = self.known_peers.write().await;
                let now = std::time::Instant::now();
                for info in file.peers {
                    known.insert(
                        info.peer_id.clone(),
                        KnownPeer { expires_at: now + MANUAL_ADDRESS_TTL, info },
                    );
                }
                tracing::info!(count = known.len(), "loaded known peers from disk");
            }
        }

        for service in &self.services {
            let service = Arc::clone(service);
            let known_peers = Arc::clone(&self.known_peers);
            let max_stored = self.max_stored_peers;
            let ttl = service.address_ttl();
            let on_discovered: DiscoveredCallback = Arc::new(move |info: PeerInfo| {
                let known_peers = Arc::clone(&known_peers);
                tokio::spawn(async move {
                    let mut known = known_peers.write().await;
                    known.insert(
                        info.peer_id.clone(),
                        KnownPeer { expires_at: std::time::Instant::now() + ttl, info },
                    );
                    evict_excess(&mut known, max_stored);
                });
            });

            let name = service.name();
            tokio::spawn(async move {
                if let Err(e) = service.start(on_discovered).await {
                    tracing::warn!(mechanism = name, error = %e, "discovery mechanism failed to start");
                }
            });
        }

        if let Some(path) = self.persist_path.clone() {
            let known_peers = Arc::clone(&self.known_peers);
            let max_stored = self.max_stored_peers;
            let task = tokio::spawn(async move {
                let mut interval = tokio::time::interval(PERSIST_INTERVAL);
                loop {
                    interval.tick().await;
                    if let Err(e) = persist_known_peers(&known_peers, &path, max_stored).await {
                        tracing::warn!(error = %e, "periodic known-peers save failed");
                    }
                }
            });
            *self.persist_task.lock().await = Some(task);
        }

        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(task) = self.persist_task.lock().await.take() {
            task.abort();
        }
        for service in &self.services {
            service.stop().await;
        }
        if let Some(path) = &self.persist_path {
            if let Err(e) = persist_known_peers(&self.known_peers, path, self.max_stored_peers).await {
                tracing::warn!(error = %e, "final known-peers save failed");
            }
        }
    }

    pub async fn discovered_peers(&self) -> Vec<PeerInfo> {
        let now = std::time::Instant::now();
        self.known_peers
            .read()
            .await
            .values()
            .filter(|kp| kp.expires_at > now)
            .map(|kp| kp.info.clone())
            .collect()
    }
}

async fn persist_known_peers(
    known_peers: &Arc<RwLock<HashMap<PeerId, KnownPeer>>>,
    path: &std::path::Path,
    max_stored_peers: usize,
) -> SyncResult<()> {
    let mut known = known_peers.write().await;
    evict_excess(&mut known, max_stored_peers);
    let mut peers: Vec<PeerInfo> =
        known.values().map(|kp| &kp.info).filter(|info| info.is_valid()).cloned().collect();
    peers.sort_by_key(|p| p.last_seen);
    persistence::write_json_atomic(path, &KnownPeersFile { version: KNOWN_PEERS_FILE_VERSION, peers })
}

/// Keeps only the `max_stored_peers` entries with the most recent
/// `last_seen`, evicting the rest (spec §8's eviction invariant).
fn evict_excess(known: &mut HashMap<PeerId, KnownPeer>, max_stored_peers: usize) {
    if known.len() <= max_stored_peers {
        return;
    }
    let mut entries: Vec<(PeerId, chrono::DateTime<chrono::Utc>)> =
        known.iter().map(|(id, kp)| (id.clone(), kp.info.last_seen)).collect();
    entries.sort_by_key(|(_, last_seen)| *last_seen);
    let to_evict = entries.len() - max_stored_peers;
    for (peer_id, _) in entries.into_iter().take(to_evict) {
        known.remove(&peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceType;

    fn peer(byte: u8, seconds_ago: i64) -> (PeerId, KnownPeer) {
        let key = iroh::SecretKey::from_bytes(&[byte; 32]);
        let peer_id = PeerId::from_endpoint_id(key.public().into());
        let info = PeerInfo {
            peer_id: peer_id.clone(),
            name: format!("peer-{byte}"),
            device_type: DeviceType::Unknown,
            addresses: vec![],
            groups: vec![],
            capabilities: Default::default(),
            version: String::new(),
            last_seen: chrono::Utc::now() - chrono::Duration::seconds(seconds_ago),
        };
        (peer_id, KnownPeer { expires_at: std::time::Instant::now(), info })
    }

    #[test]
    fn eviction_keeps_most_recently_seen_entries() {
        let mut known = HashMap::new();
        // P1..P5 with P5 most recent (seen 0s ago), P1 oldest (seen 40s ago).
        let entries: Vec<_> = (1..=5u8).map(|i| peer(i, (5 - i as i64) * 10)).collect();
        let ids: Vec<PeerId> = entries.iter().map(|(id, _)| id.clone()).collect();
        for (id, kp) in entries {
            known.insert(id, kp);
        }

        evict_excess(&mut known, 3);

        assert_eq!(known.len(), 3);
        assert!(!known.contains_key(&ids[0]), "P1 should be evicted");
        assert!(!known.contains_key(&ids[1]), "P2 should be evicted");
        assert!(known.contains_key(&ids[2]), "P3 should survive");
        assert!(known.contains_key(&ids[3]), "P4 should survive");
        assert!(known.contains_key(&ids[4]), "P5 should survive");
    }

    #[test]
    fn eviction_is_noop_under_the_limit() {
        let mut known = HashMap::new();
        let (id, kp) = peer(1, 0);
        known.insert(id.clone(), kp);
        evict_excess(&mut known, 3);
        assert!(known.contains_key(&id));
    }
}
