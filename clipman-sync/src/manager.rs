//! Sync Manager (spec §4.5): composes Node, Discovery Pipeline, Pairing,
//! and Group Transport into the single object the enclosing daemon and
//! CLI talk to.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::SyncConfig;
use crate::discovery::DiscoveryPipeline;
use crate::error::{GroupName, SyncError, SyncResult};
use crate::identity::{Identity, PeerId};
use crate::node::Node;
use crate::pairing::{PairingCallback, PairingSubsystem};
use crate::reconnect::Reconnector;
use crate::transport::{ContentFilter, ContentHandler, GroupTransport};
use crate::types::{ClipboardPayload, PairedDevice, PairingResponse, PeerAddress, PeerInfo};

#[derive(Clone)]
struct Started {
    node: Arc<Node>,
    discovery: Arc<DiscoveryPipeline>,
    pairing: Arc<PairingSubsystem>,
    transport: Arc<GroupTransport>,
    reconnector: Arc<Reconnector>,
}

/// The public surface exposed to the enclosing daemon and CLI.
pub struct SyncManager {
    config: SyncConfig,
    started: RwLock<Option<Started>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        Ok(SyncManager { config, started: RwLock::new(None) })
    }

    /// Starts Node, Discovery Pipeline, Pairing, Group Transport in that
    /// order; joins any configured default groups. Start-up is
    /// transactional: if the Node fails to start, nothing else starts.
    pub async fn start(&self) -> SyncResult<()> {
        let mut guard = self.started.write().await;
        if guard.is_some() {
            return Err(SyncError::AlreadyStarted);
        }

        let identity = Identity::load_or_create(
            self.config.peer_identity.as_deref(),
            &self.config.identity_key_path(),
        )?;

        let node = Arc::new(Node::new(identity, &self.config));
        if let Err(e) = node.start(&self.config).await {
            tracing::warn!(error = %e, "node failed to start");
            return Err(e);
        }

        let discovery = Arc::new(DiscoveryPipeline::new(&self.config, Arc::clone(&node)));
        if let Err(e) = discovery.start().await {
            node.stop().await;
            return Err(e);
        }

        let pairing = Arc::new(PairingSubsystem::new(
            Arc::clone(&node),
            self.config.device_name.clone(),
            self.config.device_type,
            self.config.pairing_timeout_seconds,
            self.config.paired_devices_path(),
        ));
        if let Err(e) = pairing.start().await {
            discovery.stop().await;
            node.stop().await;
            return Err(e);
        }

        let transport = Arc::new(GroupTransport::new(ContentFilter::default()));
        if let Err(e) = transport.start(Arc::clone(&node)).await {
            discovery.stop().await;
            node.stop().await;
            return Err(e);
        }

        let bootstrap = bootstrap_addresses(&discovery).await;
        for group in &self.config.default_groups {
            let group = GroupName::from(group.clone());
            if let Err(e) = transport.join(&group, bootstrap.clone()).await {
                tracing::warn!(group = %group, error = %e, "failed to join default group");
            }
        }

        let paired_devices = pairing.paired_devices().await;
        discovery.set_paired_devices(
            paired_devices
                .into_iter()
                .map(|d| PeerInfo {
                    peer_id: d.peer_id,
                    name: d.display_name,
                    device_type: d.device_type,
                    addresses: Vec::new(),
                    groups: Vec::new(),
                    capabilities: Default::default(),
                    version: String::new(),
                    last_seen: d.last_seen,
                })
                .collect(),
        );

        let reconnector = Arc::new(Reconnector::new());
        if self.config.auto_reconnect_to_peers {
            reconnector
                .start(Arc::clone(&node), Arc::clone(&discovery), self.config.trusted_peers.clone())
                .await;
        }

        *guard = Some(Started { node, discovery, pairing, transport, reconnector });
        tracing::info!("sync manager started");
        Ok(())
    }

    /// Reverse order; idempotent.
    pub async fn stop(&self) {
        let started = self.started.write().await.take();
        if let Some(started) = started {
            started.reconnector.stop().await;
            started.transport.stop().await;
            started.pairing.disable_pairing().await;
            started.discovery.stop().await;
            started.node.stop().await;
            tracing::info!("sync manager stopped");
        }
    }

    pub async fn is_connected(&self) -> bool {
        match self.active().await {
            Ok(started) => !started.node.connected_peers().await.is_empty(),
            Err(_) => false,
        }
    }

    pub async fn send_content(&self, payload: ClipboardPayload, group: &GroupName) -> SyncResult<()> {
        let started = self.active().await?;
        started.transport.publish(group, payload).await
    }

    pub async fn set_content_handler(&self, handler: ContentHandler) -> SyncResult<()> {
        let started = self.active().await?;
        started.transport.set_content_handler(handler).await;
        Ok(())
    }

    pub async fn join_group(&self, group: &GroupName) -> SyncResult<()> {
        let started = self.active().await?;
        let bootstrap = bootstrap_addresses(&started.discovery).await;
        started.transport.join(group, bootstrap).await
    }

    pub async fn leave_group(&self, group: &GroupName) -> SyncResult<()> {
        let started = self.active().await?;
        started.transport.leave(group).await;
        Ok(())
    }

    pub async fn list_groups(&self) -> SyncResult<Vec<GroupName>> {
        let started = self.active().await?;
        Ok(started.transport.list_groups().await)
    }

    pub async fn enable_pairing(
        &self,
        callback: PairingCallback,
        timeout: Option<Duration>,
    ) -> SyncResult<PeerAddress> {
        let started = self.active().await?;
        started.pairing.enable_pairing(callback, timeout).await
    }

    /// Snapshot of addresses this node advertises for inbound dials.
    pub async fn local_addresses(&self) -> SyncResult<Vec<PeerAddress>> {
        let started = self.active().await?;
        started.node.local_addresses().await
    }

    pub async fn disable_pairing(&self) -> SyncResult<()> {
        let started = self.active().await?;
        started.pairing.disable_pairing().await;
        Ok(())
    }

    pub async fn request_pairing(&self, address: &PeerAddress) -> SyncResult<PairingResponse> {
        let started = self.active().await?;
        let response = started.pairing.request_pairing(address).await?;
        if response.accepted {
            let paired_devices = started.pairing.paired_devices().await;
            started.discovery.set_paired_devices(
                paired_devices
                    .into_iter()
                    .map(|d| PeerInfo {
                        peer_id: d.peer_id,
                        name: d.display_name,
                        device_type: d.device_type,
                        addresses: Vec::new(),
                        groups: Vec::new(),
                        capabilities: Default::default(),
                        version: String::new(),
                        last_seen: d.last_seen,
                    })
                    .collect(),
            );
        }
        Ok(response)
    }

    pub async fn is_pairing_enabled(&self) -> SyncResult<bool> {
        let started = self.active().await?;
        Ok(started.pairing.is_pairing_enabled().await)
    }

    pub async fn is_paired(&self, peer_id: &PeerId) -> SyncResult<bool> {
        let started = self.active().await?;
        Ok(started.pairing.is_paired(peer_id).await)
    }

    pub async fn paired_devices(&self) -> SyncResult<Vec<PairedDevice>> {
        let started = self.active().await?;
        Ok(started.pairing.paired_devices().await)
    }

    pub async fn remove_paired_device(&self, peer_id: &PeerId) -> SyncResult<()> {
        let started = self.active().await?;
        started.pairing.remove_paired_device(peer_id).await
    }

    pub async fn add_peer(&self, address: PeerAddress) -> SyncResult<()> {
        let started = self.active().await?;
        started.discovery.manual().add_peer(address);
        Ok(())
    }

    pub async fn remove_peer(&self, peer_id: &PeerId) -> SyncResult<()> {
        let started = self.active().await?;
        started.discovery.manual().remove_peer(peer_id);
        Ok(())
    }

    pub async fn disconnect_peer(&self, peer_id: &PeerId) -> SyncResult<()> {
        let started = self.active().await?;
        started.node.close_session(peer_id).await;
        Ok(())
    }

    pub async fn discovered_peers(&self) -> SyncResult<Vec<PeerInfo>> {
        let started = self.active().await?;
        Ok(started.discovery.discovered_peers().await)
    }

    pub async fn connected_peers(&self) -> SyncResult<Vec<PeerId>> {
        let started = self.active().await?;
        Ok(started.node.connected_peers().await)
    }

    pub fn get_config(&self) -> SyncConfig {
        self.config.clone()
    }

    async fn active(&self) -> SyncResult<Started> {
        self.started.read().await.clone().ok_or(SyncError::NotStarted)
    }
}

/// Addresses of known peers with at least one resolvable address,
/// suitable as a gossip bootstrap set (spec §4.4, §8 scenario 2).
async fn bootstrap_addresses(discovery: &DiscoveryPipeline) -> Vec<PeerAddress> {
    discovery
        .discovered_peers()
        .await
        .into_iter()
        .filter(|p| p.is_valid())
        .flat_map(|p| p.addresses)
        .collect()
}
