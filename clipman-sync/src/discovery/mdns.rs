//! LAN multicast discovery (spec §4.2), grounded in spacedrive's
//! `core/p2p2/src/discovery/mdns.rs`: one `mdns_sd::ServiceDaemon`,
//! one service type derived from the application name, browse events
//! turned into `PeerInfo` records.

use std::sync::Arc;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{DiscoveredCallback, DiscoveryService};
use crate::error::{SyncError, SyncResult};
use crate::identity::PeerId;
use crate::types::{DeviceType, PeerAddress, PeerInfo};

const SERVICE_TYPE: &str = "_clipman._udp.local.";

pub struct MdnsDiscovery {
    local_peer_id: PeerId,
    daemon: Mutex<Option<ServiceDaemon>>,
    browse_task: Mutex<Option<JoinHandle<()>>>,
}

impl MdnsDiscovery {
    pub fn new(local_peer_id: PeerId) -> Self {
        MdnsDiscovery {
            local_peer_id,
            daemon: Mutex::new(None),
            browse_task: Mutex::new(None),
        }
    }

    /// Announces this node's presence at `port`, advertising `addresses`
    /// in the TXT record. Called by the Sync Manager once the Node's
    /// listen port is known.
    pub async fn register(&self, port: u16, addresses: &[std::net::IpAddr]) -> SyncResult<()> {
        let daemon = self.daemon.lock().await;
        let daemon = daemon.as_ref().ok_or(SyncError::NotStarted)?;

        let host_ips: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &self.local_peer_id.to_string(),
            &format!("{}.local.", self.local_peer_id),
            host_ips.join(","),
            port,
            None,
        )
        .map_err(|e| SyncError::Protocol(format!("invalid mdns service info: {e}")))?;

        daemon
            .register(service)
            .map_err(|e| SyncError::Protocol(format!("mdns register failed: {e}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DiscoveryService for MdnsDiscovery {
    fn name(&self) -> &'static str {
        "mdns"
    }

    fn address_ttl(&self) -> std::time::Duration {
        super::LAN_ADDRESS_TTL
    }

    async fn start(self: Arc<Self>, on_discovered: DiscoveredCallback) -> SyncResult<()> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| SyncError::Protocol(format!("mdns daemon init failed: {e}")))?;
        let browser = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| SyncError::Protocol(format!("mdns browse failed: {e}")))?;

        *self.daemon.lock().await = Some(daemon);

        let local_peer_id = self.local_peer_id.clone();
        let task = tokio::spawn(async move {
            while let Ok(event) = browser.recv_async().await {
                if let ServiceEvent::ServiceResolved(info) = event {
                    match parse_resolved(&info, &local_peer_id) {
                        Some(peer_info) => on_discovered(peer_info),
                        None => continue,
                    }
                }
            }
            tracing::info!("mdns browse loop ended");
        });
        *self.browse_task.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.browse_task.lock().await.take() {
            task.abort();
        }
        if let Some(daemon) = self.daemon.lock().await.take() {
            if let Err(e) = daemon.shutdown() {
                tracing::warn!(error = %e, "mdns daemon shutdown failed");
            }
        }
    }
}

fn parse_resolved(info: &ServiceInfo, local_peer_id: &PeerId) -> Option<PeerInfo> {
    let raw_peer_id = info.get_fullname().replace(&format!(".{SERVICE_TYPE}"), "");
    let peer_id: PeerId = raw_peer_id.parse().ok()?;
    if &peer_id == local_peer_id {
        return None;
    }

    let port = info.get_port();
    let direct_addrs = info
        .get_addresses()
        .iter()
        .map(|ip| std::net::SocketAddr::new(*ip, port))
        .collect();

    Some(PeerInfo {
        peer_id: peer_id.clone(),
        name: peer_id.to_string(),
        device_type: DeviceType::Unknown,
        addresses: vec![PeerAddress { peer_id, direct_addrs, relay_url: None }],
        groups: Vec::new(),
        capabilities: Default::default(),
        version: String::new(),
        last_seen: chrono::Utc::now(),
    })
}
