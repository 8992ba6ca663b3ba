//! Group Transport (spec §4.4): publish/subscribe fan-out of
//! `ClipboardPayload`s among members of named groups, over iroh-gossip.
//!
//! Subscribes its topics on the `Node`'s own shared `Gossip` instance
//! (spec §2/§4.1: one endpoint per node) instead of standing up a second
//! endpoint — `Node`'s accept loop already routes gossip-ALPN connections
//! there. Joining a group registers any bootstrap addresses with the
//! node's endpoint first, so `gossip.subscribe` can actually dial them
//! instead of subscribing into an empty, unreachable mesh.

use std::collections::HashMap;
use std::sync::Arc;

use iroh_gossip::net::{GossipReceiver, GossipSender};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::{GroupName, SyncError, SyncResult};
use crate::identity::PeerId;
use crate::node::Node;
use crate::types::{ClipboardPayload, PeerAddress};

/// Invoked for every payload received on a joined group, with the
/// PeerID of the publisher. Never invoked for this node's own payloads.
pub type ContentHandler = Arc<dyn Fn(ClipboardPayload, PeerId) + Send + Sync>;

#[derive(serde::Serialize, serde::Deserialize)]
struct Envelope {
    source: PeerId,
    message_id: String,
    group: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    payload: ClipboardPayload,
}

/// Allowed/excluded content types and a maximum payload size (spec
/// §4.4). Pattern lists are named in the spec as reserved for future
/// use and carry no behavior yet.
#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    pub allowed_types: Option<Vec<crate::types::ContentType>>,
    pub excluded_types: Vec<crate::types::ContentType>,
    pub max_payload_bytes: Option<usize>,
}

impl ContentFilter {
    fn allows(&self, payload: &ClipboardPayload) -> bool {
        if let Some(allowed) = &self.allowed_types {
            if !allowed.contains(&payload.content_type) {
                return false;
            }
        }
        if self.excluded_types.contains(&payload.content_type) {
            return false;
        }
        if let Some(max) = self.max_payload_bytes {
            if payload.bytes.len() > max {
                return false;
            }
        }
        true
    }
}

struct JoinedGroup {
    sender: GossipSender,
    reader_task: JoinHandle<()>,
}

pub struct GroupTransport {
    filter: ContentFilter,
    node: RwLock<Option<Arc<Node>>>,
    groups: RwLock<HashMap<GroupName, JoinedGroup>>,
    content_handler: Arc<RwLock<Option<ContentHandler>>>,
}

impl GroupTransport {
    pub fn new(filter: ContentFilter) -> Self {
        GroupTransport {
            filter,
            node: RwLock::new(None),
            groups: RwLock::new(HashMap::new()),
            content_handler: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn start(&self, node: Arc<Node>) -> SyncResult<()> {
        node.gossip().await?;
        *self.node.write().await = Some(node);
        Ok(())
    }

    pub async fn stop(&self) {
        let groups: Vec<GroupName> = self.groups.read().await.keys().cloned().collect();
        for group in groups {
            self.leave(&group).await;
        }
        *self.node.write().await = None;
    }

    pub async fn set_content_handler(&self, handler: ContentHandler) {
        *self.content_handler.write().await = Some(handler);
    }

    /// Idempotent: joining an already-joined group is a no-op. `bootstrap`
    /// addresses are registered with the node's endpoint before
    /// subscribing, so gossip can actually dial them rather than
    /// subscribing into a mesh it has no way to reach (spec §4.4, §8
    /// scenario 2).
    pub async fn join(&self, group: &GroupName, bootstrap: Vec<PeerAddress>) -> SyncResult<()> {
        let node = self.active().await?;
        if self.groups.read().await.contains_key(group) {
            return Ok(());
        }

        let mut bootstrap_ids = Vec::with_capacity(bootstrap.len());
        for address in &bootstrap {
            node.add_known_address(address).await?;
            bootstrap_ids.push(address.peer_id.to_endpoint_id()?);
        }

        let topic = topic_id_for(group);
        let gossip = node.gossip().await?;
        let topic_handle = gossip
            .subscribe(topic, bootstrap_ids)
            .map_err(|e| SyncError::Protocol(format!("gossip join failed: {e}")))?;
        let (sender, receiver) = topic_handle.split();

        let reader_task = self.spawn_reader(group.clone(), receiver, node.peer_id());

        self.groups
            .write()
            .await
            .insert(group.clone(), JoinedGroup { sender, reader_task });
        tracing::info!(group = %group, bootstrap_peers = bootstrap.len(), "joined group");
        Ok(())
    }

    pub async fn leave(&self, group: &GroupName) {
        if let Some(joined) = self.groups.write().await.remove(group) {
            joined.reader_task.abort();
            tracing::info!(group = %group, "left group");
        }
    }

    pub async fn publish(&self, group: &GroupName, payload: ClipboardPayload) -> SyncResult<()> {
        if !self.filter.allows(&payload) {
            tracing::debug!(group = %group, "payload rejected by content filter, dropping silently");
            return Ok(());
        }

        let node = self.active().await?;
        let groups = self.groups.read().await;
        let joined = groups.get(group).ok_or_else(|| SyncError::NotJoined(group.clone()))?;

        let envelope = Envelope {
            source: node.peer_id(),
            message_id: random_id(),
            group: group.0.clone(),
            timestamp: chrono::Utc::now(),
            payload,
        };
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| SyncError::Protocol(format!("envelope encode failed: {e}")))?;

        joined
            .sender
            .broadcast(bytes.into())
            .await
            .map_err(|e| SyncError::Protocol(format!("gossip broadcast failed: {e}")))?;
        Ok(())
    }

    pub async fn list_groups(&self) -> Vec<GroupName> {
        self.groups.read().await.keys().cloned().collect()
    }

    fn spawn_reader(
        &self,
        group: GroupName,
        mut receiver: GossipReceiver,
        local_peer_id: PeerId,
    ) -> JoinHandle<()> {
        let content_handler = Arc::clone(&self.content_handler);
        tokio::spawn(async move {
            use futures_lite::StreamExt;
            while let Some(event) = receiver.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(group = %group, error = %e, "gossip reader error");
                        continue;
                    }
                };
                let iroh_gossip::api::Event::Received(message) = event else {
                    continue;
                };
                let envelope: Envelope = match serde_json::from_slice(&message.content) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(group = %group, error = %e, "malformed group envelope, dropping");
                        continue;
                    }
                };
                if envelope.source == local_peer_id {
                    continue;
                }
                if let Some(handler) = content_handler.read().await.clone() {
                    handler(envelope.payload, envelope.source);
                }
            }
        })
    }

    async fn active(&self) -> SyncResult<Arc<Node>> {
        self.node.read().await.clone().ok_or(SyncError::NotStarted)
    }
}

fn topic_id_for(group: &GroupName) -> iroh_gossip::proto::TopicId {
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    hasher.update(b"clipman-");
    hasher.update(group.0.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    iroh_gossip::proto::TopicId::from_bytes(bytes)
}

fn random_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentType;

    #[test]
    fn filter_rejects_excluded_content_type() {
        let filter = ContentFilter {
            allowed_types: None,
            excluded_types: vec![ContentType::Image],
            max_payload_bytes: None,
        };
        let payload = ClipboardPayload::new(ContentType::Image, vec![1, 2, 3]);
        assert!(!filter.allows(&payload));
    }

    #[test]
    fn filter_rejects_oversized_payload() {
        let filter = ContentFilter {
            allowed_types: None,
            excluded_types: Vec::new(),
            max_payload_bytes: Some(2),
        };
        let payload = ClipboardPayload::new(ContentType::Text, vec![1, 2, 3]);
        assert!(!filter.allows(&payload));
    }

    #[test]
    fn topic_id_is_deterministic_per_group() {
        let a = topic_id_for(&GroupName::from("default"));
        let b = topic_id_for(&GroupName::from("default"));
        let c = topic_id_for(&GroupName::from("other"));
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }
}
