//! Automatic reconnection to trusted peers (spec §5's supplemented
//! behavior), modeled on the teacher's `connect_peer_with_retry`: a
//! single supervisor task walks the trusted-peer list on a fixed poll
//! interval and redials any that have gone quiet, backing off
//! exponentially per peer up to 60s and resetting on success.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::discovery::DiscoveryPipeline;
use crate::identity::PeerId;
use crate::node::Node;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct Reconnector {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Reconnector {
    pub fn new() -> Self {
        Reconnector { task: Mutex::new(None) }
    }

    /// No-op when `trusted_peers` is empty — there's nothing to watch.
    pub async fn start(&self, node: Arc<Node>, discovery: Arc<DiscoveryPipeline>, trusted_peers: Vec<PeerId>) {
        if trusted_peers.is_empty() {
            return;
        }

        let task = tokio::spawn(async move {
            let mut backoff: HashMap<PeerId, (Instant, Duration)> = HashMap::new();
            loop {
                let known = discovery.discovered_peers().await;
                let connected: HashSet<PeerId> = node.connected_peers().await.into_iter().collect();

                for peer_id in &trusted_peers {
                    if connected.contains(peer_id) {
                        backoff.remove(peer_id);
                        continue;
                    }
                    let Some(info) = known.iter().find(|p| &p.peer_id == peer_id) else {
                        continue;
                    };
                    let Some(address) = info.addresses.first() else {
                        continue;
                    };
                    if let Some((last_attempt, wait)) = backoff.get(peer_id) {
                        if last_attempt.elapsed() < *wait {
                            continue;
                        }
                    }

                    match node.dial(address).await {
                        Ok(_) => {
                            tracing::info!(peer = %peer_id, "auto-reconnected to trusted peer");
                            backoff.remove(peer_id);
                        }
                        Err(e) => {
                            let next = backoff
                                .get(peer_id)
                                .map(|(_, wait)| (*wait * 2).min(MAX_BACKOFF))
                                .unwrap_or(INITIAL_BACKOFF);
                            tracing::warn!(peer = %peer_id, error = %e, backoff_secs = next.as_secs(), "auto-reconnect attempt failed");
                            backoff.insert(peer_id.clone(), (Instant::now(), next));
                        }
                    }
                }

                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
        *self.task.lock().await = Some(task);
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
    }
}
