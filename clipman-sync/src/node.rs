//! The peer-to-peer networking endpoint (spec §4.1).
//!
//! Adapted from the teacher's `iroh.rs`: one `iroh::Endpoint` per node,
//! a persistent secret key for a stable identity, and an accept loop that
//! hands every inbound connection to a per-protocol handler. The node
//! binds two ALPNs and, exactly like the teacher's `iroh.rs::start`
//! routes client vs S2S connections by `conn.alpn()`, this accept loop
//! routes its own mux ALPN to per-protocol stream handlers and the
//! gossip ALPN straight to the shared `Gossip` instance — Group
//! Transport and DHT discovery subscribe topics on that same instance
//! rather than standing up their own endpoints, so they're reachable
//! over the one endpoint the spec calls for. Within the mux ALPN,
//! logical protocols are further multiplexed by prefixing every opened
//! stream with a length-prefixed protocol tag — the
//! "open_stream(peer, protocol)" contract in spec §4.1 operates at the
//! stream level, which ALPN routing alone can't express.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use iroh_gossip::net::{Gossip, GOSSIP_ALPN};
use parking_lot::RwLock as SyncRwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::{Identity, PeerId};
use crate::types::PeerAddress;

/// ALPN for every clipman connection; logical protocols are multiplexed
/// within it via a tagged stream prefix.
const NODE_ALPN: &[u8] = b"/clipman/1.0.0/mux";

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DHT_DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// One half of a logical bidirectional stream opened under a protocol tag.
pub struct Stream {
    pub send: iroh::endpoint::SendStream,
    pub recv: iroh::endpoint::RecvStream,
    pub remote: PeerId,
}

/// A handler invoked for every newly accepted stream under a protocol.
/// Invoked on a worker task, never on the caller's thread (spec §4.1).
pub type StreamHandler = Arc<dyn Fn(Stream) + Send + Sync>;

struct Session {
    conn: iroh::endpoint::Connection,
    /// Tags which dial/accept produced this entry, so a superseded
    /// connection's cleanup never evicts a newer one's (teacher's
    /// `conn_gen`/`PeerEntry` pattern in `s2s.rs`).
    gen: u64,
}

struct NodeInner {
    endpoint: iroh::Endpoint,
    local_peer_id: PeerId,
    handlers: SyncRwLock<HashMap<String, StreamHandler>>,
    sessions: Mutex<HashMap<PeerId, Session>>,
    conn_gen: AtomicU64,
    /// Shared gossip engine bound to the same endpoint; Group Transport
    /// and DHT discovery subscribe their own topics on it rather than
    /// each spinning up a second endpoint under this node's identity.
    gossip: Gossip,
}

/// Owns the single long-lived peer-to-peer endpoint, the node's stable
/// identity, and connection lifecycle.
pub struct Node {
    identity: Identity,
    /// Accepted for config-surface completeness (spec §6); this
    /// transport always multiplexes logical protocols over one session
    /// per peer; a true per-protocol dedicated connection would need a
    /// separate session table keyed by `(PeerId, protocol)`, which the
    /// rest of the crate doesn't need today.
    #[allow(dead_code)]
    disable_multiplexing: bool,
    inner: Mutex<Option<Arc<NodeInner>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(identity: Identity, config: &SyncConfig) -> Self {
        Node {
            identity,
            disable_multiplexing: config.disable_multiplexing,
            inner: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Shares this node's identity key with sibling networking surfaces
    /// that need to prove the same identity outside this struct (e.g.
    /// for logging); networking surfaces that need to actually send
    /// traffic should use [`Node::gossip`] instead of binding a second
    /// endpoint.
    pub fn identity_secret_key(&self) -> iroh::SecretKey {
        self.identity.secret_key()
    }

    /// The gossip engine bound to this node's single endpoint. Group
    /// Transport and DHT discovery both subscribe their own topics on
    /// this same instance.
    pub async fn gossip(&self) -> SyncResult<Gossip> {
        Ok(self.active().await?.gossip.clone())
    }

    /// Registers `address` with the endpoint's address book so a later
    /// gossip bootstrap dial (which addresses peers by EndpointID alone)
    /// can resolve it without a prior `dial`.
    pub async fn add_known_address(&self, address: &PeerAddress) -> SyncResult<()> {
        let inner = self.active().await?;
        let addr = address.to_endpoint_addr()?;
        inner
            .endpoint
            .add_node_addr(addr)
            .map_err(|e| SyncError::Protocol(format!("failed to register address: {e}")))
    }

    /// Binds the listener and starts the accept loop. Idempotent only in
    /// the sense that a second call while already started returns
    /// `AlreadyStartedError`-equivalent behavior at the manager layer;
    /// here it simply fails fast if called twice.
    pub async fn start(&self, config: &SyncConfig) -> SyncResult<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut builder = iroh::Endpoint::builder()
            .secret_key(self.identity.secret_key())
            .alpns(vec![NODE_ALPN.to_vec(), GOSSIP_ALPN.to_vec()]);

        if !config.use_relay_nodes || config.force_direct_connection_only {
            builder = builder.relay_mode(iroh::RelayMode::Disabled);
        }

        if config.listen_port != 0 {
            builder = builder
                .bind_addr_v4(std::net::SocketAddrV4::new(
                    std::net::Ipv4Addr::UNSPECIFIED,
                    config.listen_port,
                ))
                .map_err(|e| SyncError::Bind(e.to_string()))?;
        }

        let endpoint = builder
            .bind()
            .await
            .map_err(|e| SyncError::Bind(e.to_string()))?;

        tracing::info!(peer_id = %self.peer_id(), "node endpoint bound");

        let gossip = Gossip::builder().spawn(endpoint.clone());

        let inner = Arc::new(NodeInner {
            endpoint,
            local_peer_id: self.peer_id(),
            handlers: SyncRwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            conn_gen: AtomicU64::new(0),
            gossip,
        });

        let accept_inner = Arc::clone(&inner);
        let accept_task = tokio::spawn(async move {
            accept_loop(accept_inner).await;
        });

        *guard = Some(inner);
        *self.accept_task.lock().await = Some(accept_task);
        Ok(())
    }

    /// Idempotent: closes all sessions and the listener. Safe to call
    /// repeatedly or before `start`.
    pub async fn stop(&self) {
        let inner = self.inner.lock().await.take();
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        if let Some(inner) = inner {
            let sessions = inner.sessions.lock().await;
            for (peer_id, session) in sessions.iter() {
                tracing::debug!(peer = %peer_id, "closing session on node stop");
                session.conn.close(0u32.into(), b"node stopping");
            }
            drop(sessions);
            inner.endpoint.close().await;
            tracing::info!("node stopped");
        }
    }

    pub async fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) -> SyncResult<()> {
        let inner = self.inner.lock().await.clone().ok_or(SyncError::NotStarted)?;
        inner.handlers.write().insert(protocol.to_string(), handler);
        Ok(())
    }

    /// Resolves `address` to a PeerID and opens (or reuses) a session.
    /// Rejects dialing this node's own address with `SelfDialError`.
    pub async fn dial(&self, address: &PeerAddress) -> SyncResult<PeerId> {
        let inner = self.active().await?;

        if address.peer_id == self.peer_id() {
            return Err(SyncError::SelfDial);
        }

        {
            let sessions = inner.sessions.lock().await;
            if sessions.contains_key(&address.peer_id) {
                return Ok(address.peer_id.clone());
            }
        }

        let endpoint_addr = address.to_endpoint_addr()?;
        let timeout = DIAL_TIMEOUT;
        let conn = tokio::time::timeout(timeout, inner.endpoint.connect(endpoint_addr, NODE_ALPN))
            .await
            .map_err(|_| SyncError::Timeout(timeout))?
            .map_err(|e| SyncError::Handshake(e.to_string()))?;

        let peer_id = address.peer_id.clone();
        self.adopt_session(&inner, peer_id.clone(), conn, false).await;
        Ok(peer_id)
    }

    /// Like `dial`, but with the longer timeout used for DHT bootstrap
    /// peers (spec §5: "20 seconds for DHT bootstrap peers").
    pub async fn dial_bootstrap(&self, address: &PeerAddress) -> SyncResult<PeerId> {
        let inner = self.active().await?;
        if address.peer_id == self.peer_id() {
            return Err(SyncError::SelfDial);
        }
        let endpoint_addr = address.to_endpoint_addr()?;
        let conn = tokio::time::timeout(DHT_DIAL_TIMEOUT, inner.endpoint.connect(endpoint_addr, NODE_ALPN))
            .await
            .map_err(|_| SyncError::Timeout(DHT_DIAL_TIMEOUT))?
            .map_err(|e| SyncError::Handshake(e.to_string()))?;
        let peer_id = address.peer_id.clone();
        self.adopt_session(&inner, peer_id.clone(), conn, false).await;
        Ok(peer_id)
    }

    /// Opens a bidirectional stream tagged with `protocol` over the live
    /// session with `peer_id`; callers must `dial` first. Every call gets
    /// its own QUIC stream — the session is reused, never a previous
    /// stream.
    pub async fn open_stream(&self, peer_id: &PeerId, protocol: &str) -> SyncResult<Stream> {
        let inner = self.active().await?;

        let conn = {
            let sessions = inner.sessions.lock().await;
            sessions.get(peer_id).map(|s| s.conn.clone())
        };
        let conn = conn.ok_or_else(|| SyncError::NotConnected(peer_id.to_string()))?;

        let (mut send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Handshake(e.to_string()))?;

        write_protocol_tag(&mut send, protocol).await?;

        Ok(Stream { send, recv, remote: peer_id.clone() })
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        match self.active().await {
            Ok(inner) => inner.sessions.lock().await.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn close_session(&self, peer_id: &PeerId) {
        if let Ok(inner) = self.active().await {
            let mut sessions = inner.sessions.lock().await;
            if let Some(session) = sessions.remove(peer_id) {
                session.conn.close(0u32.into(), b"disconnect requested");
            }
        }
    }

    pub async fn local_addresses(&self) -> SyncResult<Vec<PeerAddress>> {
        let inner = self.active().await?;
        let id = inner.endpoint.id();
        let addr = inner.endpoint.addr();
        Ok(vec![PeerAddress {
            peer_id: PeerId::from_endpoint_id(id),
            direct_addrs: addr.ip_addrs().copied().collect(),
            relay_url: addr.relay_url().map(|u| u.to_string()),
        }])
    }

    async fn active(&self) -> SyncResult<Arc<NodeInner>> {
        self.inner.lock().await.clone().ok_or(SyncError::NotStarted)
    }

    /// Records `conn` as the session for `peer_id`, applying the
    /// duplicate-connection tie-break (see [`adopt_session_inner`]).
    async fn adopt_session(&self, inner: &Arc<NodeInner>, peer_id: PeerId, conn: iroh::endpoint::Connection, incoming: bool) {
        adopt_session_inner(inner, &self.peer_id(), peer_id, conn, incoming).await;
    }
}

/// Records `conn` as the session for `peer_id`. If a session already
/// exists (both sides dialed concurrently), applies the teacher's
/// deterministic tie-break: the lower PeerID's outgoing connection wins,
/// the higher PeerID's incoming connection wins; the losing connection is
/// closed rather than tracked. Returns the generation this connection was
/// adopted under, or `None` if it was dropped as a duplicate — callers use
/// it to only evict their own entry on disconnect, never a newer one's
/// (`conn_gen`/`PeerEntry` in the teacher's `s2s.rs`).
async fn adopt_session_inner(
    inner: &Arc<NodeInner>,
    local: &PeerId,
    peer_id: PeerId,
    conn: iroh::endpoint::Connection,
    incoming: bool,
) -> Option<u64> {
    let gen = inner.conn_gen.fetch_add(1, Ordering::Relaxed);
    let mut sessions = inner.sessions.lock().await;
    if let Some(existing) = sessions.get(&peer_id) {
        if !keep_new_connection(local, &peer_id, incoming) {
            tracing::debug!(peer = %peer_id, incoming, "dropping duplicate connection, keeping existing session");
            conn.close(0u32.into(), b"duplicate connection");
            return None;
        }
        existing.conn.close(0u32.into(), b"superseded by newer connection");
    }
    sessions.insert(peer_id, Session { conn, gen });
    Some(gen)
}

/// Deterministic duplicate-connection tie-break (spec §5, modeled on the
/// teacher's S2S link handling): the peer with the lexicographically
/// lower PeerID keeps its outgoing connection, the other keeps its
/// incoming one.
fn keep_new_connection(local: &PeerId, remote: &PeerId, incoming: bool) -> bool {
    let local_is_lower = local.as_str() < remote.as_str();
    incoming != local_is_lower
}

async fn accept_loop(inner: Arc<NodeInner>) {
    loop {
        let incoming = match inner.endpoint.accept().await {
            Some(incoming) => incoming,
            None => {
                tracing::info!("node accept loop ended: endpoint closed");
                return;
            }
        };

        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("incoming connection failed: {e}");
                    return;
                }
            };

            // Route by ALPN, the way the teacher's `iroh.rs::start` routes
            // client vs S2S connections: gossip traffic never enters this
            // node's own protocol-tag mux or session table.
            if conn.alpn() == GOSSIP_ALPN {
                let gossip = inner.gossip.clone();
                tokio::spawn(async move {
                    if let Err(e) = gossip.handle_connection(conn).await {
                        tracing::warn!(error = %e, "gossip connection handling failed");
                    }
                });
                return;
            }

            let remote = PeerId::from_endpoint_id(conn.remote_id());
            let local = inner.local_peer_id.clone();
            let my_gen = match adopt_session_inner(&inner, &local, remote.clone(), conn.clone(), true).await {
                Some(gen) => gen,
                None => return,
            };
            loop {
                match conn.accept_bi().await {
                    Ok((send, mut recv)) => {
                        let remote = remote.clone();
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            let protocol = match read_protocol_tag(&mut recv).await {
                                Ok(p) => p,
                                Err(e) => {
                                    tracing::warn!(peer = %remote, "failed to read protocol tag: {e}");
                                    return;
                                }
                            };
                            let handler = inner.handlers.read().get(&protocol).cloned();
                            match handler {
                                Some(handler) => handler(Stream { send, recv, remote }),
                                None => tracing::warn!(peer = %remote, protocol, "no handler registered"),
                            }
                        });
                    }
                    Err(_) => break,
                }
            }

            let mut sessions = inner.sessions.lock().await;
            if sessions.get(&remote).is_some_and(|s| s.gen == my_gen) {
                sessions.remove(&remote);
                tracing::debug!(peer = %remote, gen = my_gen, "session closed");
            }
        });
    }
}

async fn write_protocol_tag(send: &mut iroh::endpoint::SendStream, protocol: &str) -> SyncResult<()> {
    let bytes = protocol.as_bytes();
    let len = bytes.len() as u16;
    send.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| SyncError::Handshake(e.to_string()))?;
    send.write_all(bytes)
        .await
        .map_err(|e| SyncError::Handshake(e.to_string()))?;
    Ok(())
}

async fn read_protocol_tag(recv: &mut iroh::endpoint::RecvStream) -> SyncResult<String> {
    let mut len_buf = [0u8; 2];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf)
        .await
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
    String::from_utf8(buf).map_err(|e| SyncError::Protocol(e.to_string()))
}
