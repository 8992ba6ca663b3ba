//! Pairing Subsystem (spec §4.3): mutual, user-confirmed trust between
//! two devices, and the persisted paired-device registry.
//!
//! The wire exchange follows the teacher's `s2s.rs` style: one
//! newline-delimited JSON message per direction over a dedicated
//! protocol-tagged stream, rather than a length-prefixed binary frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{SyncError, SyncResult};
use crate::identity::PeerId;
use crate::node::Node;
use crate::persistence;
use crate::types::{DeviceType, PairedDevice, PairingRequest, PairingResponse};

pub const PAIRING_PROTOCOL: &str = "/clipman/1.0.0/pairing";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Disabled,
    Listening,
    Terminating,
}

/// Returns `true` to accept a pairing request from `remote_peer_id`.
pub type PairingCallback = Arc<dyn Fn(&PairingRequest, &PeerId) -> bool + Send + Sync>;

struct Machine {
    state: PairingState,
    callback: Option<PairingCallback>,
    timeout_task: Option<JoinHandle<()>>,
}

pub struct PairingSubsystem {
    node: Arc<Node>,
    device_name: String,
    device_type: DeviceType,
    pairing_timeout: Duration,
    registry_path: std::path::PathBuf,
    machine: Arc<Mutex<Machine>>,
    paired: Arc<Mutex<HashMap<PeerId, PairedDevice>>>,
}

impl PairingSubsystem {
    pub fn new(
        node: Arc<Node>,
        device_name: String,
        device_type: DeviceType,
        pairing_timeout_seconds: u64,
        registry_path: std::path::PathBuf,
    ) -> Self {
        let pairing_timeout = if pairing_timeout_seconds == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_secs(pairing_timeout_seconds)
        };

        PairingSubsystem {
            node,
            device_name,
            device_type,
            pairing_timeout,
            registry_path,
            machine: Arc::new(Mutex::new(Machine {
                state: PairingState::Disabled,
                callback: None,
                timeout_task: None,
            })),
            paired: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Loads the persisted registry and installs the stream handler that
    /// answers incoming pairing requests. Does not itself start
    /// listening — that's `enable_pairing`.
    pub async fn start(&self) -> SyncResult<()> {
        let loaded: Vec<PairedDevice> = persistence::read_json_or_default(&self.registry_path)?;
        let mut paired = self.paired.lock().await;
        for device in loaded {
            paired.insert(device.peer_id.clone(), device);
        }
        drop(paired);

        let machine = Arc::clone(&self.machine);
        let paired = Arc::clone(&self.paired);
        let registry_path = self.registry_path.clone();
        let device_name = self.device_name.clone();
        let device_type = self.device_type;
        let local_peer_id = self.node.peer_id();

        self.node
            .set_stream_handler(
                PAIRING_PROTOCOL,
                Arc::new(move |stream: crate::node::Stream| {
                    let machine = Arc::clone(&machine);
                    let paired = Arc::clone(&paired);
                    let registry_path = registry_path.clone();
                    let device_name = device_name.clone();
                    let local_peer_id = local_peer_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_incoming(
                            stream,
                            machine,
                            paired,
                            &registry_path,
                            &device_name,
                            device_type,
                            &local_peer_id,
                        )
                        .await
                        {
                            tracing::warn!(error = %e, "pairing exchange failed");
                        }
                    });
                }),
            )
            .await?;
        Ok(())
    }

    /// Returns the address remote peers should dial to reach this
    /// node's pairing endpoint (spec §4.3: `enable_pairing(callback) →
    /// advertised_address`).
    pub async fn enable_pairing(
        &self,
        callback: PairingCallback,
        timeout: Option<Duration>,
    ) -> SyncResult<crate::types::PeerAddress> {
        let mut machine = self.machine.lock().await;
        if let Some(task) = machine.timeout_task.take() {
            task.abort();
        }
        machine.state = PairingState::Listening;
        machine.callback = Some(callback);

        if let Some(timeout) = timeout {
            let machine_ref = Arc::clone(&self.machine);
            machine.timeout_task = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let mut machine = machine_ref.lock().await;
                if machine.state == PairingState::Listening {
                    machine.state = PairingState::Disabled;
                    machine.callback = None;
                    tracing::info!("pairing window expired");
                }
            }));
        }
        drop(machine);

        let addresses = self.node.local_addresses().await?;
        addresses
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Protocol("node has no advertisable address".into()))
    }

    pub async fn disable_pairing(&self) {
        let mut machine = self.machine.lock().await;
        if let Some(task) = machine.timeout_task.take() {
            task.abort();
        }
        machine.state = PairingState::Disabled;
        machine.callback = None;
    }

    pub async fn is_pairing_enabled(&self) -> bool {
        self.machine.lock().await.state == PairingState::Listening
    }

    pub async fn request_pairing(&self, address: &crate::types::PeerAddress) -> SyncResult<PairingResponse> {
        let peer_id = self.node.dial(address).await?;
        let stream = self.node.open_stream(&peer_id, PAIRING_PROTOCOL).await?;
        let crate::node::Stream { send, recv, .. } = stream;

        let request = PairingRequest {
            peer_id: self.node.peer_id(),
            device_name: self.device_name.clone(),
            device_type: self.device_type,
        };

        let exchange = async move {
            let mut send = send;
            let mut line = serde_json::to_vec(&request)
                .map_err(|e| SyncError::Protocol(format!("request encode failed: {e}")))?;
            line.push(b'\n');
            send.write_all(&line)
                .await
                .map_err(|e| SyncError::Handshake(e.to_string()))?;

            let mut reader = BufReader::new(recv);
            let mut response_line = String::new();
            reader
                .read_line(&mut response_line)
                .await
                .map_err(|e| SyncError::Handshake(e.to_string()))?;
            if response_line.is_empty() {
                return Err(SyncError::Handshake("peer closed pairing stream".into()));
            }
            serde_json::from_str::<PairingResponse>(&response_line)
                .map_err(|e| SyncError::Protocol(format!("response decode failed: {e}")))
        };

        let response = tokio::time::timeout(self.pairing_timeout, exchange)
            .await
            .map_err(|_| SyncError::Timeout(self.pairing_timeout))??;

        if response.accepted {
            if let Some(peer_id) = &response.peer_id {
                let device = PairedDevice {
                    peer_id: peer_id.clone(),
                    display_name: response.device_name.clone().unwrap_or_default(),
                    device_type: response.device_type.unwrap_or(DeviceType::Unknown),
                    paired_at: chrono::Utc::now(),
                    last_seen: chrono::Utc::now(),
                };
                self.record_paired_device(device).await?;
            }
        }
        Ok(response)
    }

    pub async fn is_paired(&self, peer_id: &PeerId) -> bool {
        self.paired.lock().await.contains_key(peer_id)
    }

    pub async fn paired_devices(&self) -> Vec<PairedDevice> {
        self.paired.lock().await.values().cloned().collect()
    }

    /// Idempotent: removing an unpaired PeerID is a no-op success.
    pub async fn remove_paired_device(&self, peer_id: &PeerId) -> SyncResult<()> {
        let mut paired = self.paired.lock().await;
        paired.remove(peer_id);
        let devices: Vec<PairedDevice> = paired.values().cloned().collect();
        persistence::write_json_atomic(&self.registry_path, &devices)
    }

    async fn record_paired_device(&self, device: PairedDevice) -> SyncResult<()> {
        let mut paired = self.paired.lock().await;
        paired.insert(device.peer_id.clone(), device);
        let devices: Vec<PairedDevice> = paired.values().cloned().collect();
        persistence::write_json_atomic(&self.registry_path, &devices)
    }
}

async fn handle_incoming(
    stream: crate::node::Stream,
    machine: Arc<Mutex<Machine>>,
    paired: Arc<Mutex<HashMap<PeerId, PairedDevice>>>,
    registry_path: &std::path::Path,
    device_name: &str,
    device_type: DeviceType,
    local_peer_id: &PeerId,
) -> SyncResult<()> {
    let crate::node::Stream { send, recv, remote } = stream;
    let mut send = send;
    let mut reader = BufReader::new(recv);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| SyncError::Handshake(e.to_string()))?;
    let request: PairingRequest = serde_json::from_str(&line)
        .map_err(|e| SyncError::Protocol(format!("request decode failed: {e}")))?;

    if request.peer_id != remote {
        return Err(SyncError::Protocol(format!(
            "pairing request peer_id {} does not match connection identity {remote}",
            request.peer_id
        )));
    }

    let mut machine_guard = machine.lock().await;
    if machine_guard.state != PairingState::Listening {
        drop(machine_guard);
        return write_response(&mut send, PairingResponse::reject("pairing disabled")).await;
    }
    let callback = machine_guard.callback.clone();
    drop(machine_guard);

    let accept = match callback {
        Some(cb) => cb(&request, &remote),
        None => false,
    };

    if !accept {
        return write_response(&mut send, PairingResponse::reject("rejected by user")).await;
    }

    let pairing_code = verification_code(local_peer_id, &remote);
    let device = PairedDevice {
        peer_id: remote.clone(),
        display_name: request.device_name.clone(),
        device_type: request.device_type,
        paired_at: chrono::Utc::now(),
        last_seen: chrono::Utc::now(),
    };

    {
        let mut paired = paired.lock().await;
        paired.insert(device.peer_id.clone(), device);
        let devices: Vec<PairedDevice> = paired.values().cloned().collect();
        persistence::write_json_atomic(registry_path, &devices)?;
    }

    write_response(
        &mut send,
        PairingResponse {
            accepted: true,
            pairing_code: Some(pairing_code),
            device_name: Some(device_name.to_string()),
            device_type: Some(device_type),
            peer_id: Some(local_peer_id.clone()),
            error: None,
        },
    )
    .await
}

async fn write_response(
    send: &mut iroh::endpoint::SendStream,
    response: PairingResponse,
) -> SyncResult<()> {
    let mut line = serde_json::to_vec(&response)
        .map_err(|e| SyncError::Protocol(format!("response encode failed: {e}")))?;
    line.push(b'\n');
    send.write_all(&line)
        .await
        .map_err(|e| SyncError::Handshake(e.to_string()))
}

/// Deterministic 6-digit code from the lexicographically sorted PeerID
/// pair, so both ends compute the same value (spec §4.3).
pub fn verification_code(a: &PeerId, b: &PeerId) -> String {
    use sha2::Digest;
    let (lo, hi) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
    let mut hasher = sha2::Sha256::new();
    hasher.update(lo.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(hi.as_str().as_bytes());
    let digest = hasher.finalize();
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:06}", n % 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_code_is_order_independent() {
        let key_a = iroh::SecretKey::from_bytes(&[1u8; 32]);
        let key_b = iroh::SecretKey::from_bytes(&[2u8; 32]);
        let a = PeerId::from_endpoint_id(key_a.public().into());
        let b = PeerId::from_endpoint_id(key_b.public().into());

        assert_eq!(verification_code(&a, &b), verification_code(&b, &a));
    }

    #[test]
    fn verification_code_is_six_digits() {
        let key_a = iroh::SecretKey::from_bytes(&[3u8; 32]);
        let key_b = iroh::SecretKey::from_bytes(&[4u8; 32]);
        let a = PeerId::from_endpoint_id(key_a.public().into());
        let b = PeerId::from_endpoint_id(key_b.public().into());
        assert_eq!(verification_code(&a, &b).len(), 6);
    }
}
