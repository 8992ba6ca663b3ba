//! Core data types shared across the sync subsystem (spec §3).
//!
//! These are the one-per-concept in-core types the design calls for —
//! transport-library types (`iroh::EndpointAddr`, `iroh::EndpointId`) are
//! translated into these at module boundaries, never leaked through the
//! `SyncManager` API.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GroupName, SyncError, SyncResult};
use crate::identity::PeerId;

/// What kind of device a peer is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Server,
    Unknown,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Unknown
    }
}

/// A self-describing multi-component address: a set of directly dialable
/// socket addresses plus an optional relay fallback, scoped to a PeerID.
/// Serializes to/from a single string of the form
/// `peer/<peer_id>[/ip/<addr>]*[/relay/<url>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub direct_addrs: BTreeSet<SocketAddr>,
    pub relay_url: Option<String>,
}

impl PeerAddress {
    pub(crate) fn from_endpoint_addr(addr: &iroh::EndpointAddr) -> Self {
        PeerAddress {
            peer_id: PeerId::from_endpoint_id(addr.id),
            direct_addrs: addr.ip_addrs().copied().collect(),
            relay_url: addr.relay_url().map(|u| u.to_string()),
        }
    }

    pub(crate) fn to_endpoint_addr(&self) -> SyncResult<iroh::EndpointAddr> {
        let id = self.peer_id.to_endpoint_id()?;
        let mut addr = iroh::EndpointAddr::new(id);
        if !self.direct_addrs.is_empty() {
            addr = addr.with_ip_addrs(self.direct_addrs.iter().copied());
        }
        if let Some(ref relay) = self.relay_url {
            if let Ok(url) = relay.parse() {
                addr = addr.with_relay_url(url);
            }
        }
        Ok(addr)
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer/{}", self.peer_id)?;
        for addr in &self.direct_addrs {
            write!(f, "/ip/{addr}")?;
        }
        if let Some(ref relay) = self.relay_url {
            write!(f, "/relay/{relay}")?;
        }
        Ok(())
    }
}

impl FromStr for PeerAddress {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        let mut parts = s.split('/').filter(|p| !p.is_empty());
        let mut peer_id = None;
        let mut direct_addrs = BTreeSet::new();
        let mut relay_url = None;

        while let Some(tag) = parts.next() {
            let value = parts
                .next()
                .ok_or_else(|| SyncError::Protocol(format!("malformed address: {s}")))?;
            match tag {
                "peer" => peer_id = Some(value.parse()?),
                "ip" => {
                    let addr: SocketAddr = value
                        .parse()
                        .map_err(|e| SyncError::Protocol(format!("bad ip component {value}: {e}")))?;
                    direct_addrs.insert(addr);
                }
                "relay" => relay_url = Some(value.to_string()),
                other => {
                    return Err(SyncError::Protocol(format!("unknown address component: {other}")))
                }
            }
        }

        let peer_id = peer_id.ok_or_else(|| SyncError::Protocol(format!("address missing peer id: {s}")))?;
        Ok(PeerAddress { peer_id, direct_addrs, relay_url })
    }
}

impl Serialize for PeerAddress {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A discovery record: what the discovery pipeline knows about a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub name: String,
    pub device_type: DeviceType,
    /// Non-empty per §3's invariant; enforced by constructors, not serde.
    pub addresses: Vec<PeerAddress>,
    #[serde(default)]
    pub groups: Vec<GroupName>,
    #[serde(default)]
    pub capabilities: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub version: String,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

impl PeerInfo {
    pub fn is_valid(&self) -> bool {
        !self.addresses.is_empty()
    }
}

/// A trust record: a peer this node has completed pairing with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub peer_id: PeerId,
    pub display_name: String,
    pub device_type: DeviceType,
    pub paired_at: chrono::DateTime<chrono::Utc>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// Wire request opening a pairing exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    pub peer_id: PeerId,
    pub device_name: String,
    pub device_type: DeviceType,
}

/// Wire response closing a pairing exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PairingResponse {
    pub fn reject(reason: impl Into<String>) -> Self {
        PairingResponse {
            accepted: false,
            pairing_code: None,
            device_name: None,
            device_type: None,
            peer_id: None,
            error: Some(reason.into()),
        }
    }
}

/// Content carried by a clipboard payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Text,
    Image,
    FileReference,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::FileReference => "file-reference",
        }
    }
}

/// A clipboard item in flight between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardPayload {
    pub content_type: ContentType,
    pub bytes: Vec<u8>,
    /// Collision-resistant hash over `bytes`; equal fingerprints imply
    /// equal content (§3 invariant).
    pub fingerprint: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub group: Option<GroupName>,
    #[serde(default)]
    pub source: Option<PeerId>,
}

impl ClipboardPayload {
    pub fn new(content_type: ContentType, bytes: Vec<u8>) -> Self {
        let fingerprint = fingerprint(&bytes);
        ClipboardPayload {
            content_type,
            bytes,
            fingerprint,
            timestamp: chrono::Utc::now(),
            group: None,
            source: None,
        }
    }
}

pub fn fingerprint(bytes: &[u8]) -> String {
    use sha2::Digest;
    let digest = sha2::Sha256::digest(bytes);
    hex_encode(&digest)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_address_round_trips_through_display_and_parse() {
        let key = iroh::SecretKey::from_bytes(&[7u8; 32]);
        let peer_id = PeerId::from_endpoint_id(key.public().into());
        let addr = PeerAddress {
            peer_id,
            direct_addrs: [("127.0.0.1:4001".parse().unwrap())].into_iter().collect(),
            relay_url: None,
        };
        let s = addr.to_string();
        let parsed: PeerAddress = s.parse().unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn equal_fingerprints_imply_equal_content() {
        let a = fingerprint(b"hello");
        let b = fingerprint(b"hello");
        let c = fingerprint(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
