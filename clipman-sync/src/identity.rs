//! Node identity: the long-lived key pair and the PeerID derived from it.
//!
//! Mirrors the teacher's `load_or_create_secret_key` in spirit (persist a
//! hex-encoded secret key on first run, reuse it after), generalized to
//! also accept an identity blob supplied directly by configuration.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

/// Opaque, stable, display-safe identifier for a peer. Derived
/// deterministically from the peer's public identity key (§3: PeerID
/// uniquely identifies a peer across the process lifetime and restarts).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_endpoint_id(id: iroh::EndpointId) -> Self {
        PeerId(id.to_string())
    }

    pub(crate) fn to_endpoint_id(&self) -> SyncResult<iroh::EndpointId> {
        self.0
            .parse()
            .map_err(|e| SyncError::Protocol(format!("malformed peer id {}: {e}", self.0)))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = SyncError;

    fn from_str(s: &str) -> SyncResult<Self> {
        let _: iroh::EndpointId = s
            .parse()
            .map_err(|e| SyncError::Protocol(format!("malformed peer id {s}: {e}")))?;
        Ok(PeerId(s.to_string()))
    }
}

/// The node's long-lived asymmetric key pair.
pub struct Identity {
    secret_key: iroh::SecretKey,
}

impl Identity {
    /// Load the identity named by `peer_identity` (a hex-encoded secret
    /// key blob, as produced by `export`), or load/generate one persisted
    /// at `key_path`. Fails with `SyncError::Identity` if a supplied blob
    /// is malformed.
    pub fn load_or_create(
        peer_identity: Option<&str>,
        key_path: &Path,
    ) -> SyncResult<Self> {
        if let Some(blob) = peer_identity {
            let secret_key = parse_secret_key(blob)?;
            return Ok(Identity { secret_key });
        }

        if key_path.exists() {
            let hex = std::fs::read_to_string(key_path)
                .map_err(|e| SyncError::Identity(format!("reading {}: {e}", key_path.display())))?;
            let secret_key = parse_secret_key(hex.trim())?;
            return Ok(Identity { secret_key });
        }

        let secret_key = generate_secret_key();
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::Identity(format!("creating {}: {e}", parent.display())))?;
        }
        std::fs::write(key_path, encode_secret_key(&secret_key))
            .map_err(|e| SyncError::Identity(format!("writing {}: {e}", key_path.display())))?;
        tracing::info!(path = %key_path.display(), "generated new node identity");
        Ok(Identity { secret_key })
    }

    /// Wraps an already-derived secret key, e.g. one shared from another
    /// networking surface under the same identity.
    pub fn from_secret_key(secret_key: iroh::SecretKey) -> Self {
        Identity { secret_key }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_endpoint_id(self.secret_key.public().into())
    }

    pub fn secret_key(&self) -> iroh::SecretKey {
        self.secret_key.clone()
    }

    /// Export the identity as an opaque hex blob suitable for
    /// `peer_identity` in configuration.
    pub fn export(&self) -> String {
        encode_secret_key(&self.secret_key)
    }
}

fn generate_secret_key() -> iroh::SecretKey {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    iroh::SecretKey::from_bytes(&bytes)
}

fn encode_secret_key(key: &iroh::SecretKey) -> String {
    key.to_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_secret_key(hex: &str) -> SyncResult<iroh::SecretKey> {
    if hex.len() != 64 {
        return Err(SyncError::Identity(format!(
            "identity blob must be 64 hex chars, got {}",
            hex.len()
        )));
    }
    let mut bytes = [0u8; 32];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|e| SyncError::Identity(format!("invalid identity blob: {e}")))?;
    }
    Ok(iroh::SecretKey::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_round_trips_through_export() {
        let key = generate_secret_key();
        let hex = encode_secret_key(&key);
        let parsed = parse_secret_key(&hex).unwrap();
        assert_eq!(key.to_bytes(), parsed.to_bytes());
    }

    #[test]
    fn peer_id_is_stable_across_reconstruction() {
        let key = generate_secret_key();
        let a = PeerId::from_endpoint_id(key.public().into());
        let b = PeerId::from_endpoint_id(key.public().into());
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_malformed_identity_blob() {
        assert!(parse_secret_key("not-hex").is_err());
        assert!(parse_secret_key("abcd").is_err());
    }
}
