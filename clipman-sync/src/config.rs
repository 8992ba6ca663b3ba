//! Effective sync configuration (spec §6, "core-relevant subset").
//!
//! Loaded from TOML the way the teacher's binaries load their own server
//! config. `SyncConfig::get_config()`-style snapshots are cheap clones —
//! callers never get a handle into the live value.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    Paired,
    Mdns,
    Dht,
    Manual,
}

impl Default for DiscoveryMethod {
    fn default() -> Self {
        DiscoveryMethod::Paired
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub sync_over_internet: bool,
    pub use_relay_nodes: bool,
    /// 0 = ephemeral.
    pub listen_port: u16,
    pub peer_identity: Option<String>,
    pub discovery_method: DiscoveryMethod,
    pub persist_discovered_peers: bool,
    pub discovered_peers_path: Option<PathBuf>,
    pub auto_reconnect_to_peers: bool,
    pub max_stored_peers: usize,
    pub dht_bootstrap_peers: Vec<String>,
    pub dht_server_mode: bool,
    pub dht_persistent_storage: bool,
    pub pairing_enabled: bool,
    /// 0 = no timeout.
    pub pairing_timeout_seconds: u64,
    pub require_verification: bool,
    pub device_name: String,
    pub device_type: crate::types::DeviceType,
    pub allow_only_known_peers: bool,
    pub trusted_peers: Vec<PeerId>,
    pub disable_multiplexing: bool,
    pub force_direct_connection_only: bool,
    pub default_groups: Vec<String>,
    pub data_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            enabled: true,
            sync_over_internet: false,
            use_relay_nodes: true,
            listen_port: 0,
            peer_identity: None,
            discovery_method: DiscoveryMethod::default(),
            persist_discovered_peers: true,
            discovered_peers_path: None,
            auto_reconnect_to_peers: true,
            max_stored_peers: 200,
            dht_bootstrap_peers: Vec::new(),
            dht_server_mode: false,
            dht_persistent_storage: false,
            pairing_enabled: false,
            pairing_timeout_seconds: 30,
            require_verification: true,
            device_name: "clipman-device".to_string(),
            device_type: crate::types::DeviceType::Unknown,
            allow_only_known_peers: false,
            trusted_peers: Vec::new(),
            disable_multiplexing: false,
            force_direct_connection_only: false,
            default_groups: Vec::new(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("clipman")
}

impl SyncConfig {
    pub fn from_toml_str(s: &str) -> SyncResult<Self> {
        let config: SyncConfig = toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> SyncResult<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&s)
    }

    pub fn identity_key_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    pub fn paired_devices_path(&self) -> PathBuf {
        self.data_dir.join("paired_devices.json")
    }

    pub fn known_peers_path(&self) -> PathBuf {
        self.discovered_peers_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("known_peers.json"))
    }

    pub fn ipc_socket_path(&self) -> PathBuf {
        self.data_dir.join("sockets").join("clipman-sync.sock")
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.max_stored_peers == 0 {
            return Err(SyncError::Config("max_stored_peers must be non-zero".into()));
        }
        if self.discovery_method == DiscoveryMethod::Dht
            && self.dht_bootstrap_peers.is_empty()
            && !self.dht_server_mode
        {
            return Err(SyncError::Config(
                "dht discovery requires dht_bootstrap_peers or dht_server_mode".into(),
            ));
        }
        if self.allow_only_known_peers && self.trusted_peers.is_empty() {
            return Err(SyncError::Config(
                "allow_only_known_peers requires a non-empty trusted_peers list".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn dht_without_bootstrap_or_server_mode_is_rejected() {
        let mut config = SyncConfig::default();
        config.discovery_method = DiscoveryMethod::Dht;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let config = SyncConfig::from_toml_str(
            r#"
            device_name = "laptop"
            discovery_method = "mdns"
            "#,
        )
        .unwrap();
        assert_eq!(config.device_name, "laptop");
        assert_eq!(config.discovery_method, DiscoveryMethod::Mdns);
    }
}
