//! Shared helpers for the integration tests below: each test builds one
//! or more `SyncManager`s backed by a throwaway data directory and
//! manual discovery, with relays disabled so connections stay on the
//! loopback interface.

use clipman_sync::{DiscoveryMethod, SyncConfig};
use std::path::Path;

pub fn config_at(data_dir: &Path, device_name: &str) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.data_dir = data_dir.to_path_buf();
    config.device_name = device_name.to_string();
    config.use_relay_nodes = false;
    config.discovery_method = DiscoveryMethod::Manual;
    config.persist_discovered_peers = false;
    config.pairing_timeout_seconds = 5;
    config
}
