//! Paired-only discovery (spec §4.2): emits only peers already present
//! in the paired-device registry, consulting no external network beyond
//! the connectivity attempts the Sync Manager makes afterward.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{DiscoveredCallback, DiscoveryService};
use crate::error::SyncResult;
use crate::types::PeerInfo;

pub struct PairedDiscovery {
    known: Mutex<Vec<PeerInfo>>,
}

impl PairedDiscovery {
    pub const NAME: &'static str = "paired";

    pub fn new() -> Self {
        PairedDiscovery { known: Mutex::new(Vec::new()) }
    }

    /// Called by the pairing subsystem whenever the paired-device set
    /// changes. Each entry must already carry the addresses the device
    /// was last seen at; this mechanism does no address resolution of
    /// its own.
    pub fn set_known(&self, devices: Vec<PeerInfo>) {
        *self.known.lock() = devices;
    }
}

#[async_trait::async_trait]
impl DiscoveryService for PairedDiscovery {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn start(self: Arc<Self>, on_discovered: DiscoveredCallback) -> SyncResult<()> {
        for info in self.known.lock().iter().cloned() {
            on_discovered(info);
        }
        Ok(())
    }

    async fn stop(&self) {}
}
