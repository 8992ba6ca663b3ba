//! Core peer-to-peer clipboard sync subsystem: node identity and
//! transport, peer discovery, mutual-trust pairing, and group-scoped
//! content fan-out.
//!
//! The clipboard capture/paste backends, the history database, the
//! command-line interface, log rotation, and platform daemonization all
//! live outside this crate; it exposes [`SyncManager`] as the single
//! entry point the daemon composes them around.

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod manager;
pub mod node;
pub mod pairing;
pub mod persistence;
pub mod reconnect;
pub mod transport;
pub mod types;

pub use config::{DiscoveryMethod, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use identity::{Identity, PeerId};
pub use manager::SyncManager;
pub use pairing::PairingCallback;
pub use transport::{ContentFilter, ContentHandler};
pub use types::{
    ClipboardPayload, ContentType, DeviceType, PairedDevice, PairingRequest, PairingResponse,
    PeerAddress, PeerInfo,
};
