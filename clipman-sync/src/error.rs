//! Error kinds surfaced across the sync core.
//!
//! One enum for everything named in the design's error-handling section:
//! start-up failures are fatal, API-usage errors are returned never
//! panicked, and transient network errors are retryable. `FilterRejected`
//! has no variant here on purpose — a filtered publish returns `Ok(())`.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("failed to bind listener: {0}")]
    Bind(String),

    #[error("sync manager not started")]
    NotStarted,

    #[error("sync manager already started")]
    AlreadyStarted,

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("refused to dial self")]
    SelfDial,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("not connected to peer {0}")]
    NotConnected(String),

    #[error("group {0:?} has not been joined")]
    NotJoined(GroupName),

    #[error("peer {0} is not paired")]
    NotPaired(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// A group name, newtyped so error messages and topic derivation can't
/// mix it up with an arbitrary string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct GroupName(pub String);

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GroupName {
    fn from(s: &str) -> Self {
        GroupName(s.to_string())
    }
}

impl From<String> for GroupName {
    fn from(s: String) -> Self {
        GroupName(s)
    }
}
