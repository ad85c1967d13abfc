//! Error type shared by the sync engine.
//!
//! Every variant is recoverable: a session that hits one keeps running and
//! the caller decides whether to surface it. Capacity pressure (dedup
//! eviction, offline buffer overflow) is reported through `log::warn!`
//! instead of an error because the operation still succeeds.

use crate::diff::DiffError;
use crate::storage::StoreError;
use crate::transport::TransportError;

/// Errors produced by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Channel subscribe/publish/track failed.
    Transport(TransportError),
    /// A diff could not be applied or the rebuilt content failed its hash check.
    Integrity { path: String, reason: String },
    /// Remote version is too far behind the local one.
    StaleVersion { path: String, remote: u64, local: u64 },
    /// Input rejected before it reached the wire.
    Validation(String),
    /// The local role does not allow the operation.
    PermissionDenied(String),
    /// The reconnect budget ran out; the connection is now failed.
    ReconnectExhausted { attempts: u32 },
    /// A payload did not decode into the expected message.
    Protocol(String),
    /// Snapshot persistence failed.
    Storage(StoreError),
}

impl SyncError {
    /// Whether the session must be torn down. No variant requires it today.
    pub fn is_fatal(&self) -> bool {
        false
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Integrity { path, reason } => {
                write!(f, "Integrity failure on {path}: {reason}")
            }
            Self::StaleVersion { path, remote, local } => write!(
                f,
                "Stale update for {path}: remote version {remote}, local version {local}"
            ),
            Self::Validation(msg) => write!(f, "Validation error: {msg}"),
            Self::PermissionDenied(msg) => write!(f, "Permission denied: {msg}"),
            Self::ReconnectExhausted { attempts } => {
                write!(f, "Reconnect gave up after {attempts} attempts")
            }
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Storage(e) => write!(f, "Storage error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

impl From<DiffError> for SyncError {
    fn from(e: DiffError) -> Self {
        Self::Integrity {
            path: String::new(),
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
