//! Project persistence.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  save_snapshot  ┌────────────────────┐
//! │ SyncSession │ ──────────────► │ SnapshotStore      │
//! │ (owner)     │                 │  ├ MemorySnapshot… │
//! └──────┬──────┘                 │  └ RocksSnapshot…  │
//!        │ join: load by code     └─────────┬──────────┘
//!        ▼                                  │ column families
//! ┌─────────────┐         ┌─────────────────────────────────────────┐
//! │ seeded docs │         │ CF "snapshots" (bincode + LZ4 payload)   │
//! └─────────────┘         │ CF "metadata"  (sizes, file count, time) │
//!                         └─────────────────────────────────────────┘
//! ```
//!
//! Snapshots are keyed by session code. Only the owner writes; joiners read
//! the latest snapshot once when they join.

pub mod memory;
pub mod rocks;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, SnapshotMetadata, StoreConfig};

/// Files and image references of a project at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub session_name: String,
    /// path → content
    pub files: BTreeMap<String, String>,
    pub images: Vec<String>,
    /// Milliseconds since the Unix epoch.
    pub saved_at: u64,
}

impl ProjectSnapshot {
    /// Total bytes of file content.
    pub fn content_size(&self) -> usize {
        self.files.values().map(String::len).sum()
    }
}

/// Durable home of project snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace the snapshot for `code`.
    fn save(&self, code: &str, snapshot: &ProjectSnapshot) -> Result<(), StoreError>;

    fn load(&self, code: &str) -> Result<Option<ProjectSnapshot>, StoreError>;

    /// Returns whether a snapshot was removed.
    fn delete(&self, code: &str) -> Result<bool, StoreError>;

    /// Stored session codes, sorted.
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
