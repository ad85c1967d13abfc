//! # fade-collab — Real-time collaborative file sync
//!
//! Keeps a shared set of text files consistent across participants of a
//! session, with presence, cursors, typing indicators and roles on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐                      ┌──────────────────────┐
//! │ SyncSession (user A) │                      │ SyncSession (user B) │
//! │  ├ SyncStrategy      │   topic session:CODE │  ├ SyncStrategy      │
//! │  ├ Deduplicator      │ ◄──────────────────► │  ├ Deduplicator      │
//! │  ├ PresenceTracker   │   Transport          │  ├ PresenceTracker   │
//! │  └ ConnectionManager │  (LocalHub / relay)  │  └ ConnectionManager │
//! │      └ OfflineBuffer │                      │      └ OfflineBuffer │
//! └──────────┬───────────┘                      └──────────────────────┘
//!            │ owner saves                ┌────────────────────┐
//!            └──────────────────────────► │ SnapshotStore      │ ◄── joiners load
//!                                         └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`diff`] — line/char diffs, size policy, content hashes
//! - [`strategy`] — diff vs. CRDT (Yrs) sync strategies
//! - [`dedup`] — windowed duplicate suppression
//! - [`offline`] — bounded FIFO of changes made while disconnected
//! - [`presence`] — participants, cursors, typing
//! - [`connection`] — channel lifecycle, heartbeats, reconnect backoff
//! - [`session`] — the sync state machine tying the above together
//! - [`runtime`] — tokio task driving a session
//! - [`transport`] — in-process hub and WebSocket client
//! - [`relay`] — WebSocket relay server
//! - [`storage`] — project snapshots (memory, RocksDB)

pub mod clock;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod diff;
pub mod error;
pub mod events;
pub mod offline;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod strategy;
pub mod transport;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, NoSleep, Sleep, TokioClock, TokioSleep};
pub use config::{
    ConnectionConfig, DiffConfig, PresenceConfig, SessionLimits, StrategyKind, SyncConfig,
};
pub use connection::{ConnectionManager, ConnectionState, Delivery};
pub use dedup::MessageDeduplicator;
pub use diff::{
    apply_diff, compute_diff, content_hash, DiffEnvelope, DiffError, DiffKind, DiffPayload,
};
pub use error::SyncError;
pub use events::{EventBus, FileChanged, IntegrityFailure, RoleChanged, StatusChange};
pub use offline::{FlushReport, OfflineBuffer};
pub use presence::PresenceTracker;
pub use protocol::{
    ChangeMessage, CursorPosition, CursorState, Participant, PresenceDiff, PresenceEntry, Role,
    Selection,
};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use runtime::SessionHandle;
pub use session::{
    DocumentState, RemoteOutcome, SessionDeps, SessionInfo, SyncSession, SyncStats,
};
pub use storage::{
    MemorySnapshotStore, ProjectSnapshot, RocksSnapshotStore, SnapshotStore, StoreConfig,
    StoreError,
};
pub use strategy::{CrdtStrategy, DiffStrategy, SyncStrategy};
pub use transport::{
    ChannelStatus, LocalHub, LocalTransport, Subscription, Transport, TransportError,
    TransportEvent, WsTransport,
};
