//! Tunables for a sync session.
//!
//! Defaults reproduce the production behaviour: full content under 500
//! bytes, 10 s heartbeats, five reconnect attempts capped at 30 s, a 100 ms
//! cursor batch window and a 2 s typing timeout.

use std::time::Duration;

use crate::error::SyncError;
use crate::protocol::Role;

/// Diff engine thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffConfig {
    /// New content shorter than this (in bytes) is always sent in full.
    pub full_threshold: usize,
    /// A serialized diff larger than this falls back to full content.
    pub max_diff_size: usize,
    /// How far ahead the line differ looks for a re-synchronizing line.
    pub lookahead: usize,
    /// Longest line (in chars) eligible for a character-level diff.
    pub char_diff_max_line: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            full_threshold: 500,
            max_diff_size: 10_000,
            lookahead: 10,
            char_diff_max_line: 200,
        }
    }
}

/// Connection lifecycle settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Offline buffer capacity; the oldest entry is evicted beyond it.
    pub offline_capacity: usize,
    /// Pause between consecutive offline flush sends.
    pub flush_delay: Duration,
    /// Capacity of the transport subscription channel.
    pub channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            offline_capacity: 100,
            flush_delay: Duration::from_millis(50),
            channel_capacity: 256,
        }
    }
}

/// Presence and awareness timing.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceConfig {
    pub cursor_batch_window: Duration,
    pub typing_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            cursor_batch_window: Duration::from_millis(100),
            typing_timeout: Duration::from_secs(2),
        }
    }
}

/// Input limits checked at session creation and on every local change.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionLimits {
    pub max_user_name: usize,
    pub max_session_name: usize,
    pub max_path: usize,
    pub session_code_len: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_user_name: 50,
            max_session_name: 100,
            max_path: 1024,
            session_code_len: 5,
        }
    }
}

/// Which sync strategy a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    /// Line/char diffs with content hashes.
    #[default]
    Diff,
    /// Yrs document updates.
    Crdt,
}

/// Complete session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub diff: DiffConfig,
    pub connection: ConnectionConfig,
    pub presence: PresenceConfig,
    pub limits: SessionLimits,
    pub strategy: StrategyKind,
    /// Remote changes more than this many versions behind are rejected.
    pub staleness_threshold: u64,
    /// Local edits inside this window after a remote apply are not rebroadcast.
    pub remote_echo_window: Duration,
    pub dedup_window: Duration,
    pub dedup_capacity: usize,
    /// Capacity of each event broadcast channel.
    pub event_capacity: usize,
    /// Role given to participants joining an existing session.
    pub default_join_role: Role,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            diff: DiffConfig::default(),
            connection: ConnectionConfig::default(),
            presence: PresenceConfig::default(),
            limits: SessionLimits::default(),
            strategy: StrategyKind::Diff,
            staleness_threshold: 5,
            remote_echo_window: Duration::from_millis(100),
            dedup_window: Duration::from_secs(60),
            dedup_capacity: 1000,
            event_capacity: 64,
            default_join_role: Role::Editor,
        }
    }
}

impl SyncConfig {
    /// Same as the default but with the CRDT strategy selected.
    pub fn crdt() -> Self {
        Self {
            strategy: StrategyKind::Crdt,
            ..Self::default()
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.connection.heartbeat_interval.is_zero() {
            return Err(SyncError::Validation(
                "heartbeat interval must be non-zero".into(),
            ));
        }
        if self.connection.base_reconnect_delay > self.connection.max_reconnect_delay {
            return Err(SyncError::Validation(
                "base reconnect delay exceeds the maximum delay".into(),
            ));
        }
        if self.connection.offline_capacity == 0 {
            return Err(SyncError::Validation(
                "offline buffer capacity must be at least 1".into(),
            ));
        }
        if self.connection.channel_capacity == 0 || self.event_capacity == 0 {
            return Err(SyncError::Validation("channel capacity must be at least 1".into()));
        }
        if self.dedup_capacity < 2 {
            return Err(SyncError::Validation(
                "dedup capacity must be at least 2".into(),
            ));
        }
        if self.default_join_role == Role::Owner {
            return Err(SyncError::Validation(
                "joining participants cannot default to owner".into(),
            ));
        }
        Ok(())
    }
}
