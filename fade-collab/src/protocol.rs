//! JSON wire schema.
//!
//! Two layers travel over a channel:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ RelayFrame  (type: subscribe | broadcast | track | ...)  │  relay socket
//! │   └── broadcast { event, payload }                       │
//! │          └── ChangeMessage | CursorMessage | Typing ...  │  session payloads
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Field names are camelCase on the wire. Unknown fields are ignored so
//! older peers can talk to newer ones.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diff::DiffEnvelope;
use crate::error::SyncError;

/// Broadcast event names.
pub mod events {
    pub const FILE_CHANGE: &str = "file-change";
    pub const CURSOR_MOVE: &str = "cursor-move";
    pub const USER_TYPING: &str = "user-typing";
    pub const PERMISSION_CHANGE: &str = "permission-change";
    pub const RESYNC_REQUEST: &str = "resync-request";
}

/// Channel topic for a session code.
pub fn topic_for(session_code: &str) -> String {
    format!("session:{session_code}")
}

// ─── Participants ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn can_edit(self) -> bool {
        matches!(self, Self::Owner | Self::Editor)
    }

    pub fn can_manage_permissions(self) -> bool {
        self == Self::Owner
    }
}

/// Cursor colors handed out to participants.
pub const PARTICIPANT_COLORS: [&str; 12] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
    "#F8B739", "#52B788", "#EF476F", "#06FFA5",
];

/// Stable color from the participant id.
pub fn color_for(id: Uuid) -> &'static str {
    PARTICIPANT_COLORS[(id.as_u128() % PARTICIPANT_COLORS.len() as u128) as usize]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub role: Role,
    #[serde(default)]
    pub last_seen_at: u64,
}

impl Participant {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self::with_id(Uuid::new_v4(), name, role)
    }

    /// Create with explicit id (for testing)
    pub fn with_id(id: Uuid, name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            name: name.into(),
            color: color_for(id).to_owned(),
            role,
            last_seen_at: 0,
        }
    }
}

/// What a client tracks on the channel's presence state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub participant: Participant,
    pub online_at: u64,
}

/// Presence notifications delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceDiff {
    /// Full snapshot of everyone currently tracked.
    Sync(Vec<PresenceEntry>),
    Join(Vec<PresenceEntry>),
    Leave(Vec<PresenceEntry>),
}

// ─── Session payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: CursorPosition,
    pub end: CursorPosition,
}

/// A participant's cursor, sent on `cursor-move`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub user_id: Uuid,
    pub path: String,
    pub position: CursorPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    #[serde(default)]
    pub version: u64,
    pub timestamp: u64,
}

/// A file change, sent on `file-change`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    pub message_id: String,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub path: String,
    pub diff: DiffEnvelope,
    /// SHA-256 of the full new content. Empty when the strategy skips hashing.
    #[serde(default)]
    pub content_hash: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    pub timestamp: u64,
}

impl ChangeMessage {
    /// `sender-path-timestamp-version`; unique per (sender, path, version).
    pub fn message_id_for(sender: Uuid, path: &str, timestamp: u64, version: u64) -> String {
        format!("{sender}-{path}-{timestamp}-{version}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingMessage {
    pub user_id: Uuid,
    pub user_name: String,
    pub is_typing: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionChange {
    pub user_id: Uuid,
    pub new_role: Role,
    pub changed_by: Uuid,
    pub timestamp: u64,
}

/// Asks peers to answer with the full content of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncRequest {
    pub requester_id: Uuid,
    pub path: String,
    pub timestamp: u64,
}

pub fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, SyncError> {
    serde_json::to_value(value).map_err(|e| SyncError::Protocol(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|e| SyncError::Protocol(e.to_string()))
}

// ─── Relay frames ────────────────────────────────────────────────────────────

/// Frames exchanged with the relay over a WebSocket text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    // client → relay
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Track { topic: String, entry: PresenceEntry },
    Untrack { topic: String },
    Ping { topic: String },
    // both directions
    Broadcast {
        topic: String,
        event: String,
        payload: serde_json::Value,
    },
    // relay → client
    Subscribed { topic: String },
    Pong { topic: String },
    PresenceSync { topic: String, entries: Vec<PresenceEntry> },
    PresenceJoin { topic: String, entries: Vec<PresenceEntry> },
    PresenceLeave { topic: String, entries: Vec<PresenceEntry> },
    Error { message: String },
}

impl RelayFrame {
    pub fn encode(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}
