//! Session notifications.
//!
//! One tokio broadcast channel per kind. Sending never blocks: events for
//! which nobody subscribed are dropped, and a slow subscriber sees
//! `RecvError::Lagged` instead of stalling the session.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::connection::ConnectionState;
use crate::protocol::{CursorState, Participant, Role};

/// A file's content changed because of a remote update.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChanged {
    pub path: String,
    pub content: String,
    pub version: u64,
    pub sender_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ConnectionState,
    pub previous: ConnectionState,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleChanged {
    pub user_id: Uuid,
    pub role: Role,
}

/// A remote change failed to apply; a full resync was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityFailure {
    pub path: String,
    pub reason: String,
}

#[derive(Clone)]
pub struct EventBus {
    file_changed: broadcast::Sender<FileChanged>,
    presence: broadcast::Sender<Vec<Participant>>,
    cursors: broadcast::Sender<CursorState>,
    status: broadcast::Sender<StatusChange>,
    typing: broadcast::Sender<Vec<Uuid>>,
    roles: broadcast::Sender<RoleChanged>,
    integrity: broadcast::Sender<IntegrityFailure>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            file_changed: broadcast::channel(capacity).0,
            presence: broadcast::channel(capacity).0,
            cursors: broadcast::channel(capacity).0,
            status: broadcast::channel(capacity).0,
            typing: broadcast::channel(capacity).0,
            roles: broadcast::channel(capacity).0,
            integrity: broadcast::channel(capacity).0,
        }
    }

    pub fn file_changes(&self) -> broadcast::Receiver<FileChanged> {
        self.file_changed.subscribe()
    }

    pub fn presence(&self) -> broadcast::Receiver<Vec<Participant>> {
        self.presence.subscribe()
    }

    pub fn cursors(&self) -> broadcast::Receiver<CursorState> {
        self.cursors.subscribe()
    }

    pub fn status(&self) -> broadcast::Receiver<StatusChange> {
        self.status.subscribe()
    }

    pub fn typing(&self) -> broadcast::Receiver<Vec<Uuid>> {
        self.typing.subscribe()
    }

    pub fn roles(&self) -> broadcast::Receiver<RoleChanged> {
        self.roles.subscribe()
    }

    pub fn integrity(&self) -> broadcast::Receiver<IntegrityFailure> {
        self.integrity.subscribe()
    }

    // A send error only means there are no subscribers right now.

    pub(crate) fn emit_file_changed(&self, event: FileChanged) {
        let _ = self.file_changed.send(event);
    }

    pub(crate) fn emit_presence(&self, participants: Vec<Participant>) {
        let _ = self.presence.send(participants);
    }

    pub(crate) fn emit_cursor(&self, cursor: CursorState) {
        let _ = self.cursors.send(cursor);
    }

    pub(crate) fn emit_status(&self, change: StatusChange) {
        let _ = self.status.send(change);
    }

    pub(crate) fn emit_typing(&self, users: Vec<Uuid>) {
        let _ = self.typing.send(users);
    }

    pub(crate) fn emit_role(&self, change: RoleChanged) {
        let _ = self.roles.send(change);
    }

    pub(crate) fn emit_integrity(&self, failure: IntegrityFailure) {
        let _ = self.integrity.send(failure);
    }
}
