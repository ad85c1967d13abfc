//! Presence tracking: who is in the session, where their cursors are, and
//! who is typing.
//!
//! ## Architecture
//!
//! ```text
//! Transport presence sync/join/leave ──► PresenceTracker::handle_presence()
//!                                              │
//! Remote cursor-move ─────────────────► handle_remote_cursor()  (newest wins)
//!                                              │
//! Local cursor move ──► queue_local_cursor()   │
//!       │  (100ms batch, last one wins)        ▼
//!       ▼                               participants / cursors / typing
//! take_cursor_batch() ──► cursor-move broadcast
//! ```
//!
//! The tracker is a plain state machine: every method takes the current
//! time in milliseconds and the owning session decides when to call it.

use std::collections::HashMap;

use uuid::Uuid;

use crate::clock::millis;
use crate::config::PresenceConfig;
use crate::protocol::{CursorState, Participant, PresenceDiff, PresenceEntry, Role};

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

pub struct PresenceTracker {
    /// Our own identity, including our current role.
    local: Participant,
    /// Everyone in the channel's presence state, us included.
    participants: HashMap<Uuid, Participant>,
    /// Latest remote cursor per participant.
    cursors: HashMap<Uuid, CursorState>,
    /// participant → last typing signal (ms)
    typing: HashMap<Uuid, u64>,
    /// participant → (role, when it was set). Presence records tracked
    /// before that instant still carry the old role.
    role_changes: HashMap<Uuid, (Role, u64)>,
    /// Most recent local cursor not yet sent.
    pending_cursor: Option<CursorState>,
    /// When the current cursor batch opened.
    batch_opened_at: Option<u64>,
    cursor_batch_window_ms: u64,
    typing_timeout_ms: u64,
}

impl PresenceTracker {
    pub fn new(local: Participant, config: &PresenceConfig) -> Self {
        Self {
            local,
            participants: HashMap::new(),
            cursors: HashMap::new(),
            typing: HashMap::new(),
            role_changes: HashMap::new(),
            pending_cursor: None,
            batch_opened_at: None,
            cursor_batch_window_ms: millis(config.cursor_batch_window),
            typing_timeout_ms: millis(config.typing_timeout),
        }
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn local_id(&self) -> Uuid {
        self.local.id
    }

    /// The entry we track on the channel.
    pub fn local_entry(&self, now_ms: u64) -> PresenceEntry {
        PresenceEntry {
            participant: self.local.clone(),
            online_at: now_ms,
        }
    }

    /// Apply a presence notification. Returns `true` if membership changed.
    pub fn handle_presence(&mut self, diff: &PresenceDiff) -> bool {
        match diff {
            PresenceDiff::Sync(entries) => {
                let mut next: HashMap<Uuid, Participant> = HashMap::with_capacity(entries.len());
                for entry in entries {
                    next.insert(entry.participant.id, self.participant_from(entry));
                }
                let changed = next != self.participants;
                self.cursors.retain(|id, _| next.contains_key(id));
                self.typing.retain(|id, _| next.contains_key(id));
                self.participants = next;
                self.adopt_local_record();
                changed
            }
            PresenceDiff::Join(entries) => {
                let mut changed = false;
                for entry in entries {
                    let incoming = self.participant_from(entry);
                    if self.participants.get(&incoming.id) != Some(&incoming) {
                        self.participants.insert(incoming.id, incoming);
                        changed = true;
                    }
                }
                self.adopt_local_record();
                changed
            }
            PresenceDiff::Leave(entries) => {
                let mut changed = false;
                for entry in entries {
                    let id = entry.participant.id;
                    changed |= self.participants.remove(&id).is_some();
                    self.cursors.remove(&id);
                    self.typing.remove(&id);
                    self.role_changes.remove(&id);
                }
                changed
            }
        }
    }

    /// Build a participant from a presence record. A record older than the
    /// last role change we applied keeps that role instead of its own.
    fn participant_from(&mut self, entry: &PresenceEntry) -> Participant {
        let mut participant = entry.participant.clone();
        participant.last_seen_at = participant.last_seen_at.max(entry.online_at);
        if let Some(&(role, changed_at)) = self.role_changes.get(&participant.id) {
            if entry.online_at < changed_at {
                participant.role = role;
            } else {
                self.role_changes.remove(&participant.id);
            }
        }
        participant
    }

    /// Remote role changes reach us through presence; keep `local` in step.
    fn adopt_local_record(&mut self) {
        if let Some(record) = self.participants.get(&self.local.id) {
            self.local.role = record.role;
        }
    }

    /// Participants sorted by name, then id.
    pub fn participants(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self.participants.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        list
    }

    pub fn participant(&self, id: &Uuid) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Record a role change for anyone, us included.
    pub fn set_role(&mut self, user_id: Uuid, role: Role, now_ms: u64) -> bool {
        self.role_changes.insert(user_id, (role, now_ms));
        if user_id == self.local.id {
            self.local.role = role;
        }
        match self.participants.get_mut(&user_id) {
            Some(p) if p.role != role => {
                p.role = role;
                true
            }
            Some(_) => false,
            None => user_id == self.local.id,
        }
    }

    // ─── Cursors ──────────────────────────────────────────────────

    /// Store a remote cursor. Own cursors and older timestamps are ignored.
    pub fn handle_remote_cursor(&mut self, cursor: CursorState) -> bool {
        if cursor.user_id == self.local.id {
            return false;
        }
        if let Some(existing) = self.cursors.get(&cursor.user_id) {
            if cursor.timestamp < existing.timestamp {
                return false;
            }
        }
        if let Some(p) = self.participants.get_mut(&cursor.user_id) {
            p.last_seen_at = p.last_seen_at.max(cursor.timestamp);
        }
        self.cursors.insert(cursor.user_id, cursor);
        true
    }

    pub fn remote_cursor(&self, user_id: &Uuid) -> Option<&CursorState> {
        self.cursors.get(user_id)
    }

    pub fn remote_cursors(&self) -> impl Iterator<Item = &CursorState> {
        self.cursors.values()
    }

    /// Queue a local cursor. Only the last one queued in a window is sent.
    pub fn queue_local_cursor(&mut self, cursor: CursorState, now_ms: u64) {
        if self.batch_opened_at.is_none() {
            self.batch_opened_at = Some(now_ms);
        }
        self.pending_cursor = Some(cursor);
    }

    /// When the open batch is due, if one is open.
    pub fn cursor_batch_deadline(&self) -> Option<u64> {
        self.batch_opened_at
            .map(|opened| opened + self.cursor_batch_window_ms)
    }

    /// Take the pending cursor once its batch window has elapsed.
    pub fn take_cursor_batch(&mut self, now_ms: u64) -> Option<CursorState> {
        let deadline = self.cursor_batch_deadline()?;
        if now_ms < deadline {
            return None;
        }
        self.batch_opened_at = None;
        self.pending_cursor.take()
    }

    // ─── Typing ───────────────────────────────────────────────────

    /// Returns `true` if the user was not already typing.
    pub fn mark_typing(&mut self, user_id: Uuid, now_ms: u64) -> bool {
        self.typing.insert(user_id, now_ms).is_none()
    }

    pub fn clear_typing(&mut self, user_id: &Uuid) -> bool {
        self.typing.remove(user_id).is_some()
    }

    /// Drop typing signals older than the timeout; returns who stopped.
    pub fn expire_typing(&mut self, now_ms: u64) -> Vec<Uuid> {
        let timeout = self.typing_timeout_ms;
        let expired: Vec<Uuid> = self
            .typing
            .iter()
            .filter(|(_, at)| now_ms.saturating_sub(**at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.typing.remove(id);
        }
        expired
    }

    pub fn typing_deadline(&self) -> Option<u64> {
        self.typing.values().min().map(|at| at + self.typing_timeout_ms)
    }

    /// Currently typing participants, sorted.
    pub fn typing_users(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self.typing.keys().copied().collect();
        users.sort();
        users
    }

    /// Forget everyone but ourselves. Used when leaving a session.
    pub fn reset(&mut self) {
        self.participants.clear();
        self.cursors.clear();
        self.typing.clear();
        self.role_changes.clear();
        self.pending_cursor = None;
        self.batch_opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CursorPosition;

    fn tracker() -> (PresenceTracker, Participant) {
        let local = Participant::new("local", Role::Owner);
        (
            PresenceTracker::new(local.clone(), &PresenceConfig::default()),
            local,
        )
    }

    fn entry(p: &Participant, at: u64) -> PresenceEntry {
        PresenceEntry {
            participant: p.clone(),
            online_at: at,
        }
    }

    fn cursor(user: Uuid, line: u32, ts: u64) -> CursorState {
        CursorState {
            user_id: user,
            path: "a.rs".into(),
            position: CursorPosition { line, column: 0 },
            selection: None,
            version: 0,
            timestamp: ts,
        }
    }

    #[test]
    fn test_sync_dedups_by_id() {
        let (mut t, local) = tracker();
        let bob = Participant::new("bob", Role::Editor);
        let changed = t.handle_presence(&PresenceDiff::Sync(vec![
            entry(&local, 1),
            entry(&bob, 1),
            entry(&bob, 2),
        ]));
        assert!(changed);
        assert_eq!(t.participant_count(), 2);
        assert_eq!(t.participant(&bob.id).unwrap().last_seen_at, 2);
    }

    #[test]
    fn test_join_then_leave_clears_cursor_and_typing() {
        let (mut t, _) = tracker();
        let bob = Participant::new("bob", Role::Editor);
        assert!(t.handle_presence(&PresenceDiff::Join(vec![entry(&bob, 1)])));
        assert!(t.handle_remote_cursor(cursor(bob.id, 3, 10)));
        t.mark_typing(bob.id, 10);

        assert!(t.handle_presence(&PresenceDiff::Leave(vec![entry(&bob, 1)])));
        assert!(t.participant(&bob.id).is_none());
        assert!(t.remote_cursor(&bob.id).is_none());
        assert!(t.typing_users().is_empty());
    }

    #[test]
    fn test_repeated_sync_reports_no_change() {
        let (mut t, local) = tracker();
        let sync = PresenceDiff::Sync(vec![entry(&local, 1)]);
        assert!(t.handle_presence(&sync));
        assert!(!t.handle_presence(&sync));
    }

    #[test]
    fn test_own_and_older_cursors_ignored() {
        let (mut t, local) = tracker();
        let bob = Uuid::new_v4();
        assert!(!t.handle_remote_cursor(cursor(local.id, 1, 5)));
        assert!(t.handle_remote_cursor(cursor(bob, 1, 5)));
        assert!(!t.handle_remote_cursor(cursor(bob, 2, 4)));
        assert_eq!(t.remote_cursor(&bob).unwrap().position.line, 1);
        assert!(t.handle_remote_cursor(cursor(bob, 3, 9)));
        assert_eq!(t.remote_cursor(&bob).unwrap().position.line, 3);
    }

    #[test]
    fn test_cursor_batch_keeps_last() {
        let (mut t, local) = tracker();
        t.queue_local_cursor(cursor(local.id, 1, 0), 0);
        t.queue_local_cursor(cursor(local.id, 2, 30), 30);
        t.queue_local_cursor(cursor(local.id, 3, 60), 60);
        assert_eq!(t.cursor_batch_deadline(), Some(100));
        assert!(t.take_cursor_batch(99).is_none());
        let sent = t.take_cursor_batch(100).unwrap();
        assert_eq!(sent.position.line, 3);
        assert!(t.cursor_batch_deadline().is_none());
        assert!(t.take_cursor_batch(500).is_none());
    }

    #[test]
    fn test_typing_expires_after_timeout() {
        let (mut t, _) = tracker();
        let bob = Uuid::new_v4();
        assert!(t.mark_typing(bob, 1_000));
        assert!(!t.mark_typing(bob, 1_500));
        assert_eq!(t.typing_deadline(), Some(3_500));
        assert!(t.expire_typing(3_000).is_empty());
        assert_eq!(t.expire_typing(3_500), vec![bob]);
        assert!(t.typing_users().is_empty());
    }

    #[test]
    fn test_remote_role_change_updates_local() {
        let (mut t, local) = tracker();
        let mut demoted = local.clone();
        demoted.role = Role::Viewer;
        t.handle_presence(&PresenceDiff::Sync(vec![entry(&demoted, 1)]));
        assert_eq!(t.local().role, Role::Viewer);
    }

    #[test]
    fn test_set_role() {
        let (mut t, _) = tracker();
        let bob = Participant::new("bob", Role::Editor);
        t.handle_presence(&PresenceDiff::Join(vec![entry(&bob, 1)]));
        assert!(t.set_role(bob.id, Role::Viewer, 5));
        assert!(!t.set_role(bob.id, Role::Viewer, 6));
        assert_eq!(t.participant(&bob.id).unwrap().role, Role::Viewer);
    }

    #[test]
    fn test_stale_sync_keeps_newer_role_change() {
        let (mut t, local) = tracker();
        let bob = Participant::new("bob", Role::Editor);
        t.handle_presence(&PresenceDiff::Sync(vec![entry(&local, 1), entry(&bob, 1)]));
        assert!(t.set_role(bob.id, Role::Viewer, 50));

        // Bob's record from before the demotion still says editor.
        t.handle_presence(&PresenceDiff::Sync(vec![entry(&local, 1), entry(&bob, 1)]));
        assert_eq!(t.participant(&bob.id).unwrap().role, Role::Viewer);
        t.handle_presence(&PresenceDiff::Join(vec![entry(&bob, 20)]));
        assert_eq!(t.participant(&bob.id).unwrap().role, Role::Viewer);

        // A record tracked after the change is authoritative again.
        let mut promoted = bob.clone();
        promoted.role = Role::Editor;
        t.handle_presence(&PresenceDiff::Join(vec![entry(&promoted, 80)]));
        assert_eq!(t.participant(&bob.id).unwrap().role, Role::Editor);
    }

    #[test]
    fn test_stale_sync_keeps_own_demotion() {
        let local = Participant::new("local", Role::Editor);
        let mut t = PresenceTracker::new(local.clone(), &PresenceConfig::default());
        t.handle_presence(&PresenceDiff::Sync(vec![entry(&local, 1)]));
        t.set_role(local.id, Role::Viewer, 50);

        t.handle_presence(&PresenceDiff::Sync(vec![entry(&local, 1)]));
        assert_eq!(t.local().role, Role::Viewer);

        let mut retracked = local.clone();
        retracked.role = Role::Viewer;
        t.handle_presence(&PresenceDiff::Sync(vec![entry(&retracked, 50)]));
        assert_eq!(t.local().role, Role::Viewer);
    }

    #[test]
    fn test_participants_sorted() {
        let (mut t, _) = tracker();
        let zed = Participant::new("zed", Role::Editor);
        let amy = Participant::new("amy", Role::Editor);
        t.handle_presence(&PresenceDiff::Sync(vec![entry(&zed, 1), entry(&amy, 1)]));
        let names: Vec<String> = t.participants().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["amy", "zed"]);
    }
}
