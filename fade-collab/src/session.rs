//! Sync session: one participant's view of a shared project.
//!
//! ## Architecture
//!
//! ```text
//!  local edit ──► apply_local_change ──► strategy.compute_delta ──► ConnectionManager::send
//!                                                                        │ (offline buffer
//!                                                                        │  while down)
//!  TransportEvent ──► handle_transport_event                             ▼
//!        │                ├─ file-change ──► dedup ─► staleness ─► strategy.apply_delta
//!        │                │                                          └─ hash check ─► FileChanged
//!        │                ├─ cursor-move / user-typing / permission-change ─► PresenceTracker
//!        │                └─ resync-request ──► reply with full content
//!        └─ status / heartbeat ack / presence ──► ConnectionManager / PresenceTracker
//! ```
//!
//! A session is a synchronous state machine over millisecond timestamps from
//! its [`Clock`]. [`crate::runtime`] drives it from a tokio task; tests can
//! drive it directly.
//!
//! Remote changes more than `staleness_threshold` versions behind the local
//! copy are rejected. A change that fails to apply, or whose rebuilt content
//! does not match the sender's hash, leaves the local copy untouched, marks
//! the document for resync and asks peers for full content.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use uuid::Uuid;

use crate::clock::{millis, Clock, Sleep};
use crate::config::{SessionLimits, SyncConfig};
use crate::connection::{ConnectionManager, ConnectionState, Delivery};
use crate::dedup::MessageDeduplicator;
use crate::diff::{content_hash, DiffEnvelope, DiffKind, DiffPayload};
use crate::error::SyncError;
use crate::events::{EventBus, FileChanged, IntegrityFailure, RoleChanged};
use crate::offline::FlushReport;
use crate::presence::PresenceTracker;
use crate::protocol::{
    self, events, topic_for, ChangeMessage, CursorPosition, CursorState, Participant,
    PermissionChange, PresenceDiff, ResyncRequest, Role, Selection, TypingMessage,
};
use crate::storage::{ProjectSnapshot, SnapshotStore};
use crate::strategy::{strategy_for, CrdtStrategy, SyncStrategy};
use crate::transport::{Subscription, Transport, TransportEvent};

// ───────────────────────────────────────────────────────────────────
// Types
// ───────────────────────────────────────────────────────────────────

/// Local copy of one file.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentState {
    pub path: String,
    pub content: String,
    pub version: u64,
    pub last_hash: String,
    /// Set after an integrity failure until full content arrives.
    pub needs_resync: bool,
}

impl DocumentState {
    fn new(path: &str, content: String, version: u64) -> Self {
        Self {
            path: path.to_owned(),
            last_hash: content_hash(&content),
            content,
            version,
            needs_resync: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub code: String,
    pub name: String,
    pub topic: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStats {
    pub total_bytes_sent: u64,
    /// Bytes not sent because a diff replaced full content.
    pub total_bytes_saved: u64,
    pub diffs_used: u64,
    pub full_syncs_used: u64,
    pub messages_received: u64,
    pub duplicates_dropped: u64,
    pub stale_dropped: u64,
    pub integrity_failures: u64,
}

/// What became of a remote change.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Applied {
        path: String,
        content: String,
        version: u64,
    },
    /// Already processed.
    Duplicate,
    /// Our own message came back.
    Echo,
    /// Sender is known and not allowed to edit.
    Unauthorized,
}

/// Collaborators a session runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub store: Option<Arc<dyn SnapshotStore>>,
}

// ───────────────────────────────────────────────────────────────────
// Validation
// ───────────────────────────────────────────────────────────────────

const CODE_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const DEFAULT_SESSION_NAME: &str = "Untitled Session";

/// Largest document version accepted from peers, the integer range JSON
/// numbers carry exactly.
pub const MAX_VERSION: u64 = (1 << 53) - 1;

/// Random uppercase alphanumeric session code.
pub fn generate_session_code(len: usize) -> String {
    let bits = Uuid::new_v4().as_u128();
    (0..len)
        .map(|i| {
            let chunk = (bits >> ((i * 6) % 120)) % CODE_ALPHABET.len() as u128;
            CODE_ALPHABET[chunk as usize] as char
        })
        .collect()
}

pub fn validate_user_name(name: &str, limits: &SessionLimits) -> Result<String, SyncError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SyncError::Validation("user name is required".into()));
    }
    if name.chars().count() > limits.max_user_name {
        return Err(SyncError::Validation(format!(
            "user name longer than {} characters",
            limits.max_user_name
        )));
    }
    Ok(name.to_owned())
}

pub fn validate_session_name(name: &str, limits: &SessionLimits) -> Result<String, SyncError> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(DEFAULT_SESSION_NAME.to_owned());
    }
    if name.chars().count() > limits.max_session_name {
        return Err(SyncError::Validation(format!(
            "session name longer than {} characters",
            limits.max_session_name
        )));
    }
    Ok(name.to_owned())
}

/// Normalizes to uppercase.
pub fn validate_session_code(code: &str, limits: &SessionLimits) -> Result<String, SyncError> {
    let code = code.trim().to_ascii_uppercase();
    if code.len() != limits.session_code_len || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(SyncError::Validation(format!(
            "session code must be {} letters or digits",
            limits.session_code_len
        )));
    }
    Ok(code)
}

pub fn validate_path(path: &str, limits: &SessionLimits) -> Result<(), SyncError> {
    if path.is_empty() {
        return Err(SyncError::Validation("file path is empty".into()));
    }
    if path.len() > limits.max_path {
        return Err(SyncError::Validation(format!(
            "file path longer than {} bytes",
            limits.max_path
        )));
    }
    if path.contains('\0') {
        return Err(SyncError::Validation("file path contains NUL".into()));
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

pub struct SyncSession {
    config: SyncConfig,
    info: SessionInfo,
    docs: HashMap<String, DocumentState>,
    /// Image references carried through snapshots untouched.
    images: Vec<String>,
    strategy: Box<dyn SyncStrategy>,
    dedup: MessageDeduplicator,
    presence: PresenceTracker,
    connection: ConnectionManager,
    events: EventBus,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SnapshotStore>>,
    stats: SyncStats,
    /// path → instant before which local changes echo a remote apply.
    remote_apply_until: HashMap<String, u64>,
}

impl SyncSession {
    fn assemble(
        config: SyncConfig,
        deps: SessionDeps,
        info: SessionInfo,
        local: Participant,
        snapshot: Option<ProjectSnapshot>,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let strategy = strategy_for(
            config.strategy,
            &config.diff,
            CrdtStrategy::client_id_for(local.id),
        );
        let connection = ConnectionManager::new(
            deps.transport,
            config.connection.clone(),
            events.clone(),
        );
        let (docs, images) = match snapshot {
            Some(snapshot) => (
                snapshot
                    .files
                    .into_iter()
                    .map(|(path, content)| {
                        let doc = DocumentState::new(&path, content, 0);
                        (path, doc)
                    })
                    .collect(),
                snapshot.images,
            ),
            None => (HashMap::new(), Vec::new()),
        };
        Self {
            dedup: MessageDeduplicator::new(config.dedup_window, config.dedup_capacity),
            presence: PresenceTracker::new(local, &config.presence),
            info,
            docs,
            images,
            strategy,
            connection,
            events,
            clock: deps.clock,
            store: deps.store,
            stats: SyncStats::default(),
            remote_apply_until: HashMap::new(),
            config,
        }
    }

    /// Start a new session as its owner. The initial files are persisted
    /// when a store is configured.
    pub fn create(
        config: SyncConfig,
        deps: SessionDeps,
        user_name: &str,
        session_name: &str,
        files: BTreeMap<String, String>,
    ) -> Result<(Self, Subscription), SyncError> {
        config.validate()?;
        let user_name = validate_user_name(user_name, &config.limits)?;
        let session_name = validate_session_name(session_name, &config.limits)?;
        for path in files.keys() {
            validate_path(path, &config.limits)?;
        }

        let code = generate_session_code(config.limits.session_code_len);
        let snapshot = ProjectSnapshot {
            session_name: session_name.clone(),
            files,
            images: Vec::new(),
            saved_at: deps.clock.now_ms(),
        };
        if let Some(store) = &deps.store {
            store.save(&code, &snapshot)?;
        }

        let info = SessionInfo {
            topic: topic_for(&code),
            code,
            name: session_name,
        };
        log::info!("Creating session {} ({})", info.code, info.name);
        let local = Participant::new(user_name, Role::Owner);
        let session = Self::assemble(config, deps, info, local, Some(snapshot));
        session.start()
    }

    /// Join an existing session by code with the configured join role.
    /// With a store, the code must exist and its files are loaded.
    pub fn join(
        config: SyncConfig,
        deps: SessionDeps,
        code: &str,
        user_name: &str,
    ) -> Result<(Self, Subscription), SyncError> {
        config.validate()?;
        let code = validate_session_code(code, &config.limits)?;
        let user_name = validate_user_name(user_name, &config.limits)?;

        let snapshot = match &deps.store {
            Some(store) => Some(
                store
                    .load(&code)?
                    .ok_or_else(|| SyncError::Validation(format!("session {code} not found")))?,
            ),
            None => None,
        };
        let name = snapshot
            .as_ref()
            .map(|s| s.session_name.clone())
            .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_owned());

        let info = SessionInfo {
            topic: topic_for(&code),
            code,
            name,
        };
        log::info!("Joining session {}", info.code);
        let local = Participant::new(user_name, config.default_join_role);
        let session = Self::assemble(config, deps, info, local, snapshot);
        session.start()
    }

    fn start(mut self) -> Result<(Self, Subscription), SyncError> {
        let now = self.now_ms();
        self.connection.set_presence(self.presence.local_entry(now))?;
        let topic = self.info.topic.clone();
        let subscription = self.connection.connect(&topic, now)?;
        Ok((self, subscription))
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn local(&self) -> &Participant {
        self.presence.local()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn offline_len(&self) -> usize {
        self.connection.offline().len()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.presence.participants()
    }

    pub fn remote_cursor(&self, user_id: &Uuid) -> Option<&CursorState> {
        self.presence.remote_cursor(user_id)
    }

    pub fn typing_users(&self) -> Vec<Uuid> {
        self.presence.typing_users()
    }

    pub fn document(&self, path: &str) -> Option<&DocumentState> {
        self.docs.get(path)
    }

    /// Paths of all tracked documents, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.docs.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Track a file without broadcasting it. Existing documents are kept.
    pub fn open_document(&mut self, path: &str, content: &str) -> Result<(), SyncError> {
        validate_path(path, &self.config.limits)?;
        self.docs
            .entry(path.to_owned())
            .or_insert_with(|| DocumentState::new(path, content.to_owned(), 0));
        Ok(())
    }

    // ─── Local changes ────────────────────────────────────────────

    /// Publish an edit. Returns `None` when nothing was sent: no change, or
    /// the edit echoes a remote change applied within the echo window.
    pub fn apply_local_change(
        &mut self,
        path: &str,
        new_content: &str,
        cursor: Option<CursorPosition>,
    ) -> Result<Option<Delivery>, SyncError> {
        validate_path(path, &self.config.limits)?;
        let local = self.presence.local();
        if !local.role.can_edit() {
            return Err(SyncError::PermissionDenied(format!(
                "{:?} cannot edit {path}",
                local.role
            )));
        }

        let now = self.now_ms();
        if self
            .remote_apply_until
            .get(path)
            .is_some_and(|&until| now < until)
        {
            log::debug!("Suppressing echo of remote change to {path}");
            return Ok(None);
        }

        let (old_content, old_version) = match self.docs.get(path) {
            Some(doc) if doc.content == new_content => return Ok(None),
            Some(doc) => (doc.content.clone(), doc.version),
            None => (String::new(), 0),
        };

        let version = old_version
            .checked_add(1)
            .filter(|v| *v <= MAX_VERSION)
            .ok_or_else(|| SyncError::Validation(format!("{path} is at its last version")))?;
        let delta = self.strategy.compute_delta(path, &old_content, new_content)?;
        if delta.kind == DiffKind::None {
            return Ok(None);
        }
        let hash = content_hash(new_content);
        self.record_sent(&delta, new_content.len());

        let local = self.presence.local();
        let message = ChangeMessage {
            message_id: ChangeMessage::message_id_for(local.id, path, now, version),
            sender_id: local.id,
            sender_name: local.name.clone(),
            path: path.to_owned(),
            content_hash: if self.strategy.verifies_content_hash() {
                hash.clone()
            } else {
                String::new()
            },
            diff: delta,
            version,
            cursor,
            timestamp: now,
        };

        let doc = self
            .docs
            .entry(path.to_owned())
            .or_insert_with(|| DocumentState::new(path, String::new(), 0));
        doc.content = new_content.to_owned();
        doc.version = version;
        doc.last_hash = hash;

        self.connection.send(message, now).map(Some)
    }

    fn record_sent(&mut self, delta: &DiffEnvelope, full_len: usize) {
        self.stats.total_bytes_sent += delta.size as u64;
        if delta.kind == DiffKind::Full {
            self.stats.full_syncs_used += 1;
        } else {
            self.stats.diffs_used += 1;
            self.stats.total_bytes_saved += full_len.saturating_sub(delta.size) as u64;
        }
    }

    // ─── Remote changes ───────────────────────────────────────────

    pub fn handle_remote_change(&mut self, msg: ChangeMessage) -> Result<RemoteOutcome, SyncError> {
        let now = self.now_ms();
        if msg.sender_id == self.presence.local_id() {
            return Ok(RemoteOutcome::Echo);
        }
        if self.dedup.check_and_record(&msg.message_id, now) {
            self.stats.duplicates_dropped += 1;
            return Ok(RemoteOutcome::Duplicate);
        }
        self.stats.messages_received += 1;

        if let Some(sender) = self.presence.participant(&msg.sender_id) {
            if !sender.role.can_edit() {
                log::warn!("Ignoring change to {} from {:?} {}", msg.path, sender.role, sender.name);
                return Ok(RemoteOutcome::Unauthorized);
            }
        }
        validate_path(&msg.path, &self.config.limits)?;

        let (base, local_version) = self
            .docs
            .get(&msg.path)
            .map(|doc| (doc.content.clone(), doc.version))
            .unwrap_or_default();

        if msg.version > MAX_VERSION {
            return Err(SyncError::Protocol(format!(
                "version {} of {} is out of range",
                msg.version, msg.path
            )));
        }
        if local_version.saturating_sub(self.config.staleness_threshold) > msg.version {
            log::warn!(
                "Rejecting stale change to {}: version {} vs local {}",
                msg.path,
                msg.version,
                local_version
            );
            self.stats.stale_dropped += 1;
            return Err(SyncError::StaleVersion {
                path: msg.path,
                remote: msg.version,
                local: local_version,
            });
        }

        let rebuilt = if !msg.diff.is_well_formed() {
            Err(SyncError::Integrity {
                path: msg.path.clone(),
                reason: format!("malformed {:?} envelope", msg.diff.kind),
            })
        } else if msg.diff.is_full() {
            self.strategy.merge(&msg.path, Some(&base), diff_content(&msg.diff))
        } else {
            self.strategy.apply_delta(&msg.path, &base, &msg.diff)
        };

        let content = match rebuilt {
            Ok(content) => content,
            Err(e) => return Err(self.integrity_failure(&msg.path, e, now)),
        };

        let hash = content_hash(&content);
        if self.strategy.verifies_content_hash()
            && !msg.content_hash.is_empty()
            && hash != msg.content_hash
        {
            let e = SyncError::Integrity {
                path: msg.path.clone(),
                reason: "content hash mismatch".into(),
            };
            return Err(self.integrity_failure(&msg.path, e, now));
        }

        let version = local_version.max(msg.version);
        let doc = self
            .docs
            .entry(msg.path.clone())
            .or_insert_with(|| DocumentState::new(&msg.path, String::new(), 0));
        doc.content = content.clone();
        doc.version = version;
        doc.last_hash = hash;
        doc.needs_resync = false;

        self.remote_apply_until.retain(|_, until| *until > now);
        self.remote_apply_until
            .insert(msg.path.clone(), now + millis(self.config.remote_echo_window));
        if self.presence.mark_typing(msg.sender_id, now) {
            self.events.emit_typing(self.presence.typing_users());
        }
        if let Some(position) = msg.cursor {
            self.handle_remote_cursor(CursorState {
                user_id: msg.sender_id,
                path: msg.path.clone(),
                position,
                selection: None,
                version,
                timestamp: msg.timestamp,
            });
        }

        self.events.emit_file_changed(FileChanged {
            path: msg.path.clone(),
            content: content.clone(),
            version,
            sender_id: msg.sender_id,
        });
        Ok(RemoteOutcome::Applied {
            path: msg.path,
            content,
            version,
        })
    }

    fn integrity_failure(&mut self, path: &str, error: SyncError, now: u64) -> SyncError {
        log::warn!("{error}; requesting resync of {path}");
        self.stats.integrity_failures += 1;
        if let Some(doc) = self.docs.get_mut(path) {
            doc.needs_resync = true;
        } else {
            let mut doc = DocumentState::new(path, String::new(), 0);
            doc.needs_resync = true;
            self.docs.insert(path.to_owned(), doc);
        }
        self.events.emit_integrity(IntegrityFailure {
            path: path.to_owned(),
            reason: error.to_string(),
        });
        self.request_resync(path, now);
        error
    }

    /// Ask peers for the full content of `path`. Best effort.
    pub fn request_resync(&mut self, path: &str, now: u64) -> bool {
        let request = ResyncRequest {
            requester_id: self.presence.local_id(),
            path: path.to_owned(),
            timestamp: now,
        };
        match protocol::encode(&request) {
            Ok(payload) => self
                .connection
                .send_ephemeral(events::RESYNC_REQUEST, payload, now),
            Err(e) => {
                log::error!("{e}");
                false
            }
        }
    }

    /// Answer a resync request with our full copy, if we have a good one.
    pub fn handle_resync_request(
        &mut self,
        request: ResyncRequest,
    ) -> Result<Option<Delivery>, SyncError> {
        if request.requester_id == self.presence.local_id() {
            return Ok(None);
        }
        let Some(doc) = self.docs.get(&request.path) else {
            return Ok(None);
        };
        if doc.needs_resync {
            return Ok(None);
        }
        let now = self.now_ms();
        let local = self.presence.local();
        let message = ChangeMessage {
            message_id: ChangeMessage::message_id_for(local.id, &doc.path, now, doc.version),
            sender_id: local.id,
            sender_name: local.name.clone(),
            path: doc.path.clone(),
            diff: DiffEnvelope::full(&doc.content),
            content_hash: doc.last_hash.clone(),
            version: doc.version,
            cursor: None,
            timestamp: now,
        };
        log::info!("Answering resync of {} at version {}", doc.path, doc.version);
        self.record_sent(&message.diff, message.diff.size);
        self.connection.send(message, now).map(Some)
    }

    // ─── Presence & awareness ─────────────────────────────────────

    pub fn handle_presence(&mut self, diff: &PresenceDiff) {
        let role_before = self.presence.local().role;
        if self.presence.handle_presence(diff) {
            self.events.emit_presence(self.presence.participants());
        }
        let role_after = self.presence.local().role;
        if role_after != role_before {
            self.events.emit_role(RoleChanged {
                user_id: self.presence.local_id(),
                role: role_after,
            });
        }
    }

    /// Queue a local cursor; sent when the batch window closes.
    pub fn move_cursor(&mut self, path: &str, position: CursorPosition, selection: Option<Selection>) {
        let now = self.now_ms();
        let version = self.docs.get(path).map_or(0, |d| d.version);
        let cursor = CursorState {
            user_id: self.presence.local_id(),
            path: path.to_owned(),
            position,
            selection,
            version,
            timestamp: now,
        };
        self.presence.queue_local_cursor(cursor, now);
    }

    pub fn handle_remote_cursor(&mut self, cursor: CursorState) {
        if self.presence.handle_remote_cursor(cursor.clone()) {
            self.events.emit_cursor(cursor);
        }
    }

    /// Broadcast our typing state.
    pub fn set_typing(&mut self, is_typing: bool) -> bool {
        let now = self.now_ms();
        let local = self.presence.local();
        let message = TypingMessage {
            user_id: local.id,
            user_name: local.name.clone(),
            is_typing,
            timestamp: now,
        };
        match protocol::encode(&message) {
            Ok(payload) => self
                .connection
                .send_ephemeral(events::USER_TYPING, payload, now),
            Err(e) => {
                log::error!("{e}");
                false
            }
        }
    }

    pub fn handle_typing(&mut self, message: TypingMessage) {
        if message.user_id == self.presence.local_id() {
            return;
        }
        let now = self.now_ms();
        let changed = if message.is_typing {
            self.presence.mark_typing(message.user_id, now)
        } else {
            self.presence.clear_typing(&message.user_id)
        };
        if changed {
            self.events.emit_typing(self.presence.typing_users());
        }
    }

    /// Owner-only. Changes another participant's role and tells everyone.
    pub fn change_role(&mut self, user_id: Uuid, role: Role) -> Result<(), SyncError> {
        let local = self.presence.local();
        if !local.role.can_manage_permissions() {
            return Err(SyncError::PermissionDenied(
                "only the owner can change roles".into(),
            ));
        }
        if user_id == local.id {
            return Err(SyncError::Validation("the owner cannot change their own role".into()));
        }
        if role == Role::Owner {
            return Err(SyncError::Validation("ownership cannot be transferred".into()));
        }
        if self.presence.participant(&user_id).is_none() {
            return Err(SyncError::Validation(format!("{user_id} is not in the session")));
        }

        let now = self.now_ms();
        let message = PermissionChange {
            user_id,
            new_role: role,
            changed_by: local.id,
            timestamp: now,
        };
        self.presence.set_role(user_id, role, now);
        self.events.emit_role(RoleChanged { user_id, role });
        let payload = protocol::encode(&message)?;
        if !self
            .connection
            .send_ephemeral(events::PERMISSION_CHANGE, payload, now)
        {
            log::warn!("Role change for {user_id} not delivered; peers will see it on next presence sync");
        }
        Ok(())
    }

    pub fn handle_permission_change(&mut self, message: PermissionChange) {
        match self.presence.participant(&message.changed_by) {
            Some(p) if p.role.can_manage_permissions() => {}
            _ => {
                log::warn!("Ignoring role change from non-owner {}", message.changed_by);
                return;
            }
        }
        let now = self.now_ms();
        if !self.presence.set_role(message.user_id, message.new_role, now) {
            return;
        }
        self.events.emit_role(RoleChanged {
            user_id: message.user_id,
            role: message.new_role,
        });
        if message.user_id == self.presence.local_id() {
            let entry = self.presence.local_entry(now);
            if let Err(e) = self.connection.set_presence(entry) {
                log::warn!("Re-tracking presence after role change failed: {e}");
            }
        }
    }

    // ─── Transport events & timers ────────────────────────────────

    /// Route one transport event. Returns `true` when the channel just came
    /// up and [`SyncSession::flush_offline`] should run.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Result<bool, SyncError> {
        let now = self.now_ms();
        match event {
            TransportEvent::Status(status) => Ok(self.connection.handle_status(status, now)),
            TransportEvent::HeartbeatAck => {
                self.connection.handle_heartbeat_ack(now);
                Ok(false)
            }
            TransportEvent::Presence(diff) => {
                self.handle_presence(&diff);
                Ok(false)
            }
            TransportEvent::Broadcast { event, payload } => {
                self.handle_broadcast(&event, payload)?;
                Ok(false)
            }
        }
    }

    fn handle_broadcast(&mut self, event: &str, payload: serde_json::Value) -> Result<(), SyncError> {
        match event {
            events::FILE_CHANGE => {
                self.handle_remote_change(protocol::decode(payload)?)?;
            }
            events::CURSOR_MOVE => self.handle_remote_cursor(protocol::decode(payload)?),
            events::USER_TYPING => self.handle_typing(protocol::decode(payload)?),
            events::PERMISSION_CHANGE => self.handle_permission_change(protocol::decode(payload)?),
            events::RESYNC_REQUEST => {
                self.handle_resync_request(protocol::decode(payload)?)?;
            }
            other => log::debug!("Ignoring unknown event {other}"),
        }
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.connection.next_deadline(),
            self.presence.cursor_batch_deadline(),
            self.presence.typing_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run due timers. Returns a new subscription if a reconnect fired.
    pub fn poll_timers(&mut self) -> Option<Subscription> {
        let now = self.now_ms();

        if let Some(cursor) = self.presence.take_cursor_batch(now) {
            match protocol::encode(&cursor) {
                Ok(payload) => {
                    self.connection
                        .send_ephemeral(events::CURSOR_MOVE, payload, now);
                }
                Err(e) => log::error!("{e}"),
            }
        }

        if !self.presence.expire_typing(now).is_empty() {
            self.events.emit_typing(self.presence.typing_users());
        }

        self.dedup.prune_expired(now);
        self.connection.poll_timers(now)
    }

    pub async fn flush_offline<S: Sleep>(&mut self, sleep: &S) -> FlushReport {
        self.connection.flush_offline(sleep).await
    }

    /// Re-open the channel, e.g. after the connection failed.
    pub fn reconnect(&mut self) -> Result<Subscription, SyncError> {
        let now = self.now_ms();
        let topic = self.info.topic.clone();
        self.connection.set_presence(self.presence.local_entry(now))?;
        self.connection.connect(&topic, now)
    }

    // ─── Persistence ──────────────────────────────────────────────

    /// Owner-only. Persist the current files.
    pub fn save_snapshot(&self) -> Result<ProjectSnapshot, SyncError> {
        if !self.presence.local().role.can_manage_permissions() {
            return Err(SyncError::PermissionDenied(
                "only the owner can save the project".into(),
            ));
        }
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| SyncError::Validation("no snapshot store configured".into()))?;
        let snapshot = ProjectSnapshot {
            session_name: self.info.name.clone(),
            files: self
                .docs
                .values()
                .map(|doc| (doc.path.clone(), doc.content.clone()))
                .collect(),
            images: self.images.clone(),
            saved_at: self.now_ms(),
        };
        store.save(&self.info.code, &snapshot)?;
        log::info!("Saved {} files for session {}", snapshot.files.len(), self.info.code);
        Ok(snapshot)
    }

    /// Leave the channel. Idempotent.
    pub fn leave(&mut self) {
        if self.connection.topic().is_some() {
            log::info!("Leaving session {}", self.info.code);
        }
        self.connection.disconnect();
        self.presence.reset();
        for path in self.docs.keys() {
            self.strategy.forget(path);
        }
        self.docs.clear();
        self.remote_apply_until.clear();
    }
}

fn diff_content(diff: &DiffEnvelope) -> &str {
    match &diff.payload {
        DiffPayload::Content(content) => content,
        _ => "",
    }
}
