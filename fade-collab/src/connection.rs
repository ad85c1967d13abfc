//! Connection lifecycle for one session channel.
//!
//! ```text
//!            connect()
//! Disconnected ────────► Connecting ──Subscribed──► Connected
//!      ▲                    │  ▲                     │    ▲
//!      │            error/  │  │ backoff timer       │    │ heartbeat ack
//!      │            timeout ▼  │                     ▼    │
//!      └──────────────── Disconnected ◄────────── Unstable (no ack in 2× interval)
//!                           │
//!                           └── attempts exhausted ──► Failed (until connect())
//! ```
//!
//! The manager is driven by its owner: transport events go in through
//! [`ConnectionManager::handle_status`] and [`ConnectionManager::handle_heartbeat_ack`],
//! and timers fire from [`ConnectionManager::poll_timers`] at the instant
//! reported by [`ConnectionManager::next_deadline`]. Reconnect delay for attempt
//! `n` is `min(base × 2^(n-1), max)`.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::{millis, Sleep};
use crate::config::ConnectionConfig;
use crate::error::SyncError;
use crate::events::{EventBus, StatusChange};
use crate::offline::{FlushReport, OfflineBuffer};
use crate::protocol::{self, events, ChangeMessage, PresenceEntry};
use crate::transport::{ChannelStatus, Subscription, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Heartbeats went unanswered; a reconnect is pending.
    Unstable,
    /// Reconnect attempts exhausted.
    Failed,
}

/// What happened to an outgoing change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Held in the offline buffer; `evicted` if that pushed out an older entry.
    Queued { evicted: bool },
}

/// Reconnect delay for a 1-based attempt number.
pub fn backoff_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    config
        .base_reconnect_delay
        .saturating_mul(factor)
        .min(config.max_reconnect_delay)
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    events: EventBus,
    state: ConnectionState,
    topic: Option<String>,
    attempts: u32,
    presence: Option<PresenceEntry>,
    offline: OfflineBuffer,
    last_ack_at: Option<u64>,
    next_heartbeat_at: Option<u64>,
    reconnect_at: Option<u64>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig, events: EventBus) -> Self {
        let offline = OfflineBuffer::new(config.offline_capacity);
        Self {
            transport,
            config,
            events,
            state: ConnectionState::Disconnected,
            topic: None,
            attempts: 0,
            presence: None,
            offline,
            last_ack_at: None,
            next_heartbeat_at: None,
            reconnect_at: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn offline(&self) -> &OfflineBuffer {
        &self.offline
    }

    /// Open the channel. Resets the attempt counter, including after `Failed`.
    ///
    /// On a synchronous subscribe error a reconnect is scheduled and the
    /// error is returned.
    pub fn connect(&mut self, topic: &str, now_ms: u64) -> Result<Subscription, SyncError> {
        self.clear_timers();
        self.attempts = 0;
        self.topic = Some(topic.to_owned());
        self.transition(ConnectionState::Connecting);

        match self.transport.subscribe(topic) {
            Ok(subscription) => Ok(subscription),
            Err(e) => {
                log::warn!("Subscribe to {topic} failed: {e}");
                self.transition(ConnectionState::Disconnected);
                if let Err(exhausted) = self.schedule_reconnect(now_ms) {
                    log::error!("{exhausted}");
                }
                Err(e.into())
            }
        }
    }

    /// Set what we track on the channel; re-tracked on every (re)connect.
    pub fn set_presence(&mut self, entry: PresenceEntry) -> Result<(), SyncError> {
        self.presence = Some(entry.clone());
        match (&self.topic, self.state) {
            (Some(topic), ConnectionState::Connected | ConnectionState::Unstable) => {
                self.transport.track_presence(topic, entry)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Feed a channel status. Returns `true` when the channel just came up
    /// and the offline buffer should be flushed.
    pub fn handle_status(&mut self, status: ChannelStatus, now_ms: u64) -> bool {
        match status {
            ChannelStatus::Subscribed => {
                // Left the channel, or gave up on it.
                if self.topic.is_none() || self.state == ConnectionState::Failed {
                    return false;
                }
                self.attempts = 0;
                self.reconnect_at = None;
                self.last_ack_at = Some(now_ms);
                self.next_heartbeat_at = Some(now_ms + millis(self.config.heartbeat_interval));
                self.transition(ConnectionState::Connected);
                self.track_presence();
                true
            }
            ChannelStatus::ChannelError | ChannelStatus::TimedOut | ChannelStatus::Closed => {
                log::warn!("Channel {:?} reported {status:?}", self.topic);
                self.on_transport_failure(now_ms);
                false
            }
        }
    }

    fn track_presence(&mut self) {
        if let (Some(topic), Some(entry)) = (&self.topic, &self.presence) {
            if let Err(e) = self.transport.track_presence(topic, entry.clone()) {
                log::warn!("Presence track on {topic} failed: {e}");
            }
        }
    }

    pub fn handle_heartbeat_ack(&mut self, now_ms: u64) {
        self.last_ack_at = Some(now_ms);
        if self.state == ConnectionState::Unstable {
            log::info!("Heartbeat answered, connection recovered");
            self.reconnect_at = None;
            self.attempts = 0;
            self.next_heartbeat_at = Some(now_ms + millis(self.config.heartbeat_interval));
            self.transition(ConnectionState::Connected);
        }
    }

    /// Earliest instant at which `poll_timers` has work.
    pub fn next_deadline(&self) -> Option<u64> {
        let liveness = match (self.state, self.last_ack_at) {
            (ConnectionState::Connected, Some(last)) => Some(last + self.liveness_limit() + 1),
            _ => None,
        };
        [self.next_heartbeat_at, liveness, self.reconnect_at]
            .into_iter()
            .flatten()
            .min()
    }

    fn liveness_limit(&self) -> u64 {
        2 * millis(self.config.heartbeat_interval)
    }

    /// Run due timers. Returns a fresh subscription when a reconnect fired.
    pub fn poll_timers(&mut self, now_ms: u64) -> Option<Subscription> {
        if self.state == ConnectionState::Connected {
            let silent_for = self.last_ack_at.map_or(0, |last| now_ms.saturating_sub(last));
            if silent_for > self.liveness_limit() {
                log::warn!("No heartbeat ack for {silent_for} ms, marking connection unstable");
                self.next_heartbeat_at = None;
                self.transition(ConnectionState::Unstable);
                if let Err(e) = self.schedule_reconnect(now_ms) {
                    log::error!("{e}");
                }
            } else if self.next_heartbeat_at.is_some_and(|at| at <= now_ms) {
                self.send_heartbeat(now_ms);
            }
        }

        if self.reconnect_at.is_some_and(|at| at <= now_ms) {
            self.reconnect_at = None;
            return self.attempt_reconnect(now_ms);
        }
        None
    }

    fn send_heartbeat(&mut self, now_ms: u64) {
        self.next_heartbeat_at = Some(now_ms + millis(self.config.heartbeat_interval));
        let Some(topic) = &self.topic else {
            return;
        };
        if let Err(e) = self.transport.heartbeat(topic) {
            log::warn!("Heartbeat on {topic} failed: {e}");
            self.on_transport_failure(now_ms);
        }
    }

    /// Schedule the next reconnect, or fail once the budget is spent.
    fn schedule_reconnect(&mut self, now_ms: u64) -> Result<(), SyncError> {
        if self.attempts >= self.config.max_reconnect_attempts {
            self.clear_timers();
            self.transition(ConnectionState::Failed);
            return Err(SyncError::ReconnectExhausted {
                attempts: self.attempts,
            });
        }
        self.attempts += 1;
        let delay = backoff_delay(&self.config, self.attempts);
        log::info!(
            "Reconnect attempt {}/{} in {delay:?}",
            self.attempts,
            self.config.max_reconnect_attempts
        );
        self.reconnect_at = Some(now_ms + millis(delay));
        Ok(())
    }

    fn attempt_reconnect(&mut self, now_ms: u64) -> Option<Subscription> {
        let topic = self.topic.clone()?;
        // Untrack before unsubscribing so peers see us leave.
        if let Err(e) = self.transport.untrack_presence(&topic) {
            log::debug!("Presence untrack on {topic} failed: {e}");
        }
        self.transport.unsubscribe(&topic);
        self.transition(ConnectionState::Connecting);

        match self.transport.subscribe(&topic) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                log::warn!("Reconnect attempt {} failed: {e}", self.attempts);
                self.transition(ConnectionState::Disconnected);
                if let Err(e) = self.schedule_reconnect(now_ms) {
                    log::error!("{e}");
                }
                None
            }
        }
    }

    fn on_transport_failure(&mut self, now_ms: u64) {
        match self.state {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Unstable => {
                self.last_ack_at = None;
                self.next_heartbeat_at = None;
                self.transition(ConnectionState::Disconnected);
                if self.reconnect_at.is_none() {
                    if let Err(e) = self.schedule_reconnect(now_ms) {
                        log::error!("{e}");
                    }
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {}
        }
    }

    fn clear_timers(&mut self) {
        self.last_ack_at = None;
        self.next_heartbeat_at = None;
        self.reconnect_at = None;
    }

    /// Leave the channel. Idempotent.
    pub fn disconnect(&mut self) {
        self.clear_timers();
        if let Some(topic) = self.topic.take() {
            if let Err(e) = self.transport.untrack_presence(&topic) {
                log::debug!("Presence untrack on {topic} failed: {e}");
            }
            self.transport.unsubscribe(&topic);
        }
        self.attempts = 0;
        self.transition(ConnectionState::Disconnected);
    }

    /// Publish a change, or buffer it while the channel is not connected.
    pub fn send(&mut self, message: ChangeMessage, now_ms: u64) -> Result<Delivery, SyncError> {
        let topic = match &self.topic {
            Some(topic) if self.state == ConnectionState::Connected => topic.clone(),
            _ => return Ok(self.queue(message, now_ms)),
        };
        let payload = protocol::encode(&message)?;
        match self.transport.publish(&topic, events::FILE_CHANGE, payload) {
            Ok(()) => Ok(Delivery::Sent),
            Err(e) => {
                log::warn!("Publish of {} failed, buffering: {e}", message.message_id);
                self.on_transport_failure(now_ms);
                Ok(self.queue(message, now_ms))
            }
        }
    }

    fn queue(&mut self, message: ChangeMessage, now_ms: u64) -> Delivery {
        let evicted = self.offline.enqueue(message, now_ms).is_some();
        Delivery::Queued { evicted }
    }

    /// Best-effort publish; dropped unless connected. Returns whether it went out.
    pub fn send_ephemeral(&mut self, event: &str, payload: serde_json::Value, now_ms: u64) -> bool {
        let topic = match &self.topic {
            Some(topic) if self.state == ConnectionState::Connected => topic.clone(),
            _ => return false,
        };
        match self.transport.publish(&topic, event, payload) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Dropping {event}: {e}");
                self.on_transport_failure(now_ms);
                false
            }
        }
    }

    /// Drain the offline buffer through the channel, paced by `flush_delay`.
    pub async fn flush_offline<S: Sleep>(&mut self, sleep: &S) -> FlushReport {
        let Some(topic) = self.topic.clone() else {
            return FlushReport::default();
        };
        if self.state != ConnectionState::Connected || self.offline.is_empty() {
            return FlushReport::default();
        }
        let transport = Arc::clone(&self.transport);
        let delay = self.config.flush_delay;
        self.offline
            .flush(
                |message| {
                    let payload = protocol::encode(message)?;
                    transport.publish(&topic, events::FILE_CHANGE, payload)?;
                    Ok(())
                },
                sleep,
                delay,
            )
            .await
    }

    fn transition(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        let previous = self.state;
        self.state = next;
        log::info!(
            "Connection {previous:?} -> {next:?} (attempts: {})",
            self.attempts
        );
        self.events.emit_status(StatusChange {
            status: next,
            previous,
            attempts: self.attempts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NoSleep;
    use crate::diff::DiffEnvelope;
    use crate::protocol::{Participant, Role};
    use crate::transport::{LocalHub, LocalTransport, TransportEvent};
    use uuid::Uuid;

    const TOPIC: &str = "session:TEST1";

    fn manager(hub: &LocalHub) -> (ConnectionManager, Arc<LocalTransport>, EventBus) {
        let transport = Arc::new(hub.connect());
        let events = EventBus::new(64);
        let mgr = ConnectionManager::new(
            transport.clone(),
            ConnectionConfig::default(),
            events.clone(),
        );
        (mgr, transport, events)
    }

    fn change(n: u64) -> ChangeMessage {
        ChangeMessage {
            message_id: format!("m{n}"),
            sender_id: Uuid::nil(),
            sender_name: "t".into(),
            path: "a.txt".into(),
            diff: DiffEnvelope::full("x"),
            content_hash: String::new(),
            version: n,
            cursor: None,
            timestamp: n,
        }
    }

    fn connected(hub: &LocalHub) -> (ConnectionManager, Arc<LocalTransport>, Subscription) {
        let (mut mgr, transport, _) = manager(hub);
        let mut sub = mgr.connect(TOPIC, 0).unwrap();
        assert_eq!(
            sub.try_recv().unwrap(),
            TransportEvent::Status(ChannelStatus::Subscribed)
        );
        assert!(mgr.handle_status(ChannelStatus::Subscribed, 0));
        (mgr, transport, sub)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ConnectionConfig::default();
        let delays: Vec<u64> = (1..=7)
            .map(|n| backoff_delay(&config, n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        assert_eq!(backoff_delay(&config, 40), Duration::from_secs(30));
    }

    #[test]
    fn test_connect_emits_status_transitions() {
        let hub = LocalHub::new();
        let (mut mgr, _t, events) = manager(&hub);
        let mut status = events.status();
        let _sub = mgr.connect(TOPIC, 0).unwrap();
        mgr.handle_status(ChannelStatus::Subscribed, 0);
        assert_eq!(mgr.state(), ConnectionState::Connected);

        let first = status.try_recv().unwrap();
        assert_eq!(first.previous, ConnectionState::Disconnected);
        assert_eq!(first.status, ConnectionState::Connecting);
        let second = status.try_recv().unwrap();
        assert_eq!(second.status, ConnectionState::Connected);
    }

    #[test]
    fn test_channel_error_schedules_backoff() {
        let hub = LocalHub::new();
        let (mut mgr, _t, _sub) = connected(&hub);
        mgr.handle_status(ChannelStatus::ChannelError, 5_000);
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(mgr.attempts(), 1);
        assert_eq!(mgr.next_deadline(), Some(6_000));

        assert!(mgr.poll_timers(5_999).is_none());
        let sub = mgr.poll_timers(6_000);
        assert!(sub.is_some());
        assert_eq!(mgr.state(), ConnectionState::Connecting);
        assert!(mgr.handle_status(ChannelStatus::Subscribed, 6_001));
        assert_eq!(mgr.attempts(), 0);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let hub = LocalHub::new();
        let (mut mgr, transport, _sub) = connected(&hub);
        let mut status = mgr.events.status();
        transport.set_online(false);
        mgr.handle_status(ChannelStatus::ChannelError, 0);

        let mut now = 0;
        let mut expected = vec![1_000, 2_000, 4_000, 8_000, 16_000].into_iter();
        while let Some(deadline) = mgr.next_deadline() {
            assert_eq!(deadline - now, expected.next().unwrap());
            now = deadline;
            assert!(mgr.poll_timers(now).is_none());
        }
        assert!(expected.next().is_none());
        assert_eq!(mgr.state(), ConnectionState::Failed);

        let last = std::iter::from_fn(|| status.try_recv().ok()).last().unwrap();
        assert_eq!(last.status, ConnectionState::Failed);
        assert_eq!(last.attempts, 5);

        // connect() is the only way out of Failed.
        mgr.handle_status(ChannelStatus::ChannelError, now);
        assert_eq!(mgr.state(), ConnectionState::Failed);
        transport.set_online(true);
        assert!(mgr.connect(TOPIC, now).is_ok());
        assert_eq!(mgr.attempts(), 0);
    }

    #[test]
    fn test_missing_heartbeat_acks_mark_unstable() {
        let hub = LocalHub::new();
        let (mut mgr, transport, mut sub) = connected(&hub);
        transport.set_heartbeat_acks(false);

        assert_eq!(mgr.next_deadline(), Some(10_000));
        assert!(mgr.poll_timers(10_000).is_none());
        assert!(mgr.poll_timers(20_000).is_none());
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.next_deadline(), Some(20_001));
        mgr.poll_timers(20_001);
        assert_eq!(mgr.state(), ConnectionState::Unstable);

        // A late ack recovers the connection.
        transport.set_heartbeat_acks(true);
        while sub.try_recv().is_ok() {}
        mgr.handle_heartbeat_ack(20_500);
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.attempts(), 0);
    }

    #[test]
    fn test_acked_heartbeats_keep_connection() {
        let hub = LocalHub::new();
        let (mut mgr, _t, mut sub) = connected(&hub);
        for tick in 1..=5 {
            let now = tick * 10_000;
            mgr.poll_timers(now);
            assert_eq!(sub.try_recv().unwrap(), TransportEvent::HeartbeatAck);
            mgr.handle_heartbeat_ack(now);
        }
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_send_buffers_while_disconnected() {
        let hub = LocalHub::new();
        let (mut mgr, _t, _) = manager(&hub);
        assert_eq!(
            mgr.send(change(1), 0).unwrap(),
            Delivery::Queued { evicted: false }
        );
        assert_eq!(mgr.offline().len(), 1);
        assert!(!mgr.send_ephemeral(events::CURSOR_MOVE, serde_json::Value::Null, 0));
    }

    #[tokio::test]
    async fn test_flush_after_reconnect() {
        let hub = LocalHub::new();
        let peer = hub.connect();
        let mut peer_sub = peer.subscribe(TOPIC).unwrap();
        peer_sub.recv().await.unwrap();

        let (mut mgr, _t, _) = manager(&hub);
        mgr.send(change(1), 0).unwrap();
        mgr.send(change(2), 0).unwrap();
        let _sub = mgr.connect(TOPIC, 0).unwrap();
        assert!(mgr.handle_status(ChannelStatus::Subscribed, 0));

        let report = mgr.flush_offline(&NoSleep).await;
        assert_eq!(report.sent, 2);
        assert!(mgr.offline().is_empty());

        for expected in 1..=2 {
            match peer_sub.recv().await.unwrap() {
                TransportEvent::Broadcast { event, payload } => {
                    assert_eq!(event, events::FILE_CHANGE);
                    let msg: ChangeMessage = protocol::decode(payload).unwrap();
                    assert_eq!(msg.version, expected);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_presence_tracked_on_connect() {
        let hub = LocalHub::new();
        let (mut mgr, _t, _) = manager(&hub);
        let participant = Participant::new("ada", Role::Owner);
        mgr.set_presence(PresenceEntry {
            participant: participant.clone(),
            online_at: 0,
        })
        .unwrap();
        let _sub = mgr.connect(TOPIC, 0).unwrap();
        mgr.handle_status(ChannelStatus::Subscribed, 0);
        let state = hub.presence_state(TOPIC);
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].participant.id, participant.id);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let hub = LocalHub::new();
        let (mut mgr, _t, _sub) = connected(&hub);
        mgr.disconnect();
        mgr.disconnect();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(hub.member_count(TOPIC), 0);
        assert!(mgr.next_deadline().is_none());
    }

    #[test]
    fn test_disconnect_after_subscription_lost() {
        let hub = LocalHub::new();
        let (mut mgr, transport, _sub) = connected(&hub);
        transport.unsubscribe(TOPIC);
        assert!(transport.untrack_presence(TOPIC).is_err());

        mgr.disconnect();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(hub.member_count(TOPIC), 0);
    }
}
