//! In-process transport.
//!
//! A [`LocalHub`] plays the realtime service; every [`LocalTransport`] made
//! from it is one client. Delivery is immediate and ordered per receiver.
//! Clients can be taken offline and heartbeat acks can be muted, which is
//! how the reconnect and liveness paths are exercised without a network.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{ChannelStatus, Subscription, Transport, TransportError, TransportEvent};
use crate::protocol::{PresenceDiff, PresenceEntry};

const DEFAULT_CAPACITY: usize = 256;

struct Member {
    client: u64,
    events: mpsc::Sender<TransportEvent>,
    presence: Option<PresenceEntry>,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<String, Vec<Member>>,
    offline: HashSet<u64>,
    muted_heartbeats: HashSet<u64>,
}

struct HubInner {
    state: Mutex<HubState>,
    capacity: usize,
    next_client: AtomicU64,
}

/// Shared in-memory realtime service.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds each subscription's queue; overflow is dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState::default()),
                capacity: capacity.max(1),
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// A new client of this hub.
    pub fn connect(&self) -> LocalTransport {
        LocalTransport {
            hub: self.clone(),
            client: self.inner.next_client.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn member_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, Vec::len)
    }

    pub fn presence_state(&self, topic: &str) -> Vec<PresenceEntry> {
        self.lock()
            .topics
            .get(topic)
            .map(|members| presence_snapshot(members))
            .unwrap_or_default()
    }

    /// Take a client offline (its subscriptions error out) or back online.
    pub fn set_online(&self, client: u64, online: bool) {
        let mut state = self.lock();
        if online {
            state.offline.remove(&client);
            return;
        }
        if !state.offline.insert(client) {
            return;
        }
        log::info!("Local client {client} going offline");
        for members in state.topics.values_mut() {
            let Some(index) = members.iter().position(|m| m.client == client) else {
                continue;
            };
            let member = members.remove(index);
            deliver(&member, TransportEvent::Status(ChannelStatus::ChannelError));
            if let Some(entry) = member.presence {
                notify_presence(members, PresenceDiff::Leave(vec![entry]));
            }
        }
        state.topics.retain(|_, members| !members.is_empty());
    }

    /// Mute or restore heartbeat acks for a client.
    pub fn set_heartbeat_acks(&self, client: u64, enabled: bool) {
        let mut state = self.lock();
        if enabled {
            state.muted_heartbeats.remove(&client);
        } else {
            state.muted_heartbeats.insert(client);
        }
    }
}

fn deliver(member: &Member, event: TransportEvent) {
    match member.events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            log::warn!("Local client {} lagging, event dropped", member.client);
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

fn presence_snapshot(members: &[Member]) -> Vec<PresenceEntry> {
    members.iter().filter_map(|m| m.presence.clone()).collect()
}

/// Tell every member about a presence diff, followed by a full sync.
fn notify_presence(members: &[Member], diff: PresenceDiff) {
    let snapshot = presence_snapshot(members);
    for member in members {
        deliver(member, TransportEvent::Presence(diff.clone()));
        deliver(member, TransportEvent::Presence(PresenceDiff::Sync(snapshot.clone())));
    }
}

/// One client of a [`LocalHub`].
pub struct LocalTransport {
    hub: LocalHub,
    client: u64,
}

impl LocalTransport {
    pub fn client_id(&self) -> u64 {
        self.client
    }

    pub fn set_online(&self, online: bool) {
        self.hub.set_online(self.client, online);
    }

    pub fn set_heartbeat_acks(&self, enabled: bool) {
        self.hub.set_heartbeat_acks(self.client, enabled);
    }

    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }
}

impl Transport for LocalTransport {
    fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let mut state = self.hub.lock();
        if state.offline.contains(&self.client) {
            return Err(TransportError::Offline);
        }

        let (tx, rx) = mpsc::channel(self.hub.inner.capacity);
        let members = state.topics.entry(topic.to_owned()).or_default();
        if let Some(index) = members.iter().position(|m| m.client == self.client) {
            let previous = members.remove(index);
            if let Some(entry) = previous.presence {
                notify_presence(members, PresenceDiff::Leave(vec![entry]));
            }
        }

        let member = Member {
            client: self.client,
            events: tx,
            presence: None,
        };
        deliver(&member, TransportEvent::Status(ChannelStatus::Subscribed));
        members.push(member);
        log::debug!("Local client {} subscribed to {topic}", self.client);
        Ok(rx)
    }

    fn unsubscribe(&self, topic: &str) {
        let mut state = self.hub.lock();
        let Some(members) = state.topics.get_mut(topic) else {
            return;
        };
        if let Some(index) = members.iter().position(|m| m.client == self.client) {
            let member = members.remove(index);
            if let Some(entry) = member.presence {
                notify_presence(members, PresenceDiff::Leave(vec![entry]));
            }
        }
        if members.is_empty() {
            state.topics.remove(topic);
        }
    }

    fn publish(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        let state = self.hub.lock();
        if state.offline.contains(&self.client) {
            return Err(TransportError::Offline);
        }
        let members = state
            .topics
            .get(topic)
            .filter(|members| members.iter().any(|m| m.client == self.client))
            .ok_or_else(|| TransportError::NotSubscribed(topic.to_owned()))?;

        for member in members.iter().filter(|m| m.client != self.client) {
            deliver(
                member,
                TransportEvent::Broadcast {
                    event: event.to_owned(),
                    payload: payload.clone(),
                },
            );
        }
        Ok(())
    }

    fn track_presence(&self, topic: &str, entry: PresenceEntry) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        if state.offline.contains(&self.client) {
            return Err(TransportError::Offline);
        }
        let members = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::NotSubscribed(topic.to_owned()))?;
        let member = members
            .iter_mut()
            .find(|m| m.client == self.client)
            .ok_or_else(|| TransportError::NotSubscribed(topic.to_owned()))?;
        member.presence = Some(entry.clone());
        notify_presence(members, PresenceDiff::Join(vec![entry]));
        Ok(())
    }

    fn untrack_presence(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        let members = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::NotSubscribed(topic.to_owned()))?;
        let Some(member) = members.iter_mut().find(|m| m.client == self.client) else {
            return Err(TransportError::NotSubscribed(topic.to_owned()));
        };
        if let Some(entry) = member.presence.take() {
            notify_presence(members, PresenceDiff::Leave(vec![entry]));
        }
        Ok(())
    }

    fn heartbeat(&self, topic: &str) -> Result<(), TransportError> {
        let state = self.hub.lock();
        if state.offline.contains(&self.client) {
            return Err(TransportError::Offline);
        }
        let member = state
            .topics
            .get(topic)
            .and_then(|members| members.iter().find(|m| m.client == self.client))
            .ok_or_else(|| TransportError::NotSubscribed(topic.to_owned()))?;
        if !state.muted_heartbeats.contains(&self.client) {
            deliver(member, TransportEvent::HeartbeatAck);
        }
        Ok(())
    }
}
