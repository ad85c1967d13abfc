//! WebSocket relay: the realtime service [`crate::transport::WsTransport`]
//! talks to.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌──► Client A (presence only)
//!             ├── TopicGroup(topic) ──┼──► Client B
//! Client B ──┘   broadcast channel    └──► Client C
//!                presence map
//! ```
//!
//! The relay keeps no documents. It fans `broadcast` frames out to every
//! other member of a topic and maintains the topic's presence state,
//! announcing joins and leaves followed by a full sync to everyone,
//! the originating client included. A client is a member of at most one
//! topic per connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{PresenceEntry, RelayFrame};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub max_peers_per_topic: usize,
    /// Frames buffered per member before a slow member starts lagging.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_topic: 100,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_topics: usize,
}

#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
}

// ─── Topics ──────────────────────────────────────────────────────────────────

/// A frame encoded once and shared by every member's receiver.
struct RoutedFrame {
    origin: u64,
    include_origin: bool,
    text: String,
}

struct TopicGroup {
    sender: broadcast::Sender<Arc<RoutedFrame>>,
    /// connection id → tracked presence
    members: RwLock<HashMap<u64, Option<PresenceEntry>>>,
}

impl TopicGroup {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Add a member; `None` when the topic is full.
    async fn join(&self, conn: u64, max: usize) -> Option<broadcast::Receiver<Arc<RoutedFrame>>> {
        let mut members = self.members.write().await;
        if !members.contains_key(&conn) && members.len() >= max {
            return None;
        }
        members.entry(conn).or_insert(None);
        Some(self.sender.subscribe())
    }

    /// Remove a member, returning what it had tracked.
    async fn leave(&self, conn: u64) -> Option<PresenceEntry> {
        self.members.write().await.remove(&conn).flatten()
    }

    async fn track(&self, conn: u64, entry: PresenceEntry) -> bool {
        match self.members.write().await.get_mut(&conn) {
            Some(slot) => {
                *slot = Some(entry);
                true
            }
            None => false,
        }
    }

    async fn untrack(&self, conn: u64) -> Option<PresenceEntry> {
        self.members
            .write()
            .await
            .get_mut(&conn)
            .and_then(Option::take)
    }

    /// Tracked entries in connection order.
    async fn presence(&self) -> Vec<PresenceEntry> {
        let members = self.members.read().await;
        let mut tracked: Vec<(&u64, &PresenceEntry)> = members
            .iter()
            .filter_map(|(conn, entry)| entry.as_ref().map(|e| (conn, e)))
            .collect();
        tracked.sort_by_key(|(conn, _)| **conn);
        tracked.into_iter().map(|(_, e)| e.clone()).collect()
    }

    async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Encode once and hand to every receiver. Returns the receiver count.
    fn route(&self, origin: u64, include_origin: bool, frame: &RelayFrame) -> usize {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Dropping unencodable frame: {e}");
                return 0;
            }
        };
        self.sender
            .send(Arc::new(RoutedFrame {
                origin,
                include_origin,
                text,
            }))
            .unwrap_or(0)
    }

    /// Announce a presence change, then the full state, to everyone.
    async fn announce(&self, topic: &str, origin: u64, change: RelayFrame) {
        self.route(origin, true, &change);
        let entries = self.presence().await;
        self.route(
            origin,
            true,
            &RelayFrame::PresenceSync {
                topic: topic.to_owned(),
                entries,
            },
        );
    }
}

/// topic → group.
struct TopicRegistry {
    topics: RwLock<HashMap<String, Arc<TopicGroup>>>,
    capacity: usize,
}

impl TopicRegistry {
    fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Add `conn` to `topic`, creating the group on first use. `None` when
    /// the topic is full.
    ///
    /// The registry write lock is held across the member insert, so
    /// [`TopicRegistry::remove_if_empty`] cannot drop a group between its
    /// lookup and the join.
    async fn join(
        &self,
        topic: &str,
        conn: u64,
        max: usize,
    ) -> Option<(Arc<TopicGroup>, broadcast::Receiver<Arc<RoutedFrame>>)> {
        let mut topics = self.topics.write().await;
        let group = topics
            .entry(topic.to_owned())
            .or_insert_with(|| Arc::new(TopicGroup::new(self.capacity)))
            .clone();
        match group.join(conn, max).await {
            Some(rx) => Some((group, rx)),
            None => {
                if group.member_count().await == 0 {
                    topics.remove(topic);
                }
                None
            }
        }
    }

    async fn remove_if_empty(&self, topic: &str) -> bool {
        let mut topics = self.topics.write().await;
        if let Some(group) = topics.get(topic) {
            if group.member_count().await == 0 {
                topics.remove(topic);
                return true;
            }
        }
        false
    }

    async fn len(&self) -> usize {
        self.topics.read().await.len()
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<TopicRegistry>,
    stats: Arc<AtomicRelayStats>,
    next_connection: AtomicU64,
}

/// What one connection handler needs from the server.
#[derive(Clone)]
struct Shared {
    registry: Arc<TopicRegistry>,
    stats: Arc<AtomicRelayStats>,
    max_peers: usize,
}

/// Per-connection membership.
#[derive(Default)]
struct Membership {
    joined: Option<(String, Arc<TopicGroup>)>,
    routed: Option<broadcast::Receiver<Arc<RoutedFrame>>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(TopicRegistry::new(config.broadcast_capacity.max(1))),
            stats: Arc::new(AtomicRelayStats::default()),
            next_connection: AtomicU64::new(1),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_frames: self.stats.total_frames.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_topics: self.registry.len().await,
        }
    }

    /// Bind `bind_addr` and serve forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        let shared = Shared {
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            max_peers: self.config.max_peers_per_topic,
        };

        loop {
            let (stream, addr) = listener.accept().await?;
            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            log::debug!("New TCP connection {id} from {addr}");

            let shared = shared.clone();
            tokio::spawn(async move {
                shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = handle_connection(stream, addr, id, &shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

async fn next_routed(
    routed: &mut Option<broadcast::Receiver<Arc<RoutedFrame>>>,
) -> Result<Arc<RoutedFrame>, RecvError> {
    match routed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    shared: &Shared,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection {id} established from {addr}");

    let mut membership = Membership::default();
    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            shared.stats.total_frames.fetch_add(1, Ordering::Relaxed);
                            shared.stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                            let replies = match RelayFrame::decode(text.as_str()) {
                                Ok(frame) => handle_frame(id, shared, &mut membership, frame).await,
                                Err(e) => vec![RelayFrame::Error { message: e.to_string() }],
                            };
                            for reply in replies {
                                ws_sender.send(Message::Text(reply.encode()?.into())).await?;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {id} closed from {addr}");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                routed = next_routed(&mut membership.routed) => {
                    match routed {
                        Ok(frame) => {
                            if frame.origin != id || frame.include_origin {
                                ws_sender.send(Message::Text(frame.text.clone().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Connection {id} lagged by {n} frames");
                        }
                        Err(RecvError::Closed) => membership.routed = None,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    leave_topic(id, shared, &mut membership).await;
    result
}

async fn leave_topic(id: u64, shared: &Shared, membership: &mut Membership) {
    membership.routed = None;
    let Some((topic, group)) = membership.joined.take() else {
        return;
    };
    if let Some(entry) = group.leave(id).await {
        group
            .announce(
                &topic,
                id,
                RelayFrame::PresenceLeave {
                    topic: topic.clone(),
                    entries: vec![entry],
                },
            )
            .await;
    }
    if shared.registry.remove_if_empty(&topic).await {
        log::debug!("Topic {topic} is empty, removed");
    }
}

fn not_subscribed(topic: &str) -> Vec<RelayFrame> {
    vec![RelayFrame::Error {
        message: format!("not subscribed to {topic}"),
    }]
}

/// Apply one client frame. Returns frames to send straight back.
async fn handle_frame(
    id: u64,
    shared: &Shared,
    membership: &mut Membership,
    frame: RelayFrame,
) -> Vec<RelayFrame> {
    let current = membership
        .joined
        .as_ref()
        .map(|(topic, group)| (topic.clone(), group.clone()));
    let member_of = |topic: &str| {
        current
            .as_ref()
            .filter(|(joined, _)| joined == topic)
            .map(|(_, group)| group.clone())
    };

    match frame {
        RelayFrame::Subscribe { topic } => {
            if current.as_ref().is_some_and(|(joined, _)| *joined != topic) {
                leave_topic(id, shared, membership).await;
            }
            let Some((group, rx)) = shared.registry.join(&topic, id, shared.max_peers).await else {
                log::warn!("Topic {topic} is full, refusing connection {id}");
                return vec![RelayFrame::Error {
                    message: format!("topic {topic} is full"),
                }];
            };
            let entries = group.presence().await;
            membership.routed = Some(rx);
            membership.joined = Some((topic.clone(), group));
            log::info!("Connection {id} subscribed to {topic}");
            vec![
                RelayFrame::Subscribed {
                    topic: topic.clone(),
                },
                RelayFrame::PresenceSync { topic, entries },
            ]
        }

        RelayFrame::Unsubscribe { topic } => {
            if member_of(&topic).is_some() {
                leave_topic(id, shared, membership).await;
            }
            Vec::new()
        }

        RelayFrame::Track { topic, entry } => {
            let Some(group) = member_of(&topic) else {
                return not_subscribed(&topic);
            };
            if group.track(id, entry.clone()).await {
                let change = RelayFrame::PresenceJoin {
                    topic: topic.clone(),
                    entries: vec![entry],
                };
                group.announce(&topic, id, change).await;
            }
            Vec::new()
        }

        RelayFrame::Untrack { topic } => {
            let Some(group) = member_of(&topic) else {
                return not_subscribed(&topic);
            };
            if let Some(entry) = group.untrack(id).await {
                let change = RelayFrame::PresenceLeave {
                    topic: topic.clone(),
                    entries: vec![entry],
                };
                group.announce(&topic, id, change).await;
            }
            Vec::new()
        }

        RelayFrame::Ping { topic } => {
            if member_of(&topic).is_none() {
                return not_subscribed(&topic);
            }
            vec![RelayFrame::Pong { topic }]
        }

        RelayFrame::Broadcast {
            topic,
            event,
            payload,
        } => {
            let Some(group) = member_of(&topic) else {
                return not_subscribed(&topic);
            };
            let frame = RelayFrame::Broadcast {
                topic,
                event,
                payload,
            };
            let receivers = group.route(id, false, &frame);
            log::trace!("Routed broadcast from {id} to {receivers} receivers");
            Vec::new()
        }

        other => {
            log::debug!("Connection {id} sent a relay-only frame: {other:?}");
            vec![RelayFrame::Error {
                message: "unexpected frame".into(),
            }]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Participant, Role};

    fn entry(name: &str) -> PresenceEntry {
        PresenceEntry {
            participant: Participant::new(name, Role::Editor),
            online_at: 0,
        }
    }

    #[tokio::test]
    async fn test_topic_group_capacity() {
        let group = TopicGroup::new(16);
        assert!(group.join(1, 2).await.is_some());
        assert!(group.join(2, 2).await.is_some());
        assert!(group.join(3, 2).await.is_none());
        // Rejoining an existing member is not refused.
        assert!(group.join(1, 2).await.is_some());
        assert_eq!(group.member_count().await, 2);
    }

    #[tokio::test]
    async fn test_track_untrack_presence() {
        let group = TopicGroup::new(16);
        group.join(2, 10).await;
        group.join(1, 10).await;
        assert!(group.track(2, entry("bea")).await);
        assert!(group.track(1, entry("al")).await);
        assert!(!group.track(9, entry("ghost")).await);

        let names: Vec<String> = group
            .presence()
            .await
            .into_iter()
            .map(|e| e.participant.name)
            .collect();
        assert_eq!(names, vec!["al", "bea"]);

        assert_eq!(group.untrack(1).await.map(|e| e.participant.name), Some("al".into()));
        assert!(group.untrack(1).await.is_none());
        assert!(group.leave(1).await.is_none());
        assert!(group.leave(2).await.is_some());
    }

    #[tokio::test]
    async fn test_route_skips_origin_unless_included() {
        let group = TopicGroup::new(16);
        let mut rx = group.join(1, 10).await.unwrap();
        let ping = RelayFrame::Pong { topic: "t".into() };
        assert_eq!(group.route(1, false, &ping), 1);
        let routed = rx.recv().await.unwrap();
        assert_eq!(routed.origin, 1);
        assert!(!routed.include_origin);
        assert_eq!(RelayFrame::decode(&routed.text).unwrap(), ping);
    }

    #[tokio::test]
    async fn test_registry_join_and_remove() {
        let registry = TopicRegistry::new(16);
        let (a, _rx_a) = registry.join("session:ABCDE", 1, 10).await.unwrap();
        let (b, _rx_b) = registry.join("session:ABCDE", 2, 10).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);

        a.leave(1).await;
        assert!(!registry.remove_if_empty("session:ABCDE").await);
        b.leave(2).await;
        assert!(registry.remove_if_empty("session:ABCDE").await);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_registry_refused_join_leaves_no_empty_group() {
        let registry = TopicRegistry::new(16);
        assert!(registry.join("session:FULL1", 1, 0).await.is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_joined_group_stays_registered_under_churn() {
        const TOPIC: &str = "session:CHURN";
        let registry = Arc::new(TopicRegistry::new(16));
        let mut tasks = Vec::new();
        for conn in 0..16u64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let (group, _rx) = registry.join(TOPIC, conn, 64).await.unwrap();
                    let registered = registry.topics.read().await.get(TOPIC).cloned();
                    assert!(registered.is_some_and(|g| Arc::ptr_eq(&g, &group)));
                    group.leave(conn).await;
                    registry.remove_if_empty(TOPIC).await;
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_frames_require_subscription() {
        let shared = Shared {
            registry: Arc::new(TopicRegistry::new(16)),
            stats: Arc::new(AtomicRelayStats::default()),
            max_peers: 10,
        };
        let mut membership = Membership::default();
        let replies = handle_frame(
            1,
            &shared,
            &mut membership,
            RelayFrame::Ping { topic: "t".into() },
        )
        .await;
        assert!(matches!(replies.as_slice(), [RelayFrame::Error { .. }]));

        let replies = handle_frame(
            1,
            &shared,
            &mut membership,
            RelayFrame::Subscribe { topic: "t".into() },
        )
        .await;
        assert_eq!(replies[0], RelayFrame::Subscribed { topic: "t".into() });

        let replies = handle_frame(
            1,
            &shared,
            &mut membership,
            RelayFrame::Ping { topic: "t".into() },
        )
        .await;
        assert_eq!(replies, vec![RelayFrame::Pong { topic: "t".into() }]);

        leave_topic(1, &shared, &mut membership).await;
        assert_eq!(shared.registry.len().await, 0);
    }
}
