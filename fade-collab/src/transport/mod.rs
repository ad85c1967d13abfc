//! Realtime channel abstraction.
//!
//! A [`Transport`] gives one client access to named topics: broadcast with
//! sender exclusion, a presence set per topic, and heartbeats. Everything a
//! topic produces for this client arrives on the [`Subscription`] returned
//! by `subscribe`, in order.
//!
//! Two implementations:
//! - [`LocalHub`] / [`LocalTransport`] — in-process, for tests and embedding
//! - [`WsTransport`] — WebSocket client for [`crate::relay::RelayServer`]

use tokio::sync::mpsc;

use crate::protocol::{PresenceDiff, PresenceEntry};

pub mod local;
pub mod ws;

pub use local::{LocalHub, LocalTransport};
pub use ws::WsTransport;

/// Channel lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(ChannelStatus),
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    Presence(PresenceDiff),
    HeartbeatAck,
}

/// Receiving end of a topic subscription. Closed when the transport drops it.
pub type Subscription = mpsc::Receiver<TransportEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No subscription for the topic.
    NotSubscribed(String),
    /// The client is offline.
    Offline,
    /// The outgoing queue is full.
    ChannelFull,
    /// The underlying connection is gone.
    Closed,
    Connect(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSubscribed(topic) => write!(f, "Not subscribed to {topic}"),
            Self::Offline => write!(f, "Transport offline"),
            Self::ChannelFull => write!(f, "Outgoing channel full"),
            Self::Closed => write!(f, "Connection closed"),
            Self::Connect(e) => write!(f, "Connect failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One client's view of the realtime service.
///
/// Methods are synchronous and never block; outgoing data is queued.
pub trait Transport: Send + Sync {
    /// Open (or reopen) a topic. A `Status(Subscribed)` event follows once
    /// the channel is live.
    fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;

    /// Leave a topic. Idempotent.
    fn unsubscribe(&self, topic: &str);

    /// Send to every other subscriber of the topic.
    fn publish(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Add or replace this client's entry in the topic's presence set.
    fn track_presence(&self, topic: &str, entry: PresenceEntry) -> Result<(), TransportError>;

    fn untrack_presence(&self, topic: &str) -> Result<(), TransportError>;

    /// Liveness probe; answered with `HeartbeatAck`.
    fn heartbeat(&self, topic: &str) -> Result<(), TransportError>;
}
