//! WebSocket transport for the relay server.
//!
//! Each subscribed topic gets its own socket task:
//!
//! ```text
//! publish/track/heartbeat ──► outgoing mpsc ──► [socket task] ──► relay
//!                                                    │
//! Subscription ◄──────────── TransportEvent ◄────────┘  (RelayFrame → event)
//! ```
//!
//! The task exits when the socket closes or the topic is unsubscribed; the
//! subscription then closes after a final `Closed`/`ChannelError` status.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;

use super::{ChannelStatus, Subscription, Transport, TransportError, TransportEvent};
use crate::protocol::{PresenceDiff, PresenceEntry, RelayFrame};

/// Client side of the relay protocol.
pub struct WsTransport {
    url: String,
    capacity: usize,
    sessions: Mutex<HashMap<String, mpsc::Sender<RelayFrame>>>,
}

impl WsTransport {
    /// `url` is the relay endpoint, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_capacity(url, 256)
    }

    pub fn with_capacity(url: impl Into<String>, capacity: usize) -> Self {
        Self {
            url: url.into(),
            capacity: capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<RelayFrame>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_frame(&self, topic: &str, frame: RelayFrame) -> Result<(), TransportError> {
        let sessions = self.sessions();
        let outgoing = sessions
            .get(topic)
            .ok_or_else(|| TransportError::NotSubscribed(topic.to_owned()))?;
        outgoing.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::ChannelFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

impl Transport for WsTransport {
    fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(self.capacity);
        let (out_tx, out_rx) = mpsc::channel(self.capacity);
        out_tx
            .try_send(RelayFrame::Subscribe {
                topic: topic.to_owned(),
            })
            .map_err(|_| TransportError::ChannelFull)?;

        // Replacing the sender ends the previous socket task.
        self.sessions().insert(topic.to_owned(), out_tx);
        runtime.spawn(run_socket(self.url.clone(), out_rx, event_tx));
        Ok(event_rx)
    }

    fn unsubscribe(&self, topic: &str) {
        if let Some(outgoing) = self.sessions().remove(topic) {
            let _ = outgoing.try_send(RelayFrame::Unsubscribe {
                topic: topic.to_owned(),
            });
        }
    }

    fn publish(
        &self,
        topic: &str,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.send_frame(
            topic,
            RelayFrame::Broadcast {
                topic: topic.to_owned(),
                event: event.to_owned(),
                payload,
            },
        )
    }

    fn track_presence(&self, topic: &str, entry: PresenceEntry) -> Result<(), TransportError> {
        self.send_frame(
            topic,
            RelayFrame::Track {
                topic: topic.to_owned(),
                entry,
            },
        )
    }

    fn untrack_presence(&self, topic: &str) -> Result<(), TransportError> {
        self.send_frame(
            topic,
            RelayFrame::Untrack {
                topic: topic.to_owned(),
            },
        )
    }

    fn heartbeat(&self, topic: &str) -> Result<(), TransportError> {
        self.send_frame(
            topic,
            RelayFrame::Ping {
                topic: topic.to_owned(),
            },
        )
    }
}

/// Map a relay frame to what the subscriber sees. Client-bound frames only.
fn frame_to_event(frame: RelayFrame) -> Option<TransportEvent> {
    match frame {
        RelayFrame::Subscribed { .. } => Some(TransportEvent::Status(ChannelStatus::Subscribed)),
        RelayFrame::Pong { .. } => Some(TransportEvent::HeartbeatAck),
        RelayFrame::Broadcast { event, payload, .. } => {
            Some(TransportEvent::Broadcast { event, payload })
        }
        RelayFrame::PresenceSync { entries, .. } => {
            Some(TransportEvent::Presence(PresenceDiff::Sync(entries)))
        }
        RelayFrame::PresenceJoin { entries, .. } => {
            Some(TransportEvent::Presence(PresenceDiff::Join(entries)))
        }
        RelayFrame::PresenceLeave { entries, .. } => {
            Some(TransportEvent::Presence(PresenceDiff::Leave(entries)))
        }
        RelayFrame::Error { message } => {
            log::warn!("Relay error: {message}");
            Some(TransportEvent::Status(ChannelStatus::ChannelError))
        }
        RelayFrame::Subscribe { .. }
        | RelayFrame::Unsubscribe { .. }
        | RelayFrame::Track { .. }
        | RelayFrame::Untrack { .. }
        | RelayFrame::Ping { .. } => None,
    }
}

async fn run_socket(
    url: String,
    mut outgoing: mpsc::Receiver<RelayFrame>,
    events: mpsc::Sender<TransportEvent>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            log::warn!("Relay connect to {url} failed: {e}");
            let _ = events
                .send(TransportEvent::Status(ChannelStatus::ChannelError))
                .await;
            return;
        }
    };
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    // Unsubscribed or replaced.
                    let _ = ws_writer.send(Message::Close(None)).await;
                    break;
                };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                    log::warn!("Relay send failed: {e}");
                    let _ = events.send(TransportEvent::Status(ChannelStatus::ChannelError)).await;
                    break;
                }
            }

            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match RelayFrame::decode(text.as_str()) {
                        Ok(frame) => {
                            if let Some(event) = frame_to_event(frame) {
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => log::warn!("Ignoring malformed relay frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events.send(TransportEvent::Status(ChannelStatus::Closed)).await;
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("Relay socket error: {e}");
                        let _ = events.send(TransportEvent::Status(ChannelStatus::ChannelError)).await;
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
