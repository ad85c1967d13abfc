//! Integration tests against a real relay over WebSockets.

use std::collections::BTreeMap;
use std::sync::Arc;

use fade_collab::protocol::RelayFrame;
use fade_collab::{
    ConnectionState, MemorySnapshotStore, RelayConfig, RelayServer, SessionDeps, SessionHandle,
    SyncConfig, SyncSession, TokioClock, WsTransport,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

/// Start a relay on a free port, return its URL and the server.
async fn start_relay() -> (String, Arc<RelayServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(RelayServer::new(RelayConfig {
        bind_addr: addr.to_string(),
        max_peers_per_topic: 10,
        broadcast_capacity: 64,
    }));
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run_on(listener).await;
    });
    (format!("ws://{addr}"), server)
}

fn deps(url: &str, store: &Arc<MemorySnapshotStore>) -> SessionDeps {
    SessionDeps {
        transport: Arc::new(WsTransport::new(url)),
        clock: Arc::new(TokioClock::new()),
        store: Some(store.clone()),
    }
}

async fn wait_for_participants(handle: &SessionHandle, count: usize) {
    timeout(WAIT, async {
        while handle.participants().await.len() != count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("presence never converged");
}

async fn next_frame<S>(ws: &mut S) -> RelayFrame
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return RelayFrame::decode(text.as_str()).unwrap();
        }
    }
}

async fn send_frame<S>(ws: &mut S, frame: &RelayFrame)
where
    S: Sink<Message> + Unpin,
    <S as Sink<Message>>::Error: std::fmt::Debug,
{
    ws.send(Message::Text(frame.encode().unwrap().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_raw_subscribe_and_broadcast() {
    let (url, _server) = start_relay().await;
    let (mut a, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut b, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let topic = "session:RAW01".to_string();

    for ws in [&mut a, &mut b] {
        send_frame(ws, &RelayFrame::Subscribe { topic: topic.clone() }).await;
        assert_eq!(
            next_frame(ws).await,
            RelayFrame::Subscribed { topic: topic.clone() }
        );
        assert!(matches!(next_frame(ws).await, RelayFrame::PresenceSync { .. }));
    }

    let hello = RelayFrame::Broadcast {
        topic: topic.clone(),
        event: "file-change".into(),
        payload: serde_json::json!({ "n": 1 }),
    };
    send_frame(&mut a, &hello).await;
    assert_eq!(next_frame(&mut b).await, hello);

    // The sender does not get its own broadcast back; the next thing it
    // sees is the pong.
    send_frame(&mut a, &RelayFrame::Ping { topic: topic.clone() }).await;
    assert_eq!(next_frame(&mut a).await, RelayFrame::Pong { topic });
}

#[tokio::test]
async fn test_frames_before_subscribe_are_rejected() {
    let (url, _server) = start_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    send_frame(&mut ws, &RelayFrame::Ping { topic: "session:NONE1".into() }).await;
    assert!(matches!(next_frame(&mut ws).await, RelayFrame::Error { .. }));
}

#[tokio::test]
async fn test_sessions_sync_through_relay() {
    let (url, server) = start_relay().await;
    let store = Arc::new(MemorySnapshotStore::new());

    let mut files = BTreeMap::new();
    files.insert("readme.md".to_string(), "# hello".to_string());
    let (owner, sub) =
        SyncSession::create(SyncConfig::default(), deps(&url, &store), "ada", "relay", files)
            .unwrap();
    let ada = SessionHandle::spawn(owner, sub);

    let (joiner, sub) =
        SyncSession::join(SyncConfig::default(), deps(&url, &store), &ada.info().code, "bob")
            .unwrap();
    let bob = SessionHandle::spawn(joiner, sub);

    wait_for_participants(&ada, 2).await;
    wait_for_participants(&bob, 2).await;
    assert_eq!(ada.connection_state().await, ConnectionState::Connected);

    let mut changes = bob.events().file_changes();
    ada.apply_local_change("readme.md", "# hello, relay", None)
        .await
        .unwrap();
    let change = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(change.content, "# hello, relay");
    assert_eq!(
        bob.document("readme.md").await.unwrap().content,
        "# hello, relay"
    );

    let stats = server.stats().await;
    assert_eq!(stats.active_topics, 1);
    assert!(stats.total_frames > 0);

    bob.leave().await;
    wait_for_participants(&ada, 1).await;
    ada.leave().await;
}

#[tokio::test]
async fn test_unreachable_relay_schedules_reconnect() {
    // Nothing listens on this port once the listener is dropped.
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let store = Arc::new(MemorySnapshotStore::new());
    let (session, sub) = SyncSession::create(
        SyncConfig::default(),
        deps(&format!("ws://{addr}"), &store),
        "ada",
        "offline",
        BTreeMap::new(),
    )
    .unwrap();
    let ada = SessionHandle::spawn(session, sub);

    let mut status = ada.events().status();
    let change = timeout(WAIT, status.recv()).await.unwrap().unwrap();
    assert_eq!(change.status, ConnectionState::Disconnected);
    assert_eq!(change.previous, ConnectionState::Connecting);

    // First retry fires after the initial backoff.
    let retry = timeout(WAIT, status.recv()).await.unwrap().unwrap();
    assert_eq!(retry.status, ConnectionState::Connecting);
    assert_eq!(retry.attempts, 1);
    ada.leave().await;
}
