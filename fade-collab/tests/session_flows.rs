//! End-to-end session flows over the in-process hub.
//!
//! Every test runs on paused tokio time, so heartbeat silence, reconnect
//! backoff and offline flush pacing play out instantly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fade_collab::{
    ConnectionState, Delivery, LocalHub, LocalTransport, MemorySnapshotStore, Role,
    SessionDeps, SessionHandle, SyncConfig, SyncError, SyncSession, TokioClock,
};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(120);

struct Fixture {
    hub: LocalHub,
    store: Arc<MemorySnapshotStore>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            hub: LocalHub::new(),
            store: Arc::new(MemorySnapshotStore::new()),
        }
    }

    fn deps(&self) -> (SessionDeps, Arc<LocalTransport>) {
        let transport = Arc::new(self.hub.connect());
        let deps = SessionDeps {
            transport: transport.clone(),
            clock: Arc::new(TokioClock::new()),
            store: Some(self.store.clone()),
        };
        (deps, transport)
    }

    fn create(&self, name: &str, files: &[(&str, &str)]) -> (SessionHandle, Arc<LocalTransport>) {
        let files: BTreeMap<String, String> = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        let (deps, transport) = self.deps();
        let (session, sub) =
            SyncSession::create(SyncConfig::default(), deps, name, "flows", files).unwrap();
        (SessionHandle::spawn(session, sub), transport)
    }

    fn join(&self, code: &str, name: &str) -> (SessionHandle, Arc<LocalTransport>) {
        let (deps, transport) = self.deps();
        let (session, sub) = SyncSession::join(SyncConfig::default(), deps, code, name).unwrap();
        (SessionHandle::spawn(session, sub), transport)
    }
}

fn source_file() -> String {
    (1..=60)
        .map(|i| format!("fn step_{i}() -> u32 {{ {i} }}"))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn recv_matching<T: Clone>(
    rx: &mut broadcast::Receiver<T>,
    mut pred: impl FnMut(&T) -> bool,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn participant_names(handle: &SessionHandle) -> Vec<String> {
    handle
        .participants()
        .await
        .into_iter()
        .map(|p| p.name)
        .collect()
}

async fn wait_for_participants(handle: &SessionHandle, names: &[&str]) {
    tokio::time::timeout(WAIT, async {
        while participant_names(handle).await != names {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("presence never converged");
}

async fn wait_for_state(handle: &SessionHandle, state: ConnectionState) {
    tokio::time::timeout(WAIT, async {
        while handle.connection_state().await != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection never reached the expected state");
}

#[tokio::test(start_paused = true)]
async fn test_edit_reaches_joined_peer() {
    let fx = Fixture::new();
    let original = source_file();
    let (ada, _) = fx.create("ada", &[("src/lib.rs", original.as_str())]);
    let (bob, _) = fx.join(&ada.info().code, "bob");

    assert_eq!(
        bob.document("src/lib.rs").await.unwrap().content,
        original
    );
    wait_for_participants(&bob, &["ada", "bob"]).await;

    let mut changes = bob.events().file_changes();
    let edited = original.replace("{ 7 }", "{ 7 * 6 }");
    let delivery = ada.apply_local_change("src/lib.rs", edited.clone(), None).await.unwrap();
    assert_eq!(delivery, Some(Delivery::Sent));

    let change = recv_matching(&mut changes, |c| c.path == "src/lib.rs").await;
    assert_eq!(change.content, edited);
    assert_eq!(change.version, 1);
    assert_eq!(change.sender_id, ada.local().id);

    let stats = ada.stats().await;
    assert_eq!(stats.diffs_used, 1);
    assert!(stats.total_bytes_sent < edited.len() as u64);

    ada.leave().await;
    bob.leave().await;
}

#[tokio::test(start_paused = true)]
async fn test_offline_edits_flush_in_order() {
    let fx = Fixture::new();
    let (ada, ada_link) = fx.create("ada", &[("notes.md", "draft")]);
    let (bob, _) = fx.join(&ada.info().code, "bob");
    wait_for_state(&ada, ConnectionState::Connected).await;

    let mut status = ada.events().status();
    ada_link.set_online(false);
    recv_matching(&mut status, |s| s.status == ConnectionState::Disconnected).await;

    for n in 1..=3 {
        let delivery = ada
            .apply_local_change("notes.md", format!("draft v{n}"), None)
            .await
            .unwrap();
        assert!(matches!(delivery, Some(Delivery::Queued { evicted: false })));
    }

    let mut changes = bob.events().file_changes();
    ada_link.set_online(true);

    for n in 1..=3u64 {
        let change = recv_matching(&mut changes, |_| true).await;
        assert_eq!(change.version, n);
        assert_eq!(change.content, format!("draft v{n}"));
    }
    assert_eq!(ada.connection_state().await, ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_presence_converges_across_three_peers() {
    let fx = Fixture::new();
    let (ada, _) = fx.create("ada", &[]);
    let code = ada.info().code.clone();
    let (bob, _) = fx.join(&code, "bob");
    let (cy, _) = fx.join(&code, "cy");

    for handle in [&ada, &bob, &cy] {
        wait_for_participants(handle, &["ada", "bob", "cy"]).await;
    }

    cy.leave().await;
    for handle in [&ada, &bob] {
        wait_for_participants(handle, &["ada", "bob"]).await;
    }
    assert_eq!(cy.connection_state().await, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_owner_demotes_editor() {
    let fx = Fixture::new();
    let (ada, _) = fx.create("ada", &[("a.txt", "alpha")]);
    let (bob, _) = fx.join(&ada.info().code, "bob");
    wait_for_participants(&ada, &["ada", "bob"]).await;

    let mut roles = bob.events().roles();
    ada.change_role(bob.local().id, Role::Viewer).await.unwrap();
    recv_matching(&mut roles, |r| r.user_id == bob.local().id && r.role == Role::Viewer).await;

    assert!(matches!(
        bob.apply_local_change("a.txt", "beta", None).await,
        Err(SyncError::PermissionDenied(_))
    ));
    assert!(matches!(
        bob.change_role(ada.local().id, Role::Viewer).await,
        Err(SyncError::PermissionDenied(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_silent_heartbeats_trigger_reconnect() {
    let fx = Fixture::new();
    let (ada, ada_link) = fx.create("ada", &[]);
    wait_for_state(&ada, ConnectionState::Connected).await;

    let mut status = ada.events().status();
    ada_link.set_heartbeat_acks(false);
    recv_matching(&mut status, |s| s.status == ConnectionState::Unstable).await;

    ada_link.set_heartbeat_acks(true);
    let recovered = recv_matching(&mut status, |s| s.status == ConnectionState::Connected).await;
    assert_eq!(recovered.attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_channel_fails_after_retries() {
    let fx = Fixture::new();
    let (ada, ada_link) = fx.create("ada", &[]);
    wait_for_state(&ada, ConnectionState::Connected).await;

    let mut status = ada.events().status();
    ada_link.set_online(false);
    let failed = recv_matching(&mut status, |s| s.status == ConnectionState::Failed).await;
    assert_eq!(failed.attempts, 5);

    ada_link.set_online(true);
    ada.reconnect().await.unwrap();
    wait_for_state(&ada, ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_owner_snapshot_seeds_late_joiner() {
    let fx = Fixture::new();
    let (ada, _) = fx.create("ada", &[("a.txt", "alpha")]);
    ada.apply_local_change("a.txt", "alpha two", None).await.unwrap();
    ada.apply_local_change("b.txt", "bravo", None).await.unwrap();
    let saved = ada.save_snapshot().await.unwrap();
    assert_eq!(saved.files.len(), 2);

    let (late, _) = fx.join(&ada.info().code, "late");
    assert_eq!(late.document("a.txt").await.unwrap().content, "alpha two");
    assert_eq!(late.document("b.txt").await.unwrap().content, "bravo");
    assert!(late.save_snapshot().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_handle_errors_after_leave() {
    let fx = Fixture::new();
    let (ada, _) = fx.create("ada", &[]);
    ada.leave().await;
    ada.leave().await;
    assert!(matches!(
        ada.apply_local_change("a.txt", "x", None).await,
        Err(SyncError::Transport(_))
    ));
    assert_eq!(ada.connection_state().await, ConnectionState::Disconnected);
}
