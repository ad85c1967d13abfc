//! Tokio driver for a [`SyncSession`].
//!
//! ```text
//! SessionHandle ──Command──► ┌──────────────┐ ◄── TransportEvent (Subscription)
//!      ▲                      │ runner task  │
//!      └──── oneshot reply ── └──────┬───────┘ ◄── sleep_until(next_deadline)
//!                                    │
//!                                EventBus ──► subscribers
//! ```
//!
//! The task owns the session. It wakes on a command, a transport event, or
//! the session's next timer deadline, so every timer (heartbeats, reconnect
//! backoff, cursor batches, typing expiry) runs without extra tasks.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::clock::{Sleep, TokioSleep};
use crate::connection::{ConnectionState, Delivery};
use crate::error::SyncError;
use crate::events::EventBus;
use crate::protocol::{CursorPosition, Participant, Role, Selection};
use crate::session::{DocumentState, SessionInfo, SyncSession, SyncStats};
use crate::storage::ProjectSnapshot;
use crate::transport::{Subscription, TransportError, TransportEvent};

const COMMAND_CAPACITY: usize = 64;

enum Command {
    LocalChange {
        path: String,
        content: String,
        cursor: Option<CursorPosition>,
        reply: oneshot::Sender<Result<Option<Delivery>, SyncError>>,
    },
    MoveCursor {
        path: String,
        position: CursorPosition,
        selection: Option<Selection>,
    },
    SetTyping(bool),
    ChangeRole {
        user_id: Uuid,
        role: Role,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    SaveSnapshot {
        reply: oneshot::Sender<Result<ProjectSnapshot, SyncError>>,
    },
    Document {
        path: String,
        reply: oneshot::Sender<Option<DocumentState>>,
    },
    Participants {
        reply: oneshot::Sender<Vec<Participant>>,
    },
    Stats {
        reply: oneshot::Sender<SyncStats>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: EventBus,
    info: SessionInfo,
    local: Participant,
}

fn closed() -> SyncError {
    SyncError::Transport(TransportError::Closed)
}

impl SessionHandle {
    /// Spawn the runner with tokio timers. Must be called inside a runtime.
    pub fn spawn(session: SyncSession, subscription: Subscription) -> Self {
        Self::spawn_with(session, subscription, TokioSleep)
    }

    /// Spawn with a custom sleep for offline-buffer pacing.
    pub fn spawn_with<S: Sleep>(session: SyncSession, subscription: Subscription, sleep: S) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = Self {
            commands: tx,
            events: session.events().clone(),
            info: session.info().clone(),
            local: session.local().clone(),
        };
        tokio::spawn(run(session, Some(subscription), rx, sleep));
        handle
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Local participant as of spawn; the role may since have changed.
    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Publish new content for `path`, with the editor's cursor if known.
    pub async fn apply_local_change(
        &self,
        path: impl Into<String>,
        content: impl Into<String>,
        cursor: Option<CursorPosition>,
    ) -> Result<Option<Delivery>, SyncError> {
        let (path, content) = (path.into(), content.into());
        self.request(|reply| Command::LocalChange {
            path,
            content,
            cursor,
            reply,
        })
            .await
            .unwrap_or_else(|| Err(closed()))
    }

    pub async fn move_cursor(
        &self,
        path: impl Into<String>,
        position: CursorPosition,
        selection: Option<Selection>,
    ) -> Result<(), SyncError> {
        self.commands
            .send(Command::MoveCursor {
                path: path.into(),
                position,
                selection,
            })
            .await
            .map_err(|_| closed())
    }

    pub async fn set_typing(&self, is_typing: bool) -> Result<(), SyncError> {
        self.commands
            .send(Command::SetTyping(is_typing))
            .await
            .map_err(|_| closed())
    }

    pub async fn change_role(&self, user_id: Uuid, role: Role) -> Result<(), SyncError> {
        self.request(|reply| Command::ChangeRole { user_id, role, reply })
            .await
            .unwrap_or_else(|| Err(closed()))
    }

    pub async fn save_snapshot(&self) -> Result<ProjectSnapshot, SyncError> {
        self.request(|reply| Command::SaveSnapshot { reply })
            .await
            .unwrap_or_else(|| Err(closed()))
    }

    pub async fn document(&self, path: impl Into<String>) -> Option<DocumentState> {
        let path = path.into();
        self.request(|reply| Command::Document { path, reply })
            .await
            .flatten()
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.request(|reply| Command::Participants { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> SyncStats {
        self.request(|reply| Command::Stats { reply })
            .await
            .unwrap_or_default()
    }

    /// `Disconnected` once the runner has stopped.
    pub async fn connection_state(&self) -> ConnectionState {
        self.request(|reply| Command::State { reply })
            .await
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Re-open the channel with a fresh retry budget.
    pub async fn reconnect(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Reconnect { reply })
            .await
            .unwrap_or_else(|| Err(closed()))
    }

    /// Leave the session and stop the runner. Idempotent.
    pub async fn leave(&self) {
        let _ = self.request(|reply| Command::Leave { reply }).await;
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<TransportEvent> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

async fn run<S: Sleep>(
    mut session: SyncSession,
    mut subscription: Option<Subscription>,
    mut commands: mpsc::Receiver<Command>,
    sleep: S,
) {
    log::debug!("Session runner for {} started", session.info().code);
    loop {
        let delay = session
            .next_deadline()
            .map(|at| Duration::from_millis(at.saturating_sub(session.now_ms())));

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    // Every handle dropped.
                    session.leave();
                    break;
                };
                if let ControlFlow::Stop = handle_command(&mut session, &mut subscription, command) {
                    break;
                }
            }

            event = next_event(&mut subscription) => {
                let Some(event) = event else {
                    subscription = None;
                    continue;
                };
                match session.handle_transport_event(event) {
                    Ok(true) => {
                        let report = session.flush_offline(&sleep).await;
                        if report.sent > 0 || report.requeued > 0 {
                            log::info!(
                                "Flushed offline buffer: {} sent, {} requeued",
                                report.sent,
                                report.requeued
                            );
                        }
                    }
                    Ok(false) => {}
                    Err(e) => log::warn!("{e}"),
                }
            }

            _ = wait_until(delay) => {
                if let Some(fresh) = session.poll_timers() {
                    subscription = Some(fresh);
                }
            }
        }
    }
    log::debug!("Session runner for {} stopped", session.info().code);
}

enum ControlFlow {
    Continue,
    Stop,
}

fn handle_command(
    session: &mut SyncSession,
    subscription: &mut Option<Subscription>,
    command: Command,
) -> ControlFlow {
    match command {
        Command::LocalChange {
            path,
            content,
            cursor,
            reply,
        } => {
            let _ = reply.send(session.apply_local_change(&path, &content, cursor));
        }
        Command::MoveCursor {
            path,
            position,
            selection,
        } => session.move_cursor(&path, position, selection),
        Command::SetTyping(is_typing) => {
            session.set_typing(is_typing);
        }
        Command::ChangeRole {
            user_id,
            role,
            reply,
        } => {
            let _ = reply.send(session.change_role(user_id, role));
        }
        Command::SaveSnapshot { reply } => {
            let _ = reply.send(session.save_snapshot());
        }
        Command::Document { path, reply } => {
            let _ = reply.send(session.document(&path).cloned());
        }
        Command::Participants { reply } => {
            let _ = reply.send(session.participants());
        }
        Command::Stats { reply } => {
            let _ = reply.send(session.stats());
        }
        Command::State { reply } => {
            let _ = reply.send(session.connection_state());
        }
        Command::Reconnect { reply } => {
            let result = session.reconnect().map(|fresh| {
                *subscription = Some(fresh);
            });
            let _ = reply.send(result);
        }
        Command::Leave { reply } => {
            session.leave();
            *subscription = None;
            let _ = reply.send(());
            return ControlFlow::Stop;
        }
    }
    ControlFlow::Continue
}
