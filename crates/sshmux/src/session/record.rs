//! The session record: one remote shell, its state and its I/O handles.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::io::{InputSink, OutputSource, RemoteShell, ShellControl, ShellExit, TransportHandle};
use super::state::{SessionId, SessionState};
use crate::error::{MuxError, Result};

/// Point-in-time view of a session, used for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Target host, possibly with `:port`.
    pub host: String,
    /// Remote user.
    pub user: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation time.
    pub created_at: SystemTime,
    /// Last input, output or activation.
    pub last_activity: SystemTime,
    /// Last error message, only set in `Error`.
    pub error: Option<String>,
}

/// Mutable part of a session, guarded by the session lock.
struct SessionInner {
    state: SessionState,
    last_activity: SystemTime,
    error: Option<String>,
    size: (u16, u16),
    transport: Option<Arc<dyn TransportHandle>>,
    control: Option<mpsc::Sender<ShellControl>>,
    input: Option<InputSink>,
    output: Option<OutputSource>,
    exit: Option<oneshot::Receiver<ShellExit>>,
}

/// A single remote-shell connection.
///
/// Sessions are owned by the [`SessionManager`](super::SessionManager);
/// everything else works on a shared `Arc<Session>`. All state changes go
/// through the session's own lock and are published on a `watch` channel.
pub struct Session {
    id: SessionId,
    host: String,
    user: String,
    created_at: SystemTime,
    cancel: CancellationToken,
    state_tx: watch::Sender<SessionState>,
    inner: RwLock<SessionInner>,
}

impl Session {
    /// Creates a session record in the `Created` state.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        let now = SystemTime::now();
        let (state_tx, _) = watch::channel(SessionState::Created);

        Self {
            id: Uuid::new_v4().to_string(),
            host: host.into(),
            user: user.into(),
            created_at: now,
            cancel: CancellationToken::new(),
            state_tx,
            inner: RwLock::new(SessionInner {
                state: SessionState::Created,
                last_activity: now,
                error: None,
                size: (0, 0),
                transport: None,
                control: None,
                input: None,
                output: None,
                exit: None,
            }),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the target host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the remote user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// `user@host`, for messages.
    pub fn label(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Returns the creation time.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.inner.read().state
    }

    /// Returns the last activity time.
    pub fn last_activity(&self) -> SystemTime {
        self.inner.read().last_activity
    }

    /// Returns the last error message, if the session is in `Error`.
    pub fn error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    /// Returns the PTY size negotiated at connect time or set by resize.
    pub fn size(&self) -> (u16, u16) {
        self.inner.read().size
    }

    /// Returns whether the session is connected (`Active` or `Idle`).
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Returns the session's cancellation token.
    ///
    /// The token is cancelled by [`close`](Self::close); every task working
    /// for this session must observe it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribes to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Returns a snapshot for listings.
    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.read();
        SessionInfo {
            id: self.id.clone(),
            host: self.host.clone(),
            user: self.user.clone(),
            state: inner.state,
            created_at: self.created_at,
            last_activity: inner.last_activity,
            error: inner.error.clone(),
        }
    }

    /// Applies a transition if the state machine allows it.
    fn transition(&self, inner: &mut SessionInner, next: SessionState) -> bool {
        if !inner.state.can_transition_to(next) {
            tracing::debug!(
                session_id = %self.id,
                from = %inner.state,
                to = %next,
                "Ignoring illegal session transition"
            );
            return false;
        }
        if inner.state != next {
            inner.state = next;
            self.state_tx.send_replace(next);
        }
        true
    }

    /// Stamps the activity time without ever moving it backwards.
    fn stamp(inner: &mut SessionInner) {
        if inner.state == SessionState::Closed {
            return;
        }
        let now = SystemTime::now();
        if now > inner.last_activity {
            inner.last_activity = now;
        }
    }

    /// Records activity on the session.
    pub fn touch(&self) {
        Self::stamp(&mut self.inner.write());
    }

    /// Moves `Created` to `Connecting`.
    pub fn mark_connecting(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.state != SessionState::Created {
            return Err(MuxError::Unavailable(format!(
                "cannot connect session {} in state {}",
                self.id, inner.state
            )));
        }
        self.transition(&mut inner, SessionState::Connecting);
        Ok(())
    }

    /// Installs the handles of a freshly negotiated shell and marks the
    /// session ready (`Idle`). Promotion to `Active` is the manager's job.
    ///
    /// Fails if the session left `Connecting` meanwhile (for example because
    /// it was closed); the shell is handed back so the caller can tear it
    /// down.
    pub fn install(&self, shell: RemoteShell) -> std::result::Result<(), RemoteShell> {
        let mut inner = self.inner.write();
        if inner.state != SessionState::Connecting {
            return Err(shell);
        }

        inner.transport = Some(shell.transport);
        inner.control = Some(shell.control);
        inner.input = Some(shell.input);
        inner.output = Some(shell.output);
        inner.exit = Some(shell.exit);
        inner.size = shell.size;
        inner.error = None;
        Self::stamp(&mut inner);
        self.transition(&mut inner, SessionState::Idle);
        Ok(())
    }

    /// Records a failure and moves the session to `Error`.
    ///
    /// Returns false when the session is already `Error` or `Closed`.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let mut inner = self.inner.write();
        if inner.state.is_finished() {
            return false;
        }
        let message = message.into();
        if self.transition(&mut inner, SessionState::Error) {
            tracing::warn!(session_id = %self.id, error = %message, "Session failed");
            inner.error = Some(message);
            true
        } else {
            false
        }
    }

    /// Promotes an `Idle` session to `Active`. Used by the manager only.
    pub(crate) fn promote(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            SessionState::Active => {
                Self::stamp(&mut inner);
                true
            }
            SessionState::Idle => {
                Self::stamp(&mut inner);
                self.transition(&mut inner, SessionState::Active)
            }
            _ => false,
        }
    }

    /// Demotes an `Active` session to `Idle`. Used by the manager only.
    pub(crate) fn demote(&self) -> bool {
        let mut inner = self.inner.write();
        inner.state == SessionState::Active && self.transition(&mut inner, SessionState::Idle)
    }

    /// Takes the output source. Only the forwarding task calls this.
    pub fn take_output(&self) -> Option<OutputSource> {
        self.inner.write().output.take()
    }

    /// Takes the exit receiver. Only the exit monitor calls this.
    pub fn take_exit(&self) -> Option<oneshot::Receiver<ShellExit>> {
        self.inner.write().exit.take()
    }

    /// Writes bytes to the remote shell's standard input.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let input = {
            let inner = self.inner.read();
            match (&inner.input, inner.state) {
                (Some(input), state) if state != SessionState::Closed => input.clone(),
                _ => {
                    return Err(MuxError::Unavailable(format!(
                        "session {} has no input",
                        self.id
                    )))
                }
            }
        };

        input
            .send(data.to_vec())
            .await
            .map_err(|_| MuxError::Unavailable(format!("session {} input closed", self.id)))?;

        self.touch();
        Ok(())
    }

    /// Resizes the remote PTY.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let control = {
            let inner = self.inner.read();
            if !inner.state.is_ready() {
                return Err(MuxError::NotActive(self.id.clone()));
            }
            inner
                .control
                .clone()
                .ok_or_else(|| MuxError::Unavailable(format!("session {} has no shell", self.id)))?
        };

        control
            .try_send(ShellControl::Resize { cols, rows })
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    MuxError::Unavailable(format!("session {} shell is busy", self.id))
                }
                TrySendError::Closed(_) => {
                    MuxError::Unavailable(format!("session {} shell closed", self.id))
                }
            })?;

        self.inner.write().size = (cols, rows);
        tracing::debug!(session_id = %self.id, cols, rows, "Resized remote PTY");
        Ok(())
    }

    /// Closes the session.
    ///
    /// Idempotent. Cancels the session scope, closes the remote shell, the
    /// transport and the input sink (each attempted even if an earlier step
    /// failed), then moves to `Closed`. Returns the first cleanup error.
    pub async fn close(&self) -> Result<()> {
        let (control, transport, input) = {
            let mut inner = self.inner.write();
            if inner.state == SessionState::Closed {
                return Ok(());
            }
            (
                inner.control.take(),
                inner.transport.take(),
                inner.input.take(),
            )
        };

        self.cancel.cancel();

        let mut first_error = None;

        if let Some(control) = control {
            if let Err(e) = control.try_send(ShellControl::Close) {
                tracing::debug!(session_id = %self.id, error = %e, "Shell already gone");
            }
        }

        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to close transport");
                first_error.get_or_insert(e);
            }
        }

        drop(input);

        {
            let mut inner = self.inner.write();
            inner.output = None;
            inner.exit = None;
            inner.error = None;
            self.transition(&mut inner, SessionState::Closed);
        }

        tracing::info!(session_id = %self.id, host = %self.host, "Session closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("state", &self.state())
            .finish()
    }
}
