//! The terminal front-end.
//!
//! [`Multiplexer`] is the single reader of local input. It forwards bytes
//! to the active session, interprets the escape-prefixed command keys, and
//! owns the shutdown sequence: close every session, then restore the
//! terminal, exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::command::{describe_key, help_text, Command, ESCAPE_BYTE};
use super::input::{InputAction, InputDecoder, LineEditor, LineEvent};
use super::output::{spawn_forwarder, status_line, TerminalWriter, STATUS_PREFIX};
use super::target::HostTarget;
use crate::connector::SessionConnector;
use crate::error::Result;
use crate::session::{SessionId, SessionManager, SessionState};
use crate::terminal::TerminalScope;

/// Local input is read in chunks of at most this many bytes.
const READ_CHUNK: usize = 1024;

/// Front-end options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxOptions {
    /// Escape prefix byte.
    pub escape: u8,
    /// User for targets given without `user@`.
    pub default_user: String,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            escape: ESCAPE_BYTE,
            default_user: String::from("root"),
        }
    }
}

/// What the input loop does after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Prompt,
    Quit,
}

/// Screen-style multiplexer over remote shells.
pub struct Multiplexer {
    manager: Arc<SessionManager>,
    connector: Arc<SessionConnector>,
    writer: TerminalWriter,
    scope: Option<Arc<TerminalScope>>,
    shutdown: CancellationToken,
    options: MuxOptions,
    finished: AtomicBool,
}

impl Multiplexer {
    pub fn new(
        manager: Arc<SessionManager>,
        connector: Arc<SessionConnector>,
        writer: TerminalWriter,
        options: MuxOptions,
    ) -> Self {
        Self {
            manager,
            connector,
            writer,
            scope: None,
            shutdown: CancellationToken::new(),
            options,
            finished: AtomicBool::new(false),
        }
    }

    /// Restores this terminal scope on shutdown.
    pub fn with_terminal(mut self, scope: Arc<TerminalScope>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Uses `token` as the shutdown trigger, e.g. one shared with a
    /// signal listener.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Returns the shutdown token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns the session registry.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Registers a session for `target` and connects it in the background.
    ///
    /// The first session opened becomes the active selection. The returned
    /// ID is valid immediately; the session is promoted to `Active` once it
    /// is connected, if it is still selected.
    pub fn open(&self, target: &HostTarget) -> Result<SessionId> {
        let user = target.user_or(&self.options.default_user);
        let session = self.manager.create(&target.host, user)?;
        let id = session.id().clone();

        if self.manager.active_id().is_none() {
            self.manager.set_active(&id)?;
        }

        let manager = Arc::clone(&self.manager);
        let connector = Arc::clone(&self.connector);
        let writer = self.writer.clone();
        let label = session.label();
        let task_id = id.clone();

        tokio::spawn(async move {
            match manager.connect(&task_id, &connector).await {
                Ok(session) => {
                    writer.status(format!("connected to {label}")).await;
                    spawn_forwarder(session, manager.subscribe_active(), writer);
                }
                Err(e) => {
                    tracing::warn!(session_id = %task_id, error = %e, "Connection failed");
                    writer.status(format!("{label}: {e}")).await;
                }
            }
        });

        Ok(id)
    }

    /// Opens `hosts`, then runs the input loop until quit, end of input or
    /// shutdown, and finally shuts down.
    pub async fn run<R>(&self, hosts: &[HostTarget], mut input: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        for target in hosts {
            if let Err(e) = self.open(target) {
                self.writer.status(format!("{target}: {e}")).await;
            }
        }

        let mut decoder = InputDecoder::new(self.options.escape);
        let mut prompt: Option<LineEditor> = None;
        let mut buf = [0u8; READ_CHUNK];
        let mut forward = Vec::with_capacity(READ_CHUNK);

        'input: loop {
            let n = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                read = input.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!("Input closed");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read input");
                        break;
                    }
                },
            };

            for &byte in &buf[..n] {
                if let Some(editor) = prompt.as_mut() {
                    match editor.feed(byte) {
                        LineEvent::Echo(echo) => {
                            if !echo.is_empty() {
                                self.writer.write(echo).await;
                            }
                        }
                        LineEvent::Submit(line) => {
                            prompt = None;
                            self.open_line(&line).await;
                        }
                        LineEvent::Cancel => {
                            prompt = None;
                            self.writer.status("cancelled").await;
                        }
                    }
                    continue;
                }

                match decoder.feed(byte) {
                    None => {}
                    Some(InputAction::Forward(b)) => forward.push(b),
                    Some(InputAction::Command(command)) => {
                        match self.dispatch(command, &mut forward).await {
                            Flow::Continue => {}
                            Flow::Prompt => {
                                self.writer
                                    .write(format!("\r\n{STATUS_PREFIX} open [user@]host[:port]: "))
                                    .await;
                                prompt = Some(LineEditor::new());
                            }
                            Flow::Quit => break 'input,
                        }
                    }
                    Some(InputAction::Unknown(b)) => {
                        self.forward(&mut forward).await;
                        self.writer
                            .status(format!(
                                "unknown command {}; {} ? for help",
                                describe_key(b),
                                describe_key(decoder.escape())
                            ))
                            .await;
                    }
                }
            }

            self.forward(&mut forward).await;
        }

        self.shutdown().await;
        Ok(())
    }

    /// Writes buffered bytes to the active session, or drops them.
    async fn forward(&self, bytes: &mut Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        match self.manager.get_active() {
            Ok(session) => {
                if let Err(e) = session.write(bytes).await {
                    tracing::trace!(session_id = %session.id(), error = %e, "Dropped input");
                }
            }
            Err(_) => tracing::trace!(len = bytes.len(), "No active session, dropped input"),
        }
        bytes.clear();
    }

    /// Runs one command. Bytes already buffered in `forward` reach the
    /// active session first.
    async fn dispatch(&self, command: Command, forward: &mut Vec<u8>) -> Flow {
        tracing::debug!(command = ?command, "Command");
        self.forward(forward).await;

        match command {
            Command::NewSession => return Flow::Prompt,
            Command::Next => self.switch(self.manager.switch_next()).await,
            Command::Previous => self.switch(self.manager.switch_previous()).await,
            Command::List => self.list().await,
            Command::Select(index) => match self.manager.get_by_index(index) {
                Some(session) => match self.manager.set_active(session.id()) {
                    Ok(()) => self.announce().await,
                    Err(e) => {
                        self.writer.status(e.to_string()).await;
                    }
                },
                None => {
                    self.writer.status(format!("no session {index}")).await;
                }
            },
            Command::Close => self.close_active().await,
            Command::Help => {
                self.writer.status(help_text(self.options.escape)).await;
            }
            Command::Quit => return Flow::Quit,
            Command::SendEscape => forward.push(self.options.escape),
        }
        Flow::Continue
    }

    async fn open_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            self.writer.status("cancelled").await;
            return;
        }
        let opened = line
            .parse::<HostTarget>()
            .and_then(|target| self.open(&target))
            .and_then(|id| self.manager.set_active(&id));
        match opened {
            Ok(()) => self.writer.status(format!("connecting to {line}")).await,
            Err(e) => self.writer.status(format!("{line}: {e}")).await,
        };
    }

    async fn switch(&self, selected: Option<SessionId>) {
        if self.manager.session_count() < 2 {
            self.writer.status("no other session").await;
            return;
        }
        if selected.is_some() {
            self.announce().await;
        }
    }

    async fn close_active(&self) {
        let session = match self.manager.get_active() {
            Ok(session) => session,
            Err(e) => {
                self.writer.status(e.to_string()).await;
                return;
            }
        };
        let label = session.label();
        match self.manager.close(session.id()).await {
            Ok(()) => {
                self.writer.status(format!("closed {label}")).await;
                if self.manager.active_id().is_some() {
                    self.announce().await;
                }
            }
            Err(e) => {
                self.writer.status(e.to_string()).await;
            }
        }
    }

    /// Prints the active selection.
    async fn announce(&self) {
        let Some(active) = self.manager.active_id() else {
            self.writer.status("no sessions").await;
            return;
        };
        let sessions = self.manager.list_sessions();
        if let Some((index, info)) = sessions.iter().enumerate().find(|(_, s)| s.id == active) {
            let mut line = format!("[{index}] {}@{} ({})", info.user, info.host, info.state);
            if let Some(error) = &info.error {
                line.push_str(": ");
                line.push_str(error);
            }
            self.writer.status(line).await;
        }
    }

    async fn list(&self) {
        let sessions = self.manager.list_sessions();
        if sessions.is_empty() {
            self.writer.status("no sessions").await;
            return;
        }

        let active = self.manager.active_id();
        let mut text = status_line(&format!("{} session(s)", sessions.len()));
        for (index, info) in sessions.iter().enumerate() {
            let marker = if active.as_ref() == Some(&info.id) { '*' } else { ' ' };
            text.push_str(&format!(
                "{marker}{index} {}@{} {}",
                info.user, info.host, info.state
            ));
            if info.state == SessionState::Error {
                if let Some(error) = &info.error {
                    text.push_str(&format!(" ({error})"));
                }
            }
            text.push_str("\r\n");
        }
        self.writer.write(text).await;
    }

    /// Closes every session, then restores the terminal. Only the first
    /// call does anything.
    pub async fn shutdown(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let count = self.manager.session_count();
        tracing::info!(count, "Shutting down");
        self.manager.close_all().await;

        if let Some(scope) = &self.scope {
            scope.restore();
        }
    }

    /// Returns whether shutdown has run.
    pub fn is_shut_down(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("options", &self.options)
            .field("sessions", &self.manager.session_count())
            .field("finished", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
