//! Session connector.
//!
//! Turns a `Created` session into a live remote shell: builds credentials,
//! resolves host-key trust, dials the host, negotiates a PTY shell and
//! installs the resulting handles on the session. A monitor task then
//! watches the shell and moves the session to `Closed` or `Error` when it
//! ends.
//!
//! The connector itself holds no per-session state; every collaborator is a
//! trait object shared by all sessions.

pub mod auth;
pub mod ssh;
pub mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

pub use auth::{
    AuthMethod, AuthProvider, HostKeyVerifier, KeyFileAuth, NoPassphrase, PassphrasePrompt,
    TerminalPassphrasePrompt, TrustMode,
};
pub use ssh::SshProtocol;
pub use transport::{split_host_port, BoxedStream, ByteStream, TcpTransport, Transport};

use crate::error::{MuxError, Result};
use crate::session::{RemoteShell, Session, ShellControl, ShellExit};
use crate::terminal::{LocalTerminal, TerminalProbe, DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM};

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default bound on dialing and on shell negotiation.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connector-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSettings {
    /// Private key offered to every host.
    pub key_path: Option<PathBuf>,
    /// Host-key policy.
    pub trust: TrustMode,
    /// Port used when the host string has none.
    pub default_port: u16,
    /// Bound on dialing, and separately on shell negotiation.
    pub connect_timeout: Duration,
    /// Terminal type when `$TERM` is unset.
    pub default_term: String,
    /// PTY size when the local size cannot be read.
    pub default_size: (u16, u16),
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            key_path: None,
            trust: TrustMode::Insecure,
            default_port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            default_term: DEFAULT_TERM.to_string(),
            default_size: (DEFAULT_COLS, DEFAULT_ROWS),
        }
    }
}

/// Remote PTY parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

/// Everything needed to negotiate a shell on a dialed stream.
#[derive(Clone)]
pub struct ShellRequest {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: Vec<AuthMethod>,
    pub verifier: HostKeyVerifier,
    pub pty: PtyRequest,
}

impl std::fmt::Debug for ShellRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("auth", &self.auth)
            .field("pty", &self.pty)
            .finish_non_exhaustive()
    }
}

/// Negotiates an interactive shell over a byte stream.
#[async_trait]
pub trait ShellProtocol: Send + Sync {
    /// Handshakes, authenticates and starts a PTY shell.
    async fn open_shell(&self, stream: BoxedStream, request: ShellRequest) -> Result<RemoteShell>;
}

/// Connects sessions to their hosts.
pub struct SessionConnector {
    transport: Arc<dyn Transport>,
    protocol: Arc<dyn ShellProtocol>,
    auth: Arc<dyn AuthProvider>,
    probe: Arc<dyn TerminalProbe>,
    settings: ConnectorSettings,
}

impl SessionConnector {
    /// Creates a connector from its collaborators.
    pub fn new(
        settings: ConnectorSettings,
        transport: Arc<dyn Transport>,
        protocol: Arc<dyn ShellProtocol>,
        auth: Arc<dyn AuthProvider>,
        probe: Arc<dyn TerminalProbe>,
    ) -> Self {
        Self {
            transport,
            protocol,
            auth,
            probe,
            settings,
        }
    }

    /// TCP, russh and the local terminal.
    pub fn ssh(
        settings: ConnectorSettings,
        auth: Arc<dyn AuthProvider>,
        keepalive: Option<Duration>,
    ) -> Self {
        Self::new(
            settings,
            Arc::new(TcpTransport),
            Arc::new(SshProtocol::new(keepalive)),
            auth,
            Arc::new(LocalTerminal),
        )
    }

    /// Returns the connector settings.
    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    /// PTY parameters from the local terminal, with configured fallbacks.
    pub fn pty_request(&self) -> PtyRequest {
        let (cols, rows) = self.probe.size().unwrap_or(self.settings.default_size);
        let term = self
            .probe
            .term()
            .unwrap_or_else(|| self.settings.default_term.clone());
        PtyRequest { term, cols, rows }
    }

    /// Connects a `Created` session.
    ///
    /// On success the session is `Idle` with all handles installed and an
    /// exit monitor running. Connection errors are recorded on the session
    /// (`Error` with a message) and returned.
    pub async fn connect(&self, session: &Arc<Session>) -> Result<()> {
        session.mark_connecting()?;
        tracing::info!(
            session_id = %session.id(),
            host = %session.host(),
            user = %session.user(),
            "Connecting session"
        );

        let cancel = session.cancel_token();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(MuxError::Unavailable(format!(
                "session {} was closed while connecting",
                session.id()
            ))),
            result = self.establish(session) => result,
        };

        let shell = match result {
            Ok(shell) => shell,
            Err(e) => {
                if e.is_connection_error() {
                    session.fail(e.to_string());
                }
                return Err(e);
            }
        };

        if let Err(shell) = session.install(shell) {
            discard(shell).await;
            return Err(MuxError::Unavailable(format!(
                "session {} was closed while connecting",
                session.id()
            )));
        }

        spawn_monitor(Arc::clone(session));
        tracing::info!(session_id = %session.id(), host = %session.host(), "Session connected");
        Ok(())
    }

    async fn establish(&self, session: &Session) -> Result<RemoteShell> {
        let (host, port) = split_host_port(session.host(), self.settings.default_port)?;
        let auth = self
            .auth
            .auth_methods(self.settings.key_path.as_deref(), session.user(), &host)?;
        let verifier = self.auth.host_key_verifier(&host, port, &self.settings.trust)?;

        let stream = match tokio::time::timeout(
            self.settings.connect_timeout,
            self.transport.dial(&host, port),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(MuxError::Transport(format!("cannot reach {host}:{port}: {e}")))
            }
            Err(_) => {
                return Err(MuxError::Transport(format!(
                    "timed out connecting to {host}:{port}"
                )))
            }
        };

        let request = ShellRequest {
            host,
            port,
            user: session.user().to_string(),
            auth,
            verifier,
            pty: self.pty_request(),
        };

        tokio::time::timeout(
            self.settings.connect_timeout,
            self.protocol.open_shell(stream, request),
        )
        .await
        .unwrap_or_else(|_| Err(MuxError::Protocol("timed out negotiating the shell".to_string())))
    }

    /// Closes the session.
    pub async fn disconnect(&self, session: &Session) -> Result<()> {
        session.close().await
    }

    /// Sends one command line to a connected session.
    pub async fn send_command(&self, session: &Session, command: &str) -> Result<()> {
        if !session.is_ready() {
            return Err(MuxError::NotActive(session.id().clone()));
        }
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        session.write(&line).await
    }

    /// Resizes a connected session's PTY.
    pub async fn resize(&self, session: &Session, cols: u16, rows: u16) -> Result<()> {
        session.resize(cols, rows).await
    }
}

impl std::fmt::Debug for SessionConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnector")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Tears down a shell that could not be installed.
async fn discard(shell: RemoteShell) {
    let _ = shell.control.try_send(ShellControl::Close);
    if let Err(e) = shell.transport.close().await {
        tracing::debug!(error = %e, "Failed to close discarded shell");
    }
}

/// Watches the shell exit and settles the session state.
fn spawn_monitor(session: Arc<Session>) -> Option<JoinHandle<()>> {
    let exit = session.take_exit()?;
    let cancel = session.cancel_token();

    Some(tokio::spawn(async move {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = exit => outcome.unwrap_or(ShellExit::Lost),
        };

        if outcome.is_clean() {
            tracing::info!(session_id = %session.id(), "Remote shell exited");
            if let Err(e) = session.close().await {
                tracing::debug!(session_id = %session.id(), error = %e, "Cleanup after exit failed");
            }
        } else {
            session.fail(outcome.to_string());
        }
    }))
}
