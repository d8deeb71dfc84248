//! Error types for the multiplexing engine.

use thiserror::Error;

use crate::session::SessionId;

/// Errors surfaced by sessions, the registry and the connector.
///
/// The variants fall into two families. Registry-contract errors
/// (`NotFound`, `DuplicateActive`, `NoActiveSession`, `NotActive`,
/// `Unavailable`) are returned to the caller and never recorded on a
/// session. Connection-phase errors (`Configuration`, `Authentication`,
/// `Trust`, `Transport`, `Protocol`) are recorded on the session *and*
/// returned to whoever invoked the connect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    // Connection phase
    /// Bad or missing key material, detected before any network activity.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The server rejected every authentication method offered.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Host key rejected or verification failed.
    #[error("host key verification failed: {0}")]
    Trust(String),

    /// Dialing the remote host failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// SSH handshake, channel, PTY or shell negotiation failed.
    #[error("protocol error: {0}")]
    Protocol(String),

    // Registry contract
    /// No session with the given ID is registered.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// A ready session already exists for this host/user pair.
    #[error("a session for {user}@{host} is already open")]
    DuplicateActive {
        /// Target host.
        host: String,
        /// Remote user.
        user: String,
    },

    /// No session is currently selected.
    #[error("no active session")]
    NoActiveSession,

    /// The operation needs a connected (active or idle) session.
    #[error("session is not connected: {0}")]
    NotActive(SessionId),

    /// The session cannot accept I/O right now.
    #[error("session unavailable: {0}")]
    Unavailable(String),
}

impl MuxError {
    /// Returns true for errors produced while establishing a connection.
    ///
    /// These are the errors that get recorded on the session itself.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MuxError::Configuration(_)
                | MuxError::Authentication(_)
                | MuxError::Trust(_)
                | MuxError::Transport(_)
                | MuxError::Protocol(_)
        )
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, MuxError>;

impl From<russh::Error> for MuxError {
    fn from(err: russh::Error) -> Self {
        MuxError::Protocol(err.to_string())
    }
}
