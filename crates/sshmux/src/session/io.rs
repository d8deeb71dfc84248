//! I/O handles installed on a connected session.
//!
//! A connector produces a [`RemoteShell`] bundle; the session takes
//! ownership of every handle in one step. The handles are plain tokio
//! channels so that the SSH pump, the forwarding task and the exit monitor
//! never share anything but the channel ends.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

/// Write end of the remote shell's standard input.
pub type InputSink = mpsc::Sender<Vec<u8>>;

/// Read end of the remote shell's combined output.
pub type OutputSource = mpsc::Receiver<Vec<u8>>;

/// Channel capacity for shell input and output chunks.
pub const SHELL_CHANNEL_CAPACITY: usize = 256;

/// Requests sent from the session to whoever drives the remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellControl {
    /// Change the remote PTY window size.
    Resize { cols: u16, rows: u16 },
    /// Close the shell channel.
    Close,
}

/// How the remote shell ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellExit {
    /// The shell exited with a status code.
    Status(u32),
    /// The shell was killed by a signal.
    Signal {
        /// Signal name as reported by the server.
        signal: String,
        /// Optional error message from the server.
        message: String,
    },
    /// The channel closed without reporting an exit status.
    Lost,
}

impl ShellExit {
    /// Only a zero exit status counts as a clean exit.
    pub fn is_clean(&self) -> bool {
        matches!(self, ShellExit::Status(0))
    }
}

impl fmt::Display for ShellExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellExit::Status(code) => write!(f, "remote shell exited with status {code}"),
            ShellExit::Signal { signal, message } if message.is_empty() => {
                write!(f, "remote shell killed by signal {signal}")
            }
            ShellExit::Signal { signal, message } => {
                write!(f, "remote shell killed by signal {signal}: {message}")
            }
            ShellExit::Lost => f.write_str("connection lost before the shell reported an exit status"),
        }
    }
}

/// The authenticated connection underneath a session's shell.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Tears the connection down. Called at most once per session.
    async fn close(&self) -> Result<()>;
}

/// Everything a connector hands over to a session once the shell is up.
pub struct RemoteShell {
    /// Authenticated transport.
    pub transport: Arc<dyn TransportHandle>,
    /// Control requests for the remote shell.
    pub control: mpsc::Sender<ShellControl>,
    /// Resolves once when the remote shell ends.
    pub exit: oneshot::Receiver<ShellExit>,
    /// Remote standard input.
    pub input: InputSink,
    /// Remote standard output and error.
    pub output: OutputSource,
    /// PTY size negotiated with the server.
    pub size: (u16, u16),
}

impl fmt::Debug for RemoteShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteShell")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
