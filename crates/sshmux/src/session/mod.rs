//! Session management module.
//!
//! This module provides the session record and its lifecycle state machine,
//! the I/O handles a connected session owns, and the registry that owns all
//! sessions and the active selection.

pub mod io;
pub mod manager;
pub mod record;
pub mod state;

pub use io::{
    InputSink, OutputSource, RemoteShell, ShellControl, ShellExit, TransportHandle,
    SHELL_CHANNEL_CAPACITY,
};
pub use manager::{ManagerStats, SessionManager};
pub use record::{Session, SessionInfo};
pub use state::{SessionId, SessionState};
