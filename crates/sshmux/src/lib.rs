//! # sshmux
//!
//! A screen-style multiplexer for interactive SSH sessions: attach to many
//! hosts at once, switch the visible session with a control key, type into
//! the active one, and close sessions independently.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 Multiplexer (mux::frontend)                   │
//! │   stdin ─▶ InputDecoder ─▶ active session / Command dispatch  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐   ┌──────────────────────────────────┐ │
//! │  │  SessionManager  │   │        SessionConnector          │ │
//! │  │ registry, active │   │ auth ─▶ dial ─▶ SSH PTY shell    │ │
//! │  └──────────────────┘   └──────────────────────────────────┘ │
//! │            │                          │                      │
//! │  ┌─────────▼──────────────────────────▼─────────────────────┐│
//! │  │ Session: state machine, input sink, output source, exit  ││
//! │  └──────────────────────────────────────────────────────────┘│
//! │   per-session forwarder ─▶ TerminalWriter ─▶ stdout          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: session records, their state machine and the registry
//! - [`connector`]: authentication, transport and SSH shell negotiation
//! - [`mux`]: the terminal front-end, command keys and output gating
//! - [`terminal`]: raw-mode scope and local terminal queries
//! - [`config`]: TOML configuration
//! - [`error`]: the engine's error type

pub mod config;
pub mod connector;
pub mod error;
pub mod mux;
pub mod session;
pub mod terminal;

pub use config::{Config, ConfigError};
pub use connector::{ConnectorSettings, KeyFileAuth, SessionConnector, TrustMode};
pub use error::{MuxError, Result};
pub use mux::{HostTarget, Multiplexer, MuxOptions, TerminalWriter};
pub use session::{Session, SessionId, SessionInfo, SessionManager, SessionState};
pub use terminal::{TerminalScope, TerminalProbe};
