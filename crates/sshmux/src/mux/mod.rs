//! Terminal multiplexer front-end.
//!
//! Reads local keystrokes, interprets the escape-prefixed control keys and
//! gates each session's output so only the active session reaches the
//! terminal.

pub mod command;
pub mod frontend;
pub mod input;
pub mod output;
pub mod signals;
pub mod target;

pub use command::{help_text, parse_escape_key, Command, ESCAPE_BYTE};
pub use frontend::{MuxOptions, Multiplexer};
pub use input::{InputAction, InputDecoder, LineEditor, LineEvent};
pub use output::{spawn_forwarder, status_line, ForwardEnd, TerminalWriter, STATUS_PREFIX};
pub use signals::{resize_all, spawn_resize_listener, spawn_shutdown_listener};
pub use target::{parse_host_list, HostTarget};
