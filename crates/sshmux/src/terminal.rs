//! Local terminal handling.
//!
//! [`TerminalScope`] owns raw mode for the lifetime of the multiplexer. It is
//! created once, shared by `Arc` with the front-end, the signal listener and
//! the panic hook, and restores the terminal exactly once whichever exit path
//! gets there first.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fallback PTY width when the local size cannot be read.
pub const DEFAULT_COLS: u16 = 80;

/// Fallback PTY height when the local size cannot be read.
pub const DEFAULT_ROWS: u16 = 24;

/// Fallback terminal type.
pub const DEFAULT_TERM: &str = "xterm";

/// Switches the local terminal in and out of raw mode.
pub trait RawMode: Send + Sync {
    /// Enters raw mode.
    fn enable(&self) -> io::Result<()>;
    /// Leaves raw mode.
    fn disable(&self) -> io::Result<()>;
}

/// Raw mode through crossterm.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrosstermRawMode;

impl RawMode for CrosstermRawMode {
    fn enable(&self) -> io::Result<()> {
        crossterm::terminal::enable_raw_mode()
    }

    fn disable(&self) -> io::Result<()> {
        crossterm::terminal::disable_raw_mode()
    }
}

/// Scoped raw-mode acquisition with guaranteed, single release.
pub struct TerminalScope {
    mode: Box<dyn RawMode>,
    raw: AtomicBool,
}

impl TerminalScope {
    /// Enters raw mode and returns the scope guarding it.
    pub fn acquire(mode: impl RawMode + 'static) -> io::Result<Arc<Self>> {
        mode.enable()?;
        tracing::debug!("Terminal switched to raw mode");
        Ok(Arc::new(Self {
            mode: Box::new(mode),
            raw: AtomicBool::new(true),
        }))
    }

    /// Returns whether the terminal is still in raw mode.
    pub fn is_raw(&self) -> bool {
        self.raw.load(Ordering::SeqCst)
    }

    /// Restores the terminal. Returns true only for the call that actually
    /// restored it.
    pub fn restore(&self) -> bool {
        if !self.raw.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.mode.disable() {
            tracing::warn!(error = %e, "Failed to leave raw mode");
        }
        tracing::debug!("Terminal restored");
        true
    }

    /// Restores the terminal before the default panic output is printed.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let scope = Arc::downgrade(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(scope) = scope.upgrade() {
                scope.restore();
            }
            previous(info);
        }));
    }
}

impl Drop for TerminalScope {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Queries the local terminal's size and type.
pub trait TerminalProbe: Send + Sync {
    /// Current `(cols, rows)`, if known.
    fn size(&self) -> Option<(u16, u16)>;
    /// Terminal type (`$TERM`), if known.
    fn term(&self) -> Option<String>;
}

/// The process's controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalTerminal;

impl TerminalProbe for LocalTerminal {
    fn size(&self) -> Option<(u16, u16)> {
        crossterm::terminal::size()
            .ok()
            .filter(|&(cols, rows)| cols > 0 && rows > 0)
    }

    fn term(&self) -> Option<String> {
        std::env::var("TERM").ok().filter(|t| !t.is_empty())
    }
}

/// A terminal with a fixed geometry, for non-interactive use.
#[derive(Debug, Clone, Default)]
pub struct FixedTerminal {
    /// Reported size; `None` simulates an unreadable size.
    pub size: Option<(u16, u16)>,
    /// Reported terminal type.
    pub term: Option<String>,
}

impl TerminalProbe for FixedTerminal {
    fn size(&self) -> Option<(u16, u16)> {
        self.size
    }

    fn term(&self) -> Option<String> {
        self.term.clone()
    }
}
