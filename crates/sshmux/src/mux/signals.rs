//! Unix signal listeners.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::SessionManager;
use crate::terminal::TerminalProbe;

/// Cancels `shutdown` on SIGTERM, SIGINT or SIGHUP.
///
/// The task also ends quietly when `shutdown` is cancelled by someone else.
pub fn spawn_shutdown_listener(shutdown: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sighup.recv() => "SIGHUP",
        };
        tracing::info!(signal = name, "Received shutdown signal");
        shutdown.cancel();
    }))
}

/// Propagates local window size changes to every connected session.
pub fn spawn_resize_listener(
    manager: Arc<SessionManager>,
    probe: Arc<dyn TerminalProbe>,
    shutdown: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    let mut sigwinch = signal(SignalKind::window_change())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = sigwinch.recv() => {
                    if received.is_none() {
                        break;
                    }
                    if let Some((cols, rows)) = probe.size() {
                        resize_all(&manager, cols, rows).await;
                    }
                }
            }
        }
    }))
}

/// Resizes every connected session, skipping the ones that fail.
pub async fn resize_all(manager: &SessionManager, cols: u16, rows: u16) {
    for info in manager.list_sessions() {
        let Ok(session) = manager.get(&info.id) else {
            continue;
        };
        if !session.is_ready() || session.size() == (cols, rows) {
            continue;
        }
        if let Err(e) = session.resize(cols, rows).await {
            tracing::debug!(session_id = %info.id, error = %e, "Resize skipped");
        }
    }
}
