//! Terminal output.
//!
//! Exactly one task writes to the local terminal. Everything else, session
//! output and status lines alike, goes through a cloneable
//! [`TerminalWriter`]. Each connected session gets a forwarding task that
//! copies its output to the writer while the session is the active
//! selection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::session::{Session, SessionId, SessionState};

/// Writer channel capacity, in chunks.
const WRITER_CAPACITY: usize = 256;

/// How long a forwarder waits for the final session state after the
/// output stream ends.
const SETTLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Prefix of every status line.
pub const STATUS_PREFIX: &str = "[sshmux]";

/// Formats a status line for a raw-mode terminal.
pub fn status_line(message: &str) -> String {
    format!("\r\n{STATUS_PREFIX} {message}\r\n")
}

/// Handle to the terminal writer task.
#[derive(Debug, Clone)]
pub struct TerminalWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl TerminalWriter {
    /// Spawns the writer task over `out`.
    ///
    /// The task runs until every `TerminalWriter` clone is dropped, then
    /// flushes and exits.
    pub fn spawn<W>(out: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(WRITER_CAPACITY);
        let handle = tokio::spawn(run_writer(out, rx));
        (Self { tx }, handle)
    }

    /// Queues raw bytes. Returns false once the writer task has stopped.
    pub async fn write(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.tx.send(bytes.into()).await.is_ok()
    }

    /// Queues a status line.
    pub async fn status(&self, message: impl AsRef<str>) -> bool {
        self.write(status_line(message.as_ref())).await
    }
}

async fn run_writer<W>(mut out: W, mut rx: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = out.write_all(&chunk).await {
            tracing::warn!(error = %e, "Terminal write failed");
            break;
        }
        if let Err(e) = out.flush().await {
            tracing::warn!(error = %e, "Terminal flush failed");
            break;
        }
    }
    tracing::debug!("Terminal writer stopped");
}

/// Why a forwarding task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardEnd {
    /// The output source was closed.
    EndOfStream,
    /// The session's cancellation token fired.
    Cancelled,
    /// The session reached `Error` or `Closed`.
    Finished,
}

fn is_foreground(active: &watch::Receiver<Option<SessionId>>, id: &str) -> bool {
    active.borrow().as_deref() == Some(id)
}

/// Starts forwarding a connected session's output.
///
/// Output is written only while the session is the active selection. A
/// chunk read while the session is in the background is held until it is
/// selected again, which also stops reading further output. Returns `None`
/// if the output source was already taken.
pub fn spawn_forwarder(
    session: Arc<Session>,
    mut active: watch::Receiver<Option<SessionId>>,
    writer: TerminalWriter,
) -> Option<JoinHandle<ForwardEnd>> {
    let mut output = session.take_output()?;
    let cancel = session.cancel_token();
    let mut state = session.subscribe_state();

    Some(tokio::spawn(async move {
        let id = session.id().clone();
        let mut pending: Option<Vec<u8>> = None;

        let end = loop {
            if let Some(chunk) = pending.take() {
                if is_foreground(&active, &id) {
                    if !writer.write(chunk).await {
                        break ForwardEnd::Cancelled;
                    }
                    continue;
                }
                pending = Some(chunk);
                tokio::select! {
                    _ = cancel.cancelled() => break ForwardEnd::Cancelled,
                    changed = active.changed() => {
                        if changed.is_err() {
                            break ForwardEnd::Cancelled;
                        }
                    }
                    changed = state.changed() => {
                        if changed.is_err() || state.borrow().is_finished() {
                            break ForwardEnd::Finished;
                        }
                    }
                }
                continue;
            }

            // Queued output is read before cancellation is noticed.
            tokio::select! {
                biased;
                chunk = output.recv() => match chunk {
                    Some(chunk) => {
                        session.touch();
                        pending = Some(chunk);
                    }
                    None => break ForwardEnd::EndOfStream,
                },
                _ = cancel.cancelled() => break ForwardEnd::Cancelled,
                changed = state.changed() => {
                    if changed.is_err() || state.borrow().is_finished() {
                        break ForwardEnd::Finished;
                    }
                }
            }
        };

        if end == ForwardEnd::EndOfStream {
            let _ = tokio::time::timeout(SETTLE_TIMEOUT, state.wait_for(|s| s.is_finished())).await;
        }

        if is_foreground(&active, &id) {
            if let Some(chunk) = pending.take() {
                writer.write(chunk).await;
            }
            while let Ok(chunk) = output.try_recv() {
                writer.write(chunk).await;
            }
            writer.status(end_message(&session)).await;
        }

        tracing::debug!(session_id = %id, end = ?end, "Output forwarding stopped");
        end
    }))
}

fn end_message(session: &Session) -> String {
    let label = session.label();
    match (session.state(), session.error()) {
        (SessionState::Error, Some(error)) => format!("{label}: {error}"),
        (SessionState::Closed, _) => format!("{label}: session ended"),
        _ => format!("{label}: connection closed"),
    }
}
