//! SSH shell negotiation over russh.
//!
//! [`SshProtocol`] runs the client handshake on an already dialed stream,
//! authenticates, and opens an interactive PTY shell. Once the shell is up
//! a pump task owns the channel and bridges it to the session's tokio
//! channels until the remote side closes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::client::{self, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::{mpsc, oneshot};

use super::auth::{AuthMethod, HostKeyVerifier};
use super::transport::BoxedStream;
use super::{ShellProtocol, ShellRequest};
use crate::error::{MuxError, Result};
use crate::session::{RemoteShell, ShellControl, ShellExit, TransportHandle, SHELL_CHANNEL_CAPACITY};

/// How long a disconnect may take before the connection is dropped.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Unread output kept per shell before the oldest is dropped.
const BACKLOG_LIMIT: usize = 1024 * 1024;

/// How long the pump waits for the session to take its last output.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Interactive shells over SSH.
pub struct SshProtocol {
    config: Arc<client::Config>,
}

impl SshProtocol {
    /// Creates the protocol with an optional keepalive interval.
    pub fn new(keepalive: Option<Duration>) -> Self {
        let config = client::Config {
            keepalive_interval: keepalive,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for SshProtocol {
    fn default() -> Self {
        Self::new(None)
    }
}

/// russh callbacks for one connection.
struct ClientHandler {
    verifier: HostKeyVerifier,
    rejection: Arc<Mutex<Option<MuxError>>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match (self.verifier)(server_public_key) {
            Ok(()) => Ok(true),
            Err(e) => {
                *self.rejection.lock() = Some(e);
                Ok(false)
            }
        }
    }
}

/// The authenticated connection, kept alive for the session's lifetime.
struct SshTransport {
    handle: tokio::sync::Mutex<client::Handle<ClientHandler>>,
    label: String,
}

#[async_trait]
impl TransportHandle for SshTransport {
    async fn close(&self) -> Result<()> {
        let handle = self.handle.lock().await;
        match tokio::time::timeout(
            DISCONNECT_TIMEOUT,
            handle.disconnect(Disconnect::ByApplication, "session closed", "en"),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::debug!(target_host = %self.label, "SSH connection closed");
                Ok(())
            }
            Ok(Err(e)) => Err(MuxError::Transport(format!(
                "disconnect from {} failed: {e}",
                self.label
            ))),
            Err(_) => Err(MuxError::Transport(format!(
                "disconnect from {} timed out",
                self.label
            ))),
        }
    }
}

#[async_trait]
impl ShellProtocol for SshProtocol {
    async fn open_shell(&self, stream: BoxedStream, request: ShellRequest) -> Result<RemoteShell> {
        let label = format!("{}@{}:{}", request.user, request.host, request.port);
        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            verifier: Arc::clone(&request.verifier),
            rejection: Arc::clone(&rejection),
        };

        let mut handle = match client::connect_stream(Arc::clone(&self.config), stream, handler).await
        {
            Ok(handle) => handle,
            Err(e) => {
                return Err(rejection.lock().take().unwrap_or_else(|| {
                    MuxError::Protocol(format!("SSH handshake with {} failed: {e}", request.host))
                }))
            }
        };
        tracing::debug!(target_host = %label, "SSH handshake complete");

        authenticate(&mut handle, &request).await?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| MuxError::Protocol(format!("cannot open session channel: {e}")))?;

        let mut early = Vec::new();
        channel
            .request_pty(
                true,
                &request.pty.term,
                u32::from(request.pty.cols),
                u32::from(request.pty.rows),
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| MuxError::Protocol(format!("PTY request failed: {e}")))?;
        wait_for_reply(&mut channel, "PTY", &mut early).await?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| MuxError::Protocol(format!("shell request failed: {e}")))?;
        wait_for_reply(&mut channel, "shell", &mut early).await?;

        tracing::info!(
            target_host = %label,
            term = %request.pty.term,
            cols = request.pty.cols,
            rows = request.pty.rows,
            "Remote shell started"
        );

        let (input_tx, input_rx) = mpsc::channel(SHELL_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(SHELL_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(8);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(pump(
            channel,
            Pump {
                input: input_rx,
                control: control_rx,
                output: output_tx,
                exit: exit_tx,
                early,
                label: label.clone(),
            },
        ));

        Ok(RemoteShell {
            transport: Arc::new(SshTransport {
                handle: tokio::sync::Mutex::new(handle),
                label,
            }),
            control: control_tx,
            exit: exit_rx,
            input: input_tx,
            output: output_rx,
            size: (request.pty.cols, request.pty.rows),
        })
    }
}

async fn authenticate(handle: &mut client::Handle<ClientHandler>, request: &ShellRequest) -> Result<()> {
    if request.auth.is_empty() {
        return Err(MuxError::Configuration(
            "no authentication methods available".to_string(),
        ));
    }

    for method in &request.auth {
        match method {
            AuthMethod::PublicKey(key) => {
                let accepted = handle
                    .authenticate_publickey(request.user.clone(), Arc::clone(key))
                    .await
                    .map_err(|e| MuxError::Protocol(format!("authentication exchange failed: {e}")))?;
                if accepted {
                    tracing::debug!(user = %request.user, host = %request.host, "Public key accepted");
                    return Ok(());
                }
                tracing::debug!(user = %request.user, host = %request.host, "Public key rejected");
            }
        }
    }

    Err(MuxError::Authentication(format!(
        "server rejected every credential for {}@{}",
        request.user, request.host
    )))
}

/// Waits for the reply to a `want_reply` channel request. Output that
/// arrives first is kept for the pump.
async fn wait_for_reply(
    channel: &mut Channel<Msg>,
    what: &str,
    early: &mut Vec<Vec<u8>>,
) -> Result<()> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(MuxError::Protocol(format!("server refused the {what} request")))
            }
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                early.push(data.to_vec());
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(MuxError::Protocol(format!(
                    "channel closed during the {what} request"
                )))
            }
            Some(_) => {}
        }
    }
}

/// The parts of a shell channel the pump drives.
#[async_trait]
trait ShellChannel: Send {
    async fn next_message(&mut self) -> Option<ChannelMsg>;
    async fn write_input(&mut self, data: &[u8]) -> std::result::Result<(), russh::Error>;
    async fn finish_input(&mut self) -> std::result::Result<(), russh::Error>;
    async fn resize_pty(&mut self, cols: u32, rows: u32) -> std::result::Result<(), russh::Error>;
    async fn close_channel(&mut self) -> std::result::Result<(), russh::Error>;
}

#[async_trait]
impl ShellChannel for Channel<Msg> {
    async fn next_message(&mut self) -> Option<ChannelMsg> {
        self.wait().await
    }

    async fn write_input(&mut self, data: &[u8]) -> std::result::Result<(), russh::Error> {
        self.data(data).await
    }

    async fn finish_input(&mut self) -> std::result::Result<(), russh::Error> {
        self.eof().await
    }

    async fn resize_pty(&mut self, cols: u32, rows: u32) -> std::result::Result<(), russh::Error> {
        self.window_change(cols, rows, 0, 0).await
    }

    async fn close_channel(&mut self) -> std::result::Result<(), russh::Error> {
        self.close().await
    }
}

/// Output read off the channel that the session has not taken yet.
///
/// Bounded in bytes. When full, the oldest chunks are dropped, so a
/// background session that nobody reads never stalls its channel.
struct Backlog {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    limit: usize,
}

impl Backlog {
    fn new(limit: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    /// Queues a chunk. Returns how many bytes were dropped to make room.
    fn push(&mut self, chunk: Vec<u8>) -> usize {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);

        let mut dropped = 0;
        while self.bytes > self.limit && self.chunks.len() > 1 {
            if let Some(old) = self.chunks.pop_front() {
                self.bytes -= old.len();
                dropped += old.len();
            }
        }
        dropped
    }

    fn pop(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.pop_front()?;
        self.bytes -= chunk.len();
        Some(chunk)
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}

/// Channel ends the pump works with.
struct Pump {
    input: mpsc::Receiver<Vec<u8>>,
    control: mpsc::Receiver<ShellControl>,
    output: mpsc::Sender<Vec<u8>>,
    exit: oneshot::Sender<ShellExit>,
    early: Vec<Vec<u8>>,
    label: String,
}

/// Bridges a shell channel to the session's channels until the channel
/// closes or the session asks it to.
///
/// Output is handed over through a [`Backlog`], never awaited inside the
/// message loop: exit reports, closes and control requests keep flowing
/// while the session is not reading output.
async fn pump<C: ShellChannel>(mut channel: C, io: Pump) {
    let Pump {
        mut input,
        mut control,
        output,
        exit,
        early,
        label,
    } = io;

    let mut backlog = Backlog::new(BACKLOG_LIMIT);
    for chunk in early {
        backlog.push(chunk);
    }

    let mut status = None;
    let mut input_open = true;
    let mut closed_locally = false;

    loop {
        tokio::select! {
            permit = output.reserve(), if !backlog.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(chunk) = backlog.pop() {
                        permit.send(chunk);
                    }
                }
                Err(_) => {
                    tracing::trace!(target_host = %label, "Output reader gone, discarding data");
                    backlog.clear();
                }
            },
            msg = channel.next_message() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if output.is_closed() {
                        continue;
                    }
                    let dropped = backlog.push(data.to_vec());
                    if dropped > 0 {
                        tracing::debug!(target_host = %label, dropped, "Output backlog full, dropped oldest output");
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = Some(ShellExit::Status(exit_status));
                }
                Some(ChannelMsg::ExitSignal { signal_name, error_message, .. }) => {
                    status = Some(ShellExit::Signal {
                        signal: format!("{signal_name:?}"),
                        message: error_message,
                    });
                }
                Some(ChannelMsg::Eof) => {
                    tracing::debug!(target_host = %label, "Remote shell sent EOF");
                }
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            chunk = input.recv(), if input_open => match chunk {
                Some(bytes) => {
                    if let Err(e) = channel.write_input(&bytes).await {
                        tracing::warn!(target_host = %label, error = %e, "Failed to send input");
                        break;
                    }
                }
                None => {
                    input_open = false;
                    let _ = channel.finish_input().await;
                }
            },
            request = control.recv() => match request {
                Some(ShellControl::Resize { cols, rows }) => {
                    if let Err(e) = channel.resize_pty(u32::from(cols), u32::from(rows)).await {
                        tracing::warn!(target_host = %label, error = %e, "Window change failed");
                    }
                }
                Some(ShellControl::Close) | None => {
                    let _ = channel.close_channel().await;
                    closed_locally = true;
                    break;
                }
            },
        }
    }

    if !closed_locally && !backlog.is_empty() {
        let flush = async {
            while let Some(chunk) = backlog.pop() {
                if output.send(chunk).await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
            tracing::debug!(target_host = %label, "Unread output dropped at exit");
        }
    }

    let status = status.unwrap_or(ShellExit::Lost);
    tracing::debug!(target_host = %label, exit = %status, "Shell pump finished");
    let _ = exit.send(status);
}
