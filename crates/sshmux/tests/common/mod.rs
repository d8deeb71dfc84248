//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh_keys::key::KeyPair;
use tokio::io::{AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use sshmux::connector::{
    AuthMethod, AuthProvider, BoxedStream, ConnectorSettings, HostKeyVerifier, PtyRequest,
    SessionConnector, ShellProtocol, ShellRequest, Transport, TrustMode,
};
use sshmux::error::{MuxError, Result};
use sshmux::session::{
    RemoteShell, Session, ShellControl, ShellExit, TransportHandle, SHELL_CHANNEL_CAPACITY,
};
use sshmux::terminal::{FixedTerminal, RawMode};

/// Upper bound for every wait in the tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds, panicking after [`WAIT`].
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// In-memory transport. Keeps the far end of every stream alive.
#[derive(Default)]
pub struct FakeTransport {
    pub fail: bool,
    pub dials: AtomicUsize,
    peers: Mutex<Vec<DuplexStream>>,
}

impl FakeTransport {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(&self, _host: &str, _port: u16) -> io::Result<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        let (ours, theirs) = tokio::io::duplex(64);
        self.peers.lock().push(theirs);
        Ok(Box::new(ours))
    }
}

/// Transport handle that counts closes.
#[derive(Default)]
pub struct CountingHandle {
    pub closes: AtomicUsize,
}

impl CountingHandle {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportHandle for CountingHandle {
    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// The remote end of a fake shell, handed to the test.
pub struct FakeRemote {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pty: PtyRequest,
    pub input: mpsc::Receiver<Vec<u8>>,
    pub output: mpsc::Sender<Vec<u8>>,
    pub control: mpsc::Receiver<ShellControl>,
    pub exit: Option<oneshot::Sender<ShellExit>>,
    pub handle: Arc<CountingHandle>,
}

impl FakeRemote {
    /// Reports the shell's exit.
    pub fn exit_with(&mut self, exit: ShellExit) {
        if let Some(tx) = self.exit.take() {
            let _ = tx.send(exit);
        }
    }

    /// Reads remote input until `expected.len()` bytes arrived.
    pub async fn read_input(&mut self, expected: usize) -> Vec<u8> {
        let mut received = Vec::new();
        while received.len() < expected {
            let chunk = tokio::time::timeout(WAIT, self.input.recv())
                .await
                .expect("timed out waiting for remote input")
                .expect("remote input closed");
            received.extend(chunk);
        }
        received
    }
}

/// Builds a shell bundle and its remote end without any protocol.
pub fn fake_shell(host: &str, port: u16, user: &str, pty: PtyRequest) -> (RemoteShell, FakeRemote) {
    let handle = Arc::new(CountingHandle::default());
    let (input_tx, input_rx) = mpsc::channel(SHELL_CHANNEL_CAPACITY);
    let (output_tx, output_rx) = mpsc::channel(SHELL_CHANNEL_CAPACITY);
    let (control_tx, control_rx) = mpsc::channel(8);
    let (exit_tx, exit_rx) = oneshot::channel();

    let shell = RemoteShell {
        transport: handle.clone(),
        control: control_tx,
        exit: exit_rx,
        input: input_tx,
        output: output_rx,
        size: (pty.cols, pty.rows),
    };
    let remote = FakeRemote {
        host: host.to_string(),
        port,
        user: user.to_string(),
        pty,
        input: input_rx,
        output: output_tx,
        control: control_rx,
        exit: Some(exit_tx),
        handle,
    };
    (shell, remote)
}

/// Marks a `Created` session connected with a fake shell.
pub fn make_ready(session: &Session) -> FakeRemote {
    let pty = PtyRequest {
        term: "xterm".into(),
        cols: 80,
        rows: 24,
    };
    let (shell, remote) = fake_shell(session.host(), 22, session.user(), pty);
    session.mark_connecting().unwrap();
    session.install(shell).unwrap();
    remote
}

/// How the fake protocol behaves.
#[derive(Clone)]
pub enum Behavior {
    Succeed,
    Fail(MuxError),
    Hang,
}

/// Shell protocol that hands every shell's remote end to the test.
pub struct FakeProtocol {
    behavior: Behavior,
    remotes: mpsc::UnboundedSender<FakeRemote>,
}

impl FakeProtocol {
    pub fn new(behavior: Behavior) -> (Self, mpsc::UnboundedReceiver<FakeRemote>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (Self { behavior, remotes }, rx)
    }
}

#[async_trait]
impl ShellProtocol for FakeProtocol {
    async fn open_shell(&self, _stream: BoxedStream, request: ShellRequest) -> Result<RemoteShell> {
        let server_key = KeyPair::generate_ed25519()
            .clone_public_key()
            .map_err(|e| MuxError::Protocol(e.to_string()))?;
        (request.verifier)(&server_key)?;

        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::Fail(e) => return Err(e.clone()),
            Behavior::Hang => std::future::pending::<()>().await,
        }

        let (shell, remote) = fake_shell(&request.host, request.port, &request.user, request.pty);
        let _ = self.remotes.send(remote);
        Ok(shell)
    }
}

/// Auth provider with fixed answers.
#[derive(Default)]
pub struct StaticAuth {
    pub methods_error: Option<MuxError>,
    pub reject_host_keys: bool,
}

impl AuthProvider for StaticAuth {
    fn auth_methods(
        &self,
        _key_path: Option<&std::path::Path>,
        _user: &str,
        _host: &str,
    ) -> Result<Vec<AuthMethod>> {
        match &self.methods_error {
            Some(e) => Err(e.clone()),
            None => Ok(vec![AuthMethod::PublicKey(Arc::new(KeyPair::generate_ed25519()))]),
        }
    }

    fn host_key_verifier(&self, host: &str, _port: u16, _trust: &TrustMode) -> Result<HostKeyVerifier> {
        let reject = self.reject_host_keys;
        let host = host.to_string();
        Ok(Arc::new(move |_key| {
            if reject {
                Err(MuxError::Trust(format!("host key for {host} is not trusted")))
            } else {
                Ok(())
            }
        }))
    }
}

/// Builds a connector over the fakes, with a fixed 80x24 terminal.
pub fn connector(
    transport: Arc<FakeTransport>,
    protocol: FakeProtocol,
    auth: StaticAuth,
) -> Arc<SessionConnector> {
    Arc::new(SessionConnector::new(
        ConnectorSettings {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        transport,
        Arc::new(protocol),
        Arc::new(auth),
        Arc::new(FixedTerminal {
            size: Some((80, 24)),
            term: Some("xterm-256color".into()),
        }),
    ))
}

/// Terminal sink the test can inspect.
#[derive(Clone, Default)]
pub struct SharedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }

    pub async fn wait_for(&self, needle: &str) {
        let output = self.clone();
        eventually(&format!("terminal output {needle:?}"), move || {
            output.text().contains(needle)
        })
        .await;
    }
}

impl AsyncWrite for SharedOutput {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        self.buf.lock().extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Raw mode that only counts.
#[derive(Clone, Default)]
pub struct CountingRawMode {
    pub enabled: Arc<AtomicUsize>,
    pub disabled: Arc<AtomicUsize>,
}

impl CountingRawMode {
    pub fn restore_count(&self) -> usize {
        self.disabled.load(Ordering::SeqCst)
    }
}

impl RawMode for CountingRawMode {
    fn enable(&self) -> io::Result<()> {
        self.enabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable(&self) -> io::Result<()> {
        self.disabled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
