//! Authentication and host-key trust.
//!
//! The connector asks an [`AuthProvider`] for two things before it opens a
//! connection: the list of credentials to offer, and a verifier for the
//! server's host key. [`KeyFileAuth`] is the provider used by the binary:
//! it offers one private key from disk and checks host keys against a
//! `known_hosts` file.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use russh_keys::key::{KeyPair, PublicKey};

use crate::error::{MuxError, Result};

/// A credential offered to the server, in order.
#[derive(Clone)]
pub enum AuthMethod {
    /// Public-key authentication with a loaded private key.
    PublicKey(Arc<KeyPair>),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PublicKey(key) => write!(f, "PublicKey({})", key.name()),
        }
    }
}

/// Decides whether a server host key is trusted.
pub type HostKeyVerifier = Arc<dyn Fn(&PublicKey) -> Result<()> + Send + Sync>;

/// How host keys are checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustMode {
    /// Accept every host key.
    Insecure,
    /// Require a matching entry in the given `known_hosts` file.
    KnownHosts(PathBuf),
}

/// Source of credentials and host-key policy.
pub trait AuthProvider: Send + Sync {
    /// Returns the credentials to offer when logging in as `user` on `host`.
    fn auth_methods(&self, key_path: Option<&Path>, user: &str, host: &str)
        -> Result<Vec<AuthMethod>>;

    /// Returns the verifier for `host:port` under the given trust mode.
    fn host_key_verifier(&self, host: &str, port: u16, trust: &TrustMode)
        -> Result<HostKeyVerifier>;
}

/// Asks the user for a key passphrase.
pub trait PassphrasePrompt: Send + Sync {
    /// Returns the passphrase, or `None` if the user gave up.
    fn passphrase(&self, key_path: &Path) -> Option<String>;
}

/// Never supplies a passphrase; encrypted keys fail to load.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPassphrase;

impl PassphrasePrompt for NoPassphrase {
    fn passphrase(&self, _key_path: &Path) -> Option<String> {
        None
    }
}

/// Reads a passphrase from the terminal without echo.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPassphrasePrompt;

impl PassphrasePrompt for TerminalPassphrasePrompt {
    fn passphrase(&self, key_path: &Path) -> Option<String> {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "Enter passphrase for key '{}': ", key_path.display());
        let _ = stderr.flush();

        let was_raw = crossterm::terminal::is_raw_mode_enabled().unwrap_or(false);
        if !was_raw && crossterm::terminal::enable_raw_mode().is_err() {
            return None;
        }
        let passphrase = read_hidden_line();
        if !was_raw {
            let _ = crossterm::terminal::disable_raw_mode();
        }

        let _ = write!(stderr, "\r\n");
        passphrase
    }
}

fn read_hidden_line() -> Option<String> {
    use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};

    let mut line = String::new();
    loop {
        let Event::Key(key) = event::read().ok()? else {
            continue;
        };
        if key.kind == KeyEventKind::Release {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Some(line),
            KeyCode::Esc => return None,
            KeyCode::Char('c') | KeyCode::Char('d')
                if key.modifiers.contains(KeyModifiers::CONTROL) =>
            {
                return None
            }
            KeyCode::Backspace => {
                line.pop();
            }
            KeyCode::Char(c) => line.push(c),
            _ => {}
        }
    }
}

/// Offers a single private key loaded from disk.
///
/// Loaded keys are cached per path, so a passphrase is asked for at most
/// once per process. Call [`preload`](Self::preload) before the terminal
/// enters raw mode so the prompt never competes with the multiplexer for
/// stdin.
pub struct KeyFileAuth {
    prompt: Box<dyn PassphrasePrompt>,
    keys: Mutex<HashMap<PathBuf, Arc<KeyPair>>>,
}

impl KeyFileAuth {
    /// Creates a provider that asks `prompt` for passphrases.
    pub fn new(prompt: impl PassphrasePrompt + 'static) -> Self {
        Self {
            prompt: Box::new(prompt),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Loads and caches the key at `path`.
    pub fn preload(&self, path: &Path) -> Result<()> {
        self.load(path).map(|_| ())
    }

    fn load(&self, path: &Path) -> Result<Arc<KeyPair>> {
        if let Some(key) = self.keys.lock().get(path) {
            return Ok(Arc::clone(key));
        }

        let key = match russh_keys::load_secret_key(path, None) {
            Ok(key) => key,
            Err(russh_keys::Error::KeyIsEncrypted) => {
                let passphrase = self.prompt.passphrase(path).ok_or_else(|| {
                    MuxError::Configuration(format!(
                        "identity {} is encrypted and no passphrase was given",
                        path.display()
                    ))
                })?;
                russh_keys::load_secret_key(path, Some(&passphrase)).map_err(|e| {
                    MuxError::Configuration(format!(
                        "cannot decrypt identity {}: {e}",
                        path.display()
                    ))
                })?
            }
            Err(e) => {
                return Err(MuxError::Configuration(format!(
                    "cannot load identity {}: {e}",
                    path.display()
                )))
            }
        };

        tracing::debug!(path = %path.display(), algorithm = key.name(), "Loaded identity");
        let key = Arc::new(key);
        self.keys.lock().insert(path.to_path_buf(), Arc::clone(&key));
        Ok(key)
    }
}

impl Default for KeyFileAuth {
    fn default() -> Self {
        Self::new(NoPassphrase)
    }
}

impl fmt::Debug for KeyFileAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFileAuth")
            .field("cached", &self.keys.lock().len())
            .finish()
    }
}

impl AuthProvider for KeyFileAuth {
    fn auth_methods(
        &self,
        key_path: Option<&Path>,
        _user: &str,
        _host: &str,
    ) -> Result<Vec<AuthMethod>> {
        let path = key_path.ok_or_else(|| {
            MuxError::Configuration(
                "no identity file configured; password authentication is not supported in multiplexed mode"
                    .to_string(),
            )
        })?;
        Ok(vec![AuthMethod::PublicKey(self.load(path)?)])
    }

    fn host_key_verifier(
        &self,
        host: &str,
        port: u16,
        trust: &TrustMode,
    ) -> Result<HostKeyVerifier> {
        Ok(known_hosts_verifier(host, port, trust))
    }
}

/// Builds the verifier for a trust mode.
pub fn known_hosts_verifier(host: &str, port: u16, trust: &TrustMode) -> HostKeyVerifier {
    let host = host.to_string();
    match trust {
        TrustMode::Insecure => Arc::new(move |key: &PublicKey| {
            tracing::warn!(
                host = %host,
                fingerprint = %key.fingerprint(),
                "Accepting host key without verification"
            );
            Ok(())
        }),
        TrustMode::KnownHosts(path) => {
            let path = path.clone();
            Arc::new(move |key: &PublicKey| {
                match russh_keys::check_known_hosts_path(&host, port, key, &path) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(MuxError::Trust(format!(
                        "host key for {host} ({}) is not in {}",
                        key.fingerprint(),
                        path.display()
                    ))),
                    Err(russh_keys::Error::KeyChanged { line }) => Err(MuxError::Trust(format!(
                        "host key for {host} does not match {} line {line}",
                        path.display()
                    ))),
                    Err(e) => Err(MuxError::Trust(format!(
                        "cannot verify host key for {host}: {e}"
                    ))),
                }
            })
        }
    }
}
