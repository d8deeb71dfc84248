//! sshmux
//!
//! Screen-style multiplexer for interactive SSH sessions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;

use sshmux::config::Config;
use sshmux::connector::{KeyFileAuth, SessionConnector, TerminalPassphrasePrompt};
use sshmux::mux::command::describe_key;
use sshmux::mux::{
    parse_host_list, spawn_resize_listener, spawn_shutdown_listener, Multiplexer, TerminalWriter,
};
use sshmux::session::SessionManager;
use sshmux::terminal::{CrosstermRawMode, LocalTerminal, TerminalScope};

/// How long pending terminal output may take to drain at exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// sshmux - screen-style multiplexer for interactive SSH sessions.
#[derive(Parser, Debug)]
#[command(name = "sshmux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Connect to hosts and multiplex their shells in this terminal
    Mux {
        /// Comma-separated hosts, each as [user@]host[:port]
        hosts: Option<String>,

        /// Remote user for hosts given without user@
        #[arg(short = 'l', long)]
        user: Option<String>,

        /// Private key file
        #[arg(short, long, value_name = "FILE")]
        identity: Option<PathBuf>,

        /// Port for hosts given without :port
        #[arg(short, long)]
        port: Option<u16>,

        /// Accept host keys without checking known_hosts
        #[arg(long)]
        insecure: bool,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();

    match cli.command {
        Commands::Config => {
            config.validate()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Mux {
            hosts,
            user,
            identity,
            port,
            insecure,
        } => {
            if let Some(user) = user {
                config.mux.default_user = user;
            }
            if let Some(identity) = identity {
                config.connection.identity_file = Some(identity);
            }
            if let Some(port) = port {
                config.connection.port = u32::from(port);
            }
            if insecure {
                config.connection.insecure = true;
            }
            config.validate()?;

            let _guard = init_logging(&config, cli.verbose)?;
            tracing::info!("sshmux starting");

            let runtime = tokio::runtime::Runtime::new().context("Failed to start the runtime")?;
            let result = runtime.block_on(run_mux(config, hosts));
            // The blocking stdin reader never finishes on its own.
            runtime.shutdown_timeout(Duration::from_millis(100));

            tracing::info!("sshmux stopped");
            result
        }
    }
}

/// Logs go to a file: the terminal belongs to the remote shells.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<WorkerGuard> {
    let log_dir = &config.logging.log_dir;
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::never(log_dir, "sshmux.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = if verbose {
        "debug".to_string()
    } else {
        config.logging.log_level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

async fn run_mux(config: Config, hosts: Option<String>) -> anyhow::Result<()> {
    let targets = match hosts {
        Some(hosts) => parse_host_list(&hosts)?,
        None => Vec::new(),
    };

    let settings = config.connector_settings();
    let key_path = settings.key_path.clone().context(
        "No identity file found; pass --identity or set connection.identity_file",
    )?;

    // Any passphrase prompt must happen before raw mode.
    let auth = Arc::new(KeyFileAuth::new(TerminalPassphrasePrompt));
    auth.preload(&key_path)?;

    let connector = Arc::new(SessionConnector::ssh(settings, auth, config.keepalive()));
    let manager = Arc::new(SessionManager::new());
    let shutdown = CancellationToken::new();
    let options = config.mux_options();
    let escape = options.escape;

    let scope = TerminalScope::acquire(CrosstermRawMode)
        .context("Failed to switch the terminal to raw mode")?;
    scope.install_panic_hook();

    let (writer, writer_task) = TerminalWriter::spawn(tokio::io::stdout());
    let mux = Multiplexer::new(Arc::clone(&manager), connector, writer.clone(), options)
        .with_terminal(Arc::clone(&scope))
        .with_shutdown(shutdown.clone());

    let signals = spawn_shutdown_listener(shutdown.clone())?;
    let resize = spawn_resize_listener(manager, Arc::new(LocalTerminal), shutdown.clone())?;

    writer
        .status(format!("{} ? for help", describe_key(escape)))
        .await;
    drop(writer);

    let result = mux.run(&targets, tokio::io::stdin()).await;
    drop(mux);

    signals.abort();
    resize.abort();
    if tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await.is_err() {
        tracing::debug!("Terminal output did not drain in time");
    }
    scope.restore();

    result.map_err(Into::into)
}
