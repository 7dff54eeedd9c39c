//! klogsrv - kernel log broadcast daemon
//!
//! Follows the kernel log and pushes every new byte to all connected TCP
//! clients.
//!
//! # Usage
//!
//! ```bash
//! # Serve in the foreground
//! klogsrv
//!
//! # Serve in the background, diagnostics on the console
//! klogsrv start -d
//!
//! # Follow a plain file on another port
//! klogsrv start --source /var/log/kern.log --port 4000
//!
//! # Stop every running instance
//! klogsrv stop
//!
//! # Show running instances
//! klogsrv status
//! ```

use std::fs::{self, File, OpenOptions};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use klog_core::{DEFAULT_PORT, DEFAULT_SOURCE_PATH, PROCESS_NAME, RETRY_DELAY};
use klogd::discovery::SystemInterfaces;
use klogd::guard::{self, DEFAULT_ATTEMPTS, DEFAULT_PAUSE};
use klogd::notify::LogNotifier;
use klogd::server::{ServerConfig, MAX_CLIENTS};
use klogd::supervisor::Supervisor;

/// Console device diagnostics go to when daemonized.
const DEFAULT_CONSOLE: &str = "/dev/console";

/// klogsrv - live kernel log over TCP
#[derive(Parser, Debug)]
#[command(name = "klogsrv", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    start: StartArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start(StartArgs),
    /// Stop every running daemon instance
    Stop,
    /// Show running daemon instances
    Status,
}

#[derive(Args, Debug, Clone)]
struct StartArgs {
    /// Run as a background daemon (fork to background)
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Where daemon output goes when running in the background
    #[arg(long, env = "KLOG_CONSOLE", default_value = DEFAULT_CONSOLE)]
    console: PathBuf,

    /// Log file or device to follow
    #[arg(long, env = "KLOG_SOURCE", default_value = DEFAULT_SOURCE_PATH)]
    source: PathBuf,

    /// TCP port to serve on
    #[arg(long, env = "KLOG_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Pause between attempts after a failure, in milliseconds
    #[arg(long, env = "KLOG_RETRY_DELAY_MS", default_value_t = RETRY_DELAY.as_millis() as u64)]
    retry_delay_ms: u64,

    /// Connections beyond this count are refused
    #[arg(long, env = "KLOG_MAX_CLIENTS", default_value_t = MAX_CLIENTS)]
    max_clients: usize,
}

impl StartArgs {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            source_path: self.source.clone(),
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_clients: self.max_clients,
            ..ServerConfig::default()
        }
    }
}

fn log_file_path() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("klog")
        .join("klogsrv.log")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Start(cli.start)) {
        Command::Start(args) => {
            if args.daemon {
                daemonize(&args.console)?;
            }

            init_tracing()?;

            match guard::terminate_other_instances(PROCESS_NAME, DEFAULT_ATTEMPTS, DEFAULT_PAUSE) {
                Ok(0) => {}
                Ok(stopped) => info!(stopped, "Replaced running instances"),
                Err(e) => warn!(error = %e, "Could not clear running instances"),
            }

            run_daemon(args.server_config())
        }
        Command::Stop => {
            let running = guard::find_other_instances(PROCESS_NAME);
            if running.is_empty() {
                println!("Daemon is not running.");
                return Ok(());
            }

            println!("Stopping daemon (PIDs {running:?})...");
            match guard::terminate_other_instances(PROCESS_NAME, DEFAULT_ATTEMPTS, DEFAULT_PAUSE) {
                Ok(_) => {
                    println!("Daemon stopped.");
                    Ok(())
                }
                Err(e) => bail!("Daemon did not stop: {e}"),
            }
        }
        Command::Status => {
            let running = guard::find_other_instances(PROCESS_NAME);
            if running.is_empty() {
                println!("Daemon is not running.");
                process::exit(1);
            }

            for pid in running {
                println!("Daemon is running (PID {pid})");
            }
            Ok(())
        }
    }
}

/// Opens the diagnostic sink: the console if writable, otherwise a log file.
fn open_output(console: &Path) -> Result<File> {
    if let Ok(file) = OpenOptions::new().write(true).open(console) {
        return Ok(file);
    }

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))
}

fn daemonize(console: &Path) -> Result<()> {
    use daemonize::Daemonize;

    let stdout = open_output(console)?;
    let stderr = stdout
        .try_clone()
        .context("Failed to duplicate output handle for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("klogd=info".parse()?)
                .add_directive("klog_core=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn run_daemon(config: ServerConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        source = %config.source_path.display(),
        port = config.bind_addr.port(),
        "klogsrv starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let supervisor = Supervisor::new(
        config,
        Arc::new(SystemInterfaces),
        Arc::new(LogNotifier),
        cancel_token,
    );
    supervisor.run().await;

    let stats = supervisor.stats();
    info!(
        attempts = stats.attempts,
        sessions = stats.sessions_started,
        "klogsrv stopped"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
