//! pipebusd - named-pipe request broker
//!
//! Listens on the registration pipe and serves every registered client on
//! its own pair of pipes.
//!
//! # Usage
//!
//! ```bash
//! # Start the broker (foreground)
//! pipebusd start
//!
//! # Start in the background
//! pipebusd start -d
//!
//! # Run for ten seconds, then shut down
//! pipebusd start --lifetime 10
//!
//! # Stop / inspect a background broker
//! pipebusd stop
//! pipebusd status
//!
//! # Custom pipe directory
//! PIPEBUS_DIR=/run/pipebus pipebusd start
//!
//! # Enable debug logging
//! RUST_LOG=pipebusd=debug,pipebus_core=debug pipebusd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: stop registration, then apply the configured shutdown

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pipebusd::{Broker, BrokerConfig};

/// pipebus broker daemon
#[derive(Parser, Debug)]
#[command(name = "pipebusd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the broker
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// TOML config file (default: <config dir>/pipebus/pipebusd.toml if present)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Shut down after this many seconds
        #[arg(long, value_name = "SECS")]
        lifetime: Option<u64>,
    },
    /// Stop the running broker
    Stop,
    /// Show broker status
    Status {
        /// TOML config file used to locate the registration pipe
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pipebus")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("pipebusd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("pipebusd.log")
}

/// Explicit path, else the per-user default when that file exists.
fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("pipebus").join("pipebusd.toml"))
            .filter(|path| path.is_file())
    })
}

fn load_config(explicit: Option<PathBuf>) -> Result<BrokerConfig> {
    let path = resolve_config_path(explicit);
    BrokerConfig::load(path.as_deref()).with_context(|| match &path {
        Some(path) => format!("Failed to load config {}", path.display()),
        None => "Invalid configuration".to_string(),
    })
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// PID of the running broker. A stale PID file is removed.
fn running_broker() -> Option<u32> {
    let pid = read_pid()?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

fn send_sigterm(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).context("PID out of range")?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!(
            "Failed to send SIGTERM to process {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
        lifetime: None,
    });

    match command {
        Command::Start {
            daemon,
            config,
            lifetime,
        } => {
            if let Some(pid) = running_broker() {
                eprintln!("Broker is already running (PID {pid})");
                eprintln!("Use 'pipebusd stop' to stop it first.");
                process::exit(1);
            }

            // Load before forking so config errors reach the terminal.
            let config = load_config(config)?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_broker(config, lifetime.map(Duration::from_secs));
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = running_broker() else {
                println!("Broker is not running.");
                return Ok(());
            };

            println!("Stopping broker (PID {pid})...");
            send_sigterm(pid)?;

            for _ in 0..50 {
                if !is_process_running(pid) {
                    println!("Broker stopped.");
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }

            eprintln!("Broker did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status { config } => {
            let Some(pid) = running_broker() else {
                println!("Broker is not running.");
                process::exit(1);
            };

            println!("Broker is running (PID {pid})");
            let config = load_config(config)?;
            let paths = config.paths();
            if pipebus_core::is_pipe(paths.registration()) {
                println!("Registration pipe: {}", paths.registration().display());
            }
            Ok(())
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the broker until a signal arrives or `lifetime` elapses.
///
/// The broker itself runs on plain threads; the runtime only waits.
#[tokio::main]
async fn run_broker(config: BrokerConfig, lifetime: Option<Duration>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pipebusd=info".parse()?)
                .add_directive("pipebus_core=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        pipe_dir = %config.pipe_dir.display(),
        "pipebusd starting"
    );

    let shutdown = config.shutdown;
    let mut broker = Broker::with_doubler(config).context("Failed to set up broker")?;
    broker.start().context("Failed to start broker")?;

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        signal_token.cancel();
    });

    match lifetime {
        Some(lifetime) => {
            tokio::select! {
                _ = cancel_token.cancelled() => {}
                _ = tokio::time::sleep(lifetime) => {
                    info!(?lifetime, "Lifetime elapsed");
                }
            }
        }
        None => cancel_token.cancelled().await,
    }

    // Joins session threads; keep it off the runtime's workers.
    tokio::task::spawn_blocking(move || broker.stop(shutdown))
        .await
        .context("Broker shutdown panicked")?;

    info!("pipebusd stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
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

    Ok(())
}
