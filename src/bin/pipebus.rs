//! pipebus - command-line client for pipebusd
//!
//! Registers with the broker, sends each value as one request, prints each
//! response and unregisters.
//!
//! # Usage
//!
//! ```text
//! pipebus 21            # prints 42
//! pipebus 1 2 3         # one request per value
//! pipebus --count 100   # sends 0..100
//! pipebus --id 4242 21  # register under an explicit id
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use pipebus_client::{Client, ClientConfig, ClientError};
use pipebus_core::{default_pipe_dir, ClientId, DEFAULT_REGISTRATION_PIPE};

/// pipebus client - send requests to a running pipebusd
#[derive(Parser, Debug)]
#[command(name = "pipebus", version, about)]
struct Args {
    /// Identity to register under (default: this process's pid)
    #[arg(long)]
    id: Option<u32>,

    /// Send the values 0..N instead of VALUES
    #[arg(short = 'n', long, value_name = "N", conflicts_with = "values")]
    count: Option<u32>,

    /// Pipe directory shared with the broker
    #[arg(long, env = "PIPEBUS_DIR", value_name = "DIR")]
    pipe_dir: Option<PathBuf>,

    /// Registration pipe name inside the pipe directory
    #[arg(long, env = "PIPEBUS_REGISTRATION_PIPE", default_value = DEFAULT_REGISTRATION_PIPE)]
    registration_pipe: String,

    /// Seconds to wait for each response
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Requests to send, one per value
    values: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("pipebus_client=warn".parse()?))
        .init();

    run(Args::parse())
}

fn run(args: Args) -> Result<()> {
    let id = match args.id {
        Some(raw) => ClientId::new(raw).context("--id must be non-zero")?,
        None => ClientId::current_process(),
    };

    let requests: Vec<String> = match args.count {
        Some(count) => (0..count).map(|n| n.to_string()).collect(),
        None => args.values,
    };
    if requests.is_empty() {
        bail!("nothing to send; pass VALUES or --count");
    }

    let config = ClientConfig {
        pipe_dir: args.pipe_dir.unwrap_or_else(default_pipe_dir),
        registration_pipe: args.registration_pipe,
        id,
        response_timeout: Some(Duration::from_secs(args.timeout)),
        ..ClientConfig::default()
    };
    let registration = config.pipe_dir.join(&config.registration_pipe);

    let mut client = Client::connect(config).with_context(|| {
        format!(
            "Could not register with broker at {} (is pipebusd running?)",
            registration.display()
        )
    })?;
    debug!(client_id = %id, "Connected");

    let mut failures = 0usize;
    for request in &requests {
        match client.request(request) {
            Ok(response) => println!("{response}"),
            Err(ClientError::Rejected(reason)) => {
                eprintln!("{request}: {reason}");
                failures += 1;
            }
            Err(e) => return Err(e).context(format!("Request {request:?} failed")),
        }
    }

    client.close().context("Failed to unregister")?;

    if failures > 0 {
        bail!("{failures} of {} requests rejected", requests.len());
    }
    Ok(())
}
