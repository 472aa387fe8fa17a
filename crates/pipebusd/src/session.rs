//! Per-client session worker.
//!
//! A `ClientSession` owns the broker side of one client's duplex channel:
//! a reader on `<id>_to_server` and a writer on `server_to_<id>`. Once
//! started it polls for requests on its own thread, answers each one through
//! the injected [`RequestHandler`], and on exit removes both pipes and their
//! lock files.
//!
//! # Lifecycle
//!
//! ```text
//! Registered ──start()──▶ Started ──unregister──▶ Unregistering ──loop exit──▶ Stopped
//! ```
//!
//! Cancellation is cooperative: `stop()` cancels the session token and the
//! loop notices it at the top of its next iteration. That is why the loop
//! only ever does non-blocking reads.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in this module
//! - Mutex poisoning is recovered with `PoisonError::into_inner`

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pipebus_core::{
    ensure_pipe, remove_pipe, ChannelConfig, ChannelPaths, ChannelReader, ChannelResult,
    ChannelWriter, ClientId, ReadMode,
};
use pipebus_protocol::{RequestHandler, Response};

/// Default bound on how long a session waits for its client's response pipe.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Client State
// ============================================================================

/// Lifecycle state of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Register message read, session constructed.
    Registered,
    /// Session thread running.
    Started,
    /// Unregister message read, teardown in progress.
    Unregistering,
    /// Session loop exited and resources released.
    Stopped,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Registered => "registered",
            Self::Started => "started",
            Self::Unregistering => "unregistering",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Read-only snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub id: ClientId,
    pub state: ClientState,
    pub registered_at: DateTime<Utc>,
    pub requests_handled: u64,
}

/// Channel tuning applied to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub channel: ChannelConfig,
    /// How long a response write waits for the client's reader, or for room
    /// in a full pipe, before the session gives up on the client. `None`
    /// waits forever.
    pub response_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            response_timeout: Some(DEFAULT_RESPONSE_TIMEOUT),
        }
    }
}

// ============================================================================
// Client Session
// ============================================================================

#[derive(Debug)]
struct SessionStatus {
    state: Mutex<ClientState>,
    requests_handled: AtomicU64,
}

impl SessionStatus {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: ClientState) {
        *self.state() = state;
    }
}

/// Broker side of one registered client.
pub struct ClientSession {
    id: ClientId,
    registered_at: DateTime<Utc>,
    status: Arc<SessionStatus>,
    cancel: CancellationToken,
    /// Present until `start()` hands it to the session thread.
    worker: Mutex<Option<SessionWorker>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pipes: [PathBuf; 2],
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Attaches to the client's pipes, creating any that do not exist yet.
    ///
    /// Pipes that already exist are kept: the client normally creates both
    /// before registering and may already hold its end open.
    pub fn new(
        id: ClientId,
        paths: &ChannelPaths,
        settings: SessionSettings,
        handler: Arc<dyn RequestHandler>,
        cancel: CancellationToken,
    ) -> ChannelResult<Self> {
        let to_server = paths.to_server(id);
        let from_server = paths.from_server(id);
        ensure_pipe(&to_server)?;
        ensure_pipe(&from_server)?;

        let reader = ChannelReader::open(&to_server, settings.channel)?;
        let writer = ChannelWriter::new(
            &from_server,
            ChannelConfig {
                write_timeout: settings.response_timeout,
                ..settings.channel
            },
        );

        let status = Arc::new(SessionStatus {
            state: Mutex::new(ClientState::Registered),
            requests_handled: AtomicU64::new(0),
        });

        let worker = SessionWorker {
            id,
            reader,
            writer,
            handler,
            cancel: cancel.clone(),
            status: Arc::clone(&status),
            poll_interval: settings.channel.poll_interval,
            pipes: [to_server.clone(), from_server.clone()],
        };

        Ok(Self {
            id,
            registered_at: Utc::now(),
            status,
            cancel,
            worker: Mutex::new(Some(worker)),
            thread: Mutex::new(None),
            pipes: [to_server, from_server],
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ClientState {
        *self.status.state()
    }

    pub fn requests_handled(&self) -> u64 {
        self.status.requests_handled.load(Ordering::Relaxed)
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            state: self.state(),
            registered_at: self.registered_at,
            requests_handled: self.requests_handled(),
        }
    }

    /// Spawns the session thread. Calling it again is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let Some(worker) = self.take_worker() else {
            return Ok(());
        };

        // Set before spawning so a fast loop exit cannot be overwritten.
        self.status.set(ClientState::Started);
        let spawned = thread::Builder::new()
            .name(format!("session-{}", self.id))
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                Ok(())
            }
            Err(e) => {
                // The worker went down with the closure.
                remove_pipes(self.id, &self.pipes);
                self.status.set(ClientState::Stopped);
                Err(e)
            }
        }
    }

    /// Marks the session as being torn down.
    pub fn begin_unregister(&self) {
        let mut state = self.status.state();
        if *state != ClientState::Stopped {
            *state = ClientState::Unregistering;
        }
    }

    /// Asks the session loop to exit after its current iteration.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the session loop to exit and release its pipes.
    ///
    /// A session that was never started releases its pipes here instead.
    pub fn join(&self) {
        if let Some(worker) = self.take_worker() {
            worker.teardown();
            return;
        }

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(client_id = %self.id, "Session thread panicked");
                remove_pipes(self.id, &self.pipes);
                self.status.set(ClientState::Stopped);
            }
        }
    }

    /// `stop()` followed by `join()`.
    pub fn shutdown(&self) {
        self.stop();
        self.join();
    }

    fn take_worker(&self) -> Option<SessionWorker> {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

// ============================================================================
// Session Worker
// ============================================================================

/// Everything the session thread owns.
struct SessionWorker {
    id: ClientId,
    reader: ChannelReader,
    writer: ChannelWriter,
    handler: Arc<dyn RequestHandler>,
    cancel: CancellationToken,
    status: Arc<SessionStatus>,
    poll_interval: Duration,
    pipes: [PathBuf; 2],
}

impl SessionWorker {
    fn run(self) {
        info!(client_id = %self.id, "Session started");

        if let Err(e) = self.serve() {
            error!(client_id = %self.id, error = %e, "Session loop failed");
        }

        self.teardown();
    }

    fn serve(&self) -> ChannelResult<()> {
        while !self.cancel.is_cancelled() {
            for request in self.reader.read(ReadMode::NonBlocking)? {
                self.handle(&request)?;
            }
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    fn handle(&self, request: &str) -> ChannelResult<()> {
        debug!(client_id = %self.id, request, "Request received");

        let result = self.handler.process(request);
        if let Err(e) = &result {
            warn!(client_id = %self.id, request, error = %e, "Handler rejected request");
        }

        self.status.requests_handled.fetch_add(1, Ordering::Relaxed);

        let response = Response::from_result(result).encode();
        self.writer.write(&response)?;

        debug!(client_id = %self.id, response = %response, "Response sent");
        Ok(())
    }

    fn teardown(self) {
        let Self {
            id,
            reader,
            pipes,
            status,
            ..
        } = self;
        drop(reader);
        remove_pipes(id, &pipes);

        status.set(ClientState::Stopped);
        info!(client_id = %id, "Session stopped");
    }
}

/// Removes both pipes and their lock files. Already-removed files are fine.
fn remove_pipes(id: ClientId, pipes: &[PathBuf]) {
    for pipe in pipes {
        if let Err(e) = remove_pipe(pipe) {
            warn!(client_id = %id, error = %e, "Failed to remove session pipe");
        }
    }
}
