//! Broker client.
//!
//! A [`Client`] owns its two pipes for the whole of its life:
//!
//! 1. `connect()` creates `<id>_to_server` and `server_to_<id>`, attaches
//!    its reader and announces itself with `register <id>`.
//! 2. `request()` writes one line and blocks for exactly one answer. If
//!    that answer does not arrive the client is out of sync and refuses
//!    further requests.
//! 3. `close()` (or drop) sends `unregister <id>` and deletes both pipes.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use pipebus_core::{
    default_pipe_dir, make_pipe, remove_pipe, ChannelConfig, ChannelPaths, ChannelReader,
    ChannelWriter, ClientId, ReadMode, DEFAULT_REGISTRATION_PIPE,
};
use pipebus_protocol::{RegistrationMessage, Response};

use crate::error::{ClientError, Result};

// ============================================================================
// Configuration
// ============================================================================

/// Client settings. Must agree with the broker on `pipe_dir` and
/// `registration_pipe`.
///
/// # Example
///
/// ```rust
/// use pipebus_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     pipe_dir: "/tmp/pipebus-demo".into(),
///     response_timeout: Some(Duration::from_secs(2)),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub pipe_dir: PathBuf,
    pub registration_pipe: String,
    /// Identity announced to the broker. Defaults to this process's pid.
    pub id: ClientId,
    pub channel: ChannelConfig,
    /// Upper bound for connecting to a pipe and for each response.
    /// `None` waits forever.
    pub response_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pipe_dir: default_pipe_dir(),
            registration_pipe: DEFAULT_REGISTRATION_PIPE.to_string(),
            id: ClientId::current_process(),
            channel: ChannelConfig::default(),
            response_timeout: Some(Duration::from_secs(30)),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// A registered connection to the broker.
pub struct Client {
    id: ClientId,
    paths: ChannelPaths,
    registration: ChannelWriter,
    requests: ChannelWriter,
    responses: ChannelReader,
    /// Lines drained together with an earlier response.
    pending: VecDeque<String>,
    response_timeout: Option<Duration>,
    /// Set once a request went unanswered.
    out_of_sync: bool,
    closed: bool,
}

impl Client {
    /// Creates the client's pipes and registers with the broker.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let id = config.id;
        let paths = ChannelPaths::new(&config.pipe_dir, &config.registration_pipe);
        let writer_config = ChannelConfig {
            write_timeout: config.response_timeout,
            ..config.channel
        };

        make_pipe(&paths.to_server(id))?;
        make_pipe(&paths.from_server(id))?;

        let responses = match ChannelReader::open(paths.from_server(id), config.channel) {
            Ok(reader) => reader,
            Err(e) => {
                remove_own_pipes(&paths, id);
                return Err(e.into());
            }
        };

        let client = Self {
            id,
            registration: ChannelWriter::new(paths.registration(), writer_config),
            requests: ChannelWriter::new(paths.to_server(id), writer_config),
            responses,
            paths,
            pending: VecDeque::new(),
            response_timeout: config.response_timeout,
            out_of_sync: false,
            closed: false,
        };

        // On failure the drop below removes the pipes; the unregister it
        // sends is harmless for an id the broker never saw.
        client
            .registration
            .write(&RegistrationMessage::register(id).encode())?;

        info!(client_id = %id, "Registered with broker");
        Ok(client)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// True once a response was lost; see [`request`](Self::request).
    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync
    }

    /// Sends one request and waits for its response.
    ///
    /// An `error:` response is returned as [`ClientError::Rejected`]. A
    /// request over [`MAX_MESSAGE_LEN`](pipebus_core::MAX_MESSAGE_LEN)
    /// bytes fails before anything is sent.
    ///
    /// Once a response fails to arrive (timeout or read error) every later
    /// call returns [`ClientError::OutOfSync`].
    pub fn request(&mut self, payload: &str) -> Result<String> {
        if self.out_of_sync {
            return Err(ClientError::OutOfSync);
        }
        if payload.contains(['\n', '\r']) {
            return Err(ClientError::InvalidRequest(payload.to_string()));
        }

        // A failed write sends nothing, so the exchange is still in step.
        self.requests.write(payload)?;
        debug!(client_id = %self.id, payload, "Request sent");

        let line = match self.next_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(client_id = %self.id, error = %e, "Response lost, client out of sync");
                self.out_of_sync = true;
                return Err(e);
            }
        };
        match Response::decode(&line) {
            Response::Ok(body) => Ok(body),
            Response::Error(reason) => Err(ClientError::Rejected(reason)),
        }
    }

    /// Sends an integer and parses the integer answer.
    pub fn request_value(&mut self, value: i64) -> Result<i64> {
        let response = self.request(&value.to_string())?;
        response.trim().parse().map_err(|e: std::num::ParseIntError| ClientError::Parse {
            response,
            reason: e.to_string(),
        })
    }

    /// Unregisters and deletes this client's pipes.
    ///
    /// The pipes are deleted even when the unregister message cannot be sent.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn next_line(&mut self) -> Result<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(line);
            }
            let mode = match self.response_timeout {
                Some(limit) => ReadMode::BusyWaitFor(limit),
                None => ReadMode::BusyWait,
            };
            self.pending.extend(self.responses.read(mode)?);
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let sent = self
            .registration
            .write(&RegistrationMessage::unregister(self.id).encode());
        remove_own_pipes(&self.paths, self.id);

        if !self.pending.is_empty() {
            debug!(client_id = %self.id, dropped = self.pending.len(), "Discarding unread responses");
        }
        info!(client_id = %self.id, "Closed");
        sent.map_err(ClientError::from)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(client_id = %self.id, error = %e, "Failed to unregister on drop");
        }
    }
}

fn remove_own_pipes(paths: &ChannelPaths, id: ClientId) {
    for pipe in [paths.to_server(id), paths.from_server(id)] {
        if let Err(e) = remove_pipe(&pipe) {
            warn!(client_id = %id, error = %e, "Failed to remove client pipe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipebus_core::{lock_path_for, ChannelError, MAX_MESSAGE_LEN};
    use std::path::Path;
    use std::thread;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    fn id(n: u32) -> ClientId {
        ClientId::new(n).unwrap()
    }

    fn config(dir: &Path, n: u32) -> ClientConfig {
        ClientConfig {
            pipe_dir: dir.to_path_buf(),
            id: id(n),
            response_timeout: Some(Duration::from_secs(5)),
            ..ClientConfig::default()
        }
    }

    /// Registration pipe with a reader attached, standing in for a broker.
    fn fake_registration(dir: &Path) -> ChannelReader {
        let paths = ChannelPaths::with_default_registration(dir);
        make_pipe(paths.registration()).unwrap();
        ChannelReader::open(paths.registration(), ChannelConfig::default()).unwrap()
    }

    fn wait_read(reader: &ChannelReader) -> Vec<String> {
        reader
            .read(ReadMode::BusyWaitFor(Duration::from_secs(5)))
            .unwrap()
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[test]
    fn test_connect_without_broker_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let result = Client::connect(config(dir.path(), 8));
        assert!(matches!(result, Err(ClientError::Channel(_))));

        let paths = ChannelPaths::with_default_registration(dir.path());
        assert!(!paths.to_server(id(8)).exists());
        assert!(!paths.from_server(id(8)).exists());
    }

    #[test]
    fn test_connect_registers_and_close_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let registration = fake_registration(dir.path());

        let client = Client::connect(config(dir.path(), 4242)).unwrap();
        assert_eq!(wait_read(&registration), vec!["register 4242"]);

        let paths = ChannelPaths::with_default_registration(dir.path());
        assert!(pipebus_core::is_pipe(&paths.to_server(id(4242))));
        assert!(pipebus_core::is_pipe(&paths.from_server(id(4242))));

        client.close().unwrap();
        assert_eq!(wait_read(&registration), vec!["unregister 4242"]);
        for pipe in [paths.to_server(id(4242)), paths.from_server(id(4242))] {
            assert!(!pipe.exists());
            assert!(!lock_path_for(&pipe).exists());
        }
    }

    #[test]
    fn test_drop_unregisters() {
        let dir = tempfile::tempdir().unwrap();
        let registration = fake_registration(dir.path());

        {
            let _client = Client::connect(config(dir.path(), 9)).unwrap();
            assert_eq!(wait_read(&registration), vec!["register 9"]);
        }

        assert_eq!(wait_read(&registration), vec!["unregister 9"]);
    }

    #[test]
    fn test_request_round_trip_against_fake_session() {
        let dir = tempfile::tempdir().unwrap();
        let registration = fake_registration(dir.path());
        let mut client = Client::connect(config(dir.path(), 5)).unwrap();
        wait_read(&registration);

        let paths = ChannelPaths::with_default_registration(dir.path());
        let inbound = ChannelReader::open(paths.to_server(id(5)), ChannelConfig::default()).unwrap();
        let outbound = ChannelWriter::new(paths.from_server(id(5)), ChannelConfig::default());

        let session = thread::spawn(move || {
            let requests = wait_read(&inbound);
            assert_eq!(requests, vec!["21"]);
            outbound.write("42").unwrap();

            let requests = wait_read(&inbound);
            assert_eq!(requests, vec!["oops"]);
            outbound.write("error: malformed request").unwrap();
        });

        assert_eq!(client.request_value(21).unwrap(), 42);
        let err = client.request("oops").unwrap_err();
        assert!(matches!(err, ClientError::Rejected(reason) if reason == "malformed request"));

        session.join().unwrap();
        client.close().unwrap();
    }

    #[test]
    fn test_extra_lines_are_queued() {
        let dir = tempfile::tempdir().unwrap();
        let registration = fake_registration(dir.path());
        let mut client = Client::connect(config(dir.path(), 6)).unwrap();
        wait_read(&registration);

        let paths = ChannelPaths::with_default_registration(dir.path());
        let inbound = ChannelReader::open(paths.to_server(id(6)), ChannelConfig::default()).unwrap();
        // Two answers land before the client reads either.
        let outbound = ChannelWriter::new(paths.from_server(id(6)), ChannelConfig::default());
        outbound.write("first").unwrap();
        outbound.write("second").unwrap();

        assert_eq!(client.request("a").unwrap(), "first");
        assert_eq!(client.request("b").unwrap(), "second");
        assert_eq!(wait_read(&inbound), vec!["a", "b"]);
    }

    #[test]
    fn test_response_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let registration = fake_registration(dir.path());
        let mut cfg = config(dir.path(), 7);
        cfg.response_timeout = Some(Duration::from_millis(50));
        let mut client = Client::connect(cfg).unwrap();
        wait_read(&registration);

        // Reader attached so the write succeeds, but nobody answers.
        let paths = ChannelPaths::with_default_registration(dir.path());
        let _inbound = ChannelReader::open(paths.to_server(id(7)), ChannelConfig::default()).unwrap();

        let err = client.request("1").unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_late_response_not_paired_with_next_request() {
        let dir = tempfile::tempdir().unwrap();
        let registration = fake_registration(dir.path());
        let mut cfg = config(dir.path(), 14);
        cfg.response_timeout = Some(Duration::from_millis(100));
        let mut client = Client::connect(cfg).unwrap();
        wait_read(&registration);

        let paths = ChannelPaths::with_default_registration(dir.path());
        let inbound = ChannelReader::open(paths.to_server(id(14)), ChannelConfig::default()).unwrap();
        let outbound = ChannelWriter::new(paths.from_server(id(14)), ChannelConfig::default());

        assert!(client.request("slow").unwrap_err().is_timeout());
        assert!(client.is_out_of_sync());

        // The answer to "slow" shows up after the client gave up on it.
        assert_eq!(wait_read(&inbound), vec!["slow"]);
        outbound.write("re:slow").unwrap();
        thread::sleep(Duration::from_millis(50));

        let err = client.request("fast").unwrap_err();
        assert!(matches!(err, ClientError::OutOfSync), "got {err:?}");
        assert!(inbound.read(ReadMode::NonBlocking).unwrap().is_empty());

        client.close().unwrap();
    }

    #[test]
    fn test_oversized_request_rejected_before_sending() {
        let dir = tempfile::tempdir().unwrap();
        let registration = fake_registration(dir.path());
        let mut client = Client::connect(config(dir.path(), 15)).unwrap();
        wait_read(&registration);

        let paths = ChannelPaths::with_default_registration(dir.path());
        let inbound = ChannelReader::open(paths.to_server(id(15)), ChannelConfig::default()).unwrap();

        let err = client.request(&"7".repeat(MAX_MESSAGE_LEN + 1)).unwrap_err();
        assert!(
            matches!(err, ClientError::Channel(ChannelError::MessageTooLong { .. })),
            "got {err:?}"
        );
        assert!(!client.is_out_of_sync());
        assert!(inbound.read(ReadMode::NonBlocking).unwrap().is_empty());
    }

    #[test]
    fn test_multiline_request_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _registration = fake_registration(dir.path());
        let mut client = Client::connect(config(dir.path(), 10)).unwrap();

        let err = client.request("1\n2").unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }

    #[test]
    fn test_non_numeric_answer_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let registration = fake_registration(dir.path());
        let mut client = Client::connect(config(dir.path(), 12)).unwrap();
        wait_read(&registration);

        let paths = ChannelPaths::with_default_registration(dir.path());
        let _inbound = ChannelReader::open(paths.to_server(id(12)), ChannelConfig::default()).unwrap();
        ChannelWriter::new(paths.from_server(id(12)), ChannelConfig::default())
            .write("forty-two")
            .unwrap();

        let err = client.request_value(21).unwrap_err();
        assert!(matches!(err, ClientError::Parse { .. }));
    }
}
