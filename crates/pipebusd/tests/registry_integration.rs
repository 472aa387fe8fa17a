//! Integration tests for the registration channel.
//!
//! Drives the broker through its registration pipe the way real clients do,
//! both with the client library and with raw registration lines.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use pipebus_client::{Client, ClientConfig};
use pipebus_core::{lock_path_for, ChannelConfig, ChannelWriter, ClientId};
use pipebusd::{Broker, BrokerConfig, ClientState, Shutdown};
use tempfile::TempDir;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for the broker to react to a registration line.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestBroker {
    broker: Broker,
    dir: PathBuf,
    _temp_dir: TempDir, // Keep alive for RAII cleanup
}

impl TestBroker {
    fn build() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let dir = temp_dir.path().to_path_buf();
        let broker = Broker::with_doubler(BrokerConfig {
            pipe_dir: dir.clone(),
            ..BrokerConfig::default()
        })
        .expect("create broker");
        Self {
            broker,
            dir,
            _temp_dir: temp_dir,
        }
    }

    fn spawn() -> Self {
        let mut test = Self::build();
        test.broker.start().expect("start broker");
        test
    }

    fn client_config(&self, id: u32) -> ClientConfig {
        ClientConfig {
            pipe_dir: self.dir.clone(),
            id: ClientId::new(id).unwrap(),
            response_timeout: Some(SETTLE_TIMEOUT),
            ..ClientConfig::default()
        }
    }

    /// Writes one raw line into the registration pipe.
    fn send_registration(&self, line: &str) {
        ChannelWriter::new(self.broker.registration_path(), ChannelConfig::default())
            .write(line)
            .expect("write registration line");
    }

    fn contains(&self, id: u32) -> bool {
        self.broker.directory().contains(ClientId::new(id).unwrap())
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < SETTLE_TIMEOUT {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn assert_gone(pipe: &Path) {
    assert!(!pipe.exists(), "{} still exists", pipe.display());
    assert!(
        !lock_path_for(pipe).exists(),
        "lock for {} still exists",
        pipe.display()
    );
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_register_request_unregister_4242() {
    let test = TestBroker::spawn();
    let mut client = Client::connect(test.client_config(4242)).unwrap();

    assert_eq!(client.request("21").unwrap(), "42");
    assert!(wait_until(|| test.contains(4242)));

    client.close().unwrap();

    assert!(wait_until(|| !test.contains(4242)));
    assert_gone(&test.dir.join("4242_to_server"));
    assert_gone(&test.dir.join("server_to_4242"));
}

#[test]
fn test_session_visible_while_registered() {
    let test = TestBroker::spawn();
    let mut client = Client::connect(test.client_config(31)).unwrap();
    client.request_value(1).unwrap();

    let sessions = test.broker.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id.get(), 31);
    assert_eq!(sessions[0].state, ClientState::Started);
    assert_eq!(sessions[0].requests_handled, 1);

    client.close().unwrap();
}

#[test]
fn test_two_registrations_in_one_drain() {
    let mut test = TestBroker::build();

    // Both lines sit in the pipe before the loop's first read.
    test.send_registration("register 1");
    test.send_registration(" register 2");
    test.broker.start().unwrap();

    assert!(wait_until(|| test.contains(1) && test.contains(2)));
    assert_eq!(test.broker.directory().len(), 2);

    test.broker.stop(Shutdown::StopSessions);
    assert_gone(&test.dir.join("1_to_server"));
    assert_gone(&test.dir.join("server_to_2"));
}

#[test]
fn test_same_id_can_register_again_after_unregister() {
    let test = TestBroker::spawn();

    for _ in 0..3 {
        let mut client = Client::connect(test.client_config(55)).unwrap();
        assert_eq!(client.request_value(4).unwrap(), 8);
        client.close().unwrap();
        assert!(wait_until(|| !test.contains(55)));
    }
}

// ============================================================================
// Edge Case Tests
// ============================================================================

#[test]
fn test_unregister_unknown_id_is_noop() {
    let test = TestBroker::spawn();
    let mut client = Client::connect(test.client_config(10)).unwrap();
    client.request_value(1).unwrap();

    test.send_registration("unregister 999");

    // The loop keeps going and the live client is untouched.
    let mut other = Client::connect(test.client_config(11)).unwrap();
    assert_eq!(other.request_value(2).unwrap(), 4);
    assert_eq!(client.request_value(3).unwrap(), 6);
    assert_eq!(test.broker.directory().len(), 2);

    other.close().unwrap();
    client.close().unwrap();
}

#[test]
fn test_malformed_registration_lines_skipped() {
    let test = TestBroker::spawn();

    for line in ["hello", "register", "register abc", "register 0", "register 1 2"] {
        test.send_registration(line);
    }

    let mut client = Client::connect(test.client_config(12)).unwrap();
    assert_eq!(client.request_value(5).unwrap(), 10);
    assert_eq!(test.broker.directory().len(), 1);

    client.close().unwrap();
}

#[test]
fn test_duplicate_registration_keeps_live_session() {
    let test = TestBroker::spawn();
    let mut client = Client::connect(test.client_config(7)).unwrap();
    assert_eq!(client.request_value(10).unwrap(), 20);

    test.send_registration("register 7");

    // A registration line after ours has certainly been processed once
    // this second client is served.
    let mut checker = Client::connect(test.client_config(8)).unwrap();
    checker.request_value(0).unwrap();

    assert_eq!(client.request_value(11).unwrap(), 22);
    assert_eq!(test.broker.directory().len(), 2);

    checker.close().unwrap();
    client.close().unwrap();
}
