//! Locked, line-oriented channels over named pipes.
//!
//! A channel is one FIFO plus its `<pipe>.lock` file. A duplex connection
//! between the broker and a client is two channels, one per direction:
//!
//! ```text
//!   client ── <id>_to_server ──▶ broker session
//!   client ◀── server_to_<id> ── broker session
//! ```
//!
//! Every message is one line of UTF-8 text. Readers drain whatever is
//! buffered under the read lock and split it into lines, so a single drain
//! can yield several messages written by separate writers.

mod reader;
mod writer;

pub use reader::ChannelReader;
pub use writer::ChannelWriter;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::identity::ClientId;
use crate::lock::LockConfig;

/// Default sleep between two polls of an empty pipe.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Largest message a channel carries, excluding the newline.
///
/// A line of at most `PIPE_BUF` bytes (4096 on Linux) is written atomically
/// by a non-blocking write: it lands whole or fails with `EAGAIN`. Writers
/// never hold the lock while a full pipe blocks them.
pub const MAX_MESSAGE_LEN: usize = 4096 - 1;

/// Default file name of the registration pipe inside the pipe directory.
pub const DEFAULT_REGISTRATION_PIPE: &str = "register_pipe";

/// Pipe directory used when none is configured: `$XDG_RUNTIME_DIR/pipebus`,
/// or `/tmp/pipebus` where there is no runtime directory.
pub fn default_pipe_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pipebus")
}

/// How [`ChannelReader::read`] behaves on an empty pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Keep polling until at least one message arrives.
    BusyWait,
    /// Return an empty batch straight away.
    NonBlocking,
    /// Keep polling, but fail with a timeout after the given duration.
    BusyWaitFor(Duration),
}

/// Tuning shared by the reader and the writer of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub lock: LockConfig,
    /// Sleep between polls of an empty pipe and between writer attempts.
    pub poll_interval: Duration,
    /// Give up delivering a message after this long, whether the pipe has
    /// no reader or stays full. `None` waits forever.
    pub write_timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_timeout: None,
        }
    }
}

/// Deterministic pipe naming inside one pipe directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    dir: PathBuf,
    registration: PathBuf,
}

impl ChannelPaths {
    pub fn new(dir: impl Into<PathBuf>, registration_pipe: &str) -> Self {
        let dir = dir.into();
        let registration = dir.join(registration_pipe);
        Self { dir, registration }
    }

    pub fn with_default_registration(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, DEFAULT_REGISTRATION_PIPE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The shared many-writer, one-reader registration pipe.
    pub fn registration(&self) -> &Path {
        &self.registration
    }

    /// Pipe the client writes requests into: `<id>_to_server`.
    pub fn to_server(&self, id: ClientId) -> PathBuf {
        self.dir.join(format!("{id}_to_server"))
    }

    /// Pipe the broker writes responses into: `server_to_<id>`.
    pub fn from_server(&self, id: ClientId) -> PathBuf {
        self.dir.join(format!("server_to_{id}"))
    }
}

/// Splits one drained buffer into messages.
///
/// Decodes lossily, trims trailing whitespace, splits on line breaks and
/// drops blank lines. A message is therefore never empty and never ends in
/// whitespace; senders that need either must encode it.
pub fn split_messages(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end()
        .lines()
        .map(|line| line.trim_end())
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}
