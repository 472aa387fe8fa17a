//! Error types for locks and channels.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while acquiring or releasing an advisory lock.
///
/// Contention itself is never an error: acquisition retries until it wins,
/// unless a timeout was configured.
#[derive(Error, Debug)]
pub enum LockError {
    /// The configured acquisition timeout elapsed.
    #[error("timed out after {waited:?} waiting for lock {path}")]
    Timeout { path: PathBuf, waited: Duration },

    /// The lock file could not be created, opened or locked.
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors raised by [`ChannelReader`](crate::ChannelReader) and
/// [`ChannelWriter`](crate::ChannelWriter).
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The pipe could not be opened (other than the transient "no reader yet").
    #[error("failed to open pipe {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read pipe {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write pipe {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Creating or removing a pipe file failed.
    #[error("failed to provision pipe {path}: {source}")]
    Provision {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The message does not fit in one atomic pipe write.
    #[error("message of {len} bytes for pipe {path} exceeds the {max} byte limit")]
    MessageTooLong { path: PathBuf, len: usize, max: usize },

    /// A bounded read or write gave up.
    #[error("timed out after {waited:?} on pipe {path}")]
    Timeout { path: PathBuf, waited: Duration },
}

impl ChannelError {
    /// Returns true for the timeout variants of either layer.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Lock(LockError::Timeout { .. })
        )
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;
