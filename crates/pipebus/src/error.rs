//! Error types for the pipebus client.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()` in this crate.

use thiserror::Error;

use pipebus_core::ChannelError;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors a client can see while talking to the broker.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Pipe creation, locking or I/O failed.
    ///
    /// A [`ChannelError::Open`] with `ENOENT` on the registration pipe
    /// usually means the broker is not running.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The broker answered with an error response.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The broker's response could not be interpreted.
    #[error("unexpected response {response:?}: {reason}")]
    Parse { response: String, reason: String },

    /// An earlier response never arrived, so a late answer could be paired
    /// with the wrong request. Reconnect to continue.
    #[error("connection is out of sync after a lost response")]
    OutOfSync,

    /// Requests are single lines; the payload contained a line break.
    #[error("request must be a single line: {0:?}")]
    InvalidRequest(String),
}

impl ClientError {
    /// True when the broker did not answer within the response timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Channel(e) if e.is_timeout())
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
