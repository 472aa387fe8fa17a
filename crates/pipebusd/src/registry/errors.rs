//! Errors raised by the registration directory.

use pipebus_core::{ChannelError, ClientId};
use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A live session already exists for this client.
    #[error("client {0} is already registered")]
    AlreadyRegistered(ClientId),

    /// The directory is at its session cap.
    #[error("registry is full (max {max} sessions)")]
    RegistryFull { max: usize },

    /// The directory stopped its sessions while this one was being built.
    #[error("client {0} registered during shutdown")]
    ShuttingDown(ClientId),

    /// Creating or opening one of the pipes failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },
}
