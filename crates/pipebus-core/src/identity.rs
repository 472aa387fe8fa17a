//! Client identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use thiserror::Error;

/// Identity a client announces on the registration channel.
///
/// In practice this is the client's process id. It is chosen by the client,
/// must be non-zero, and is unique among live clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(NonZeroU32);

impl ClientId {
    /// Creates a ClientId, returning `None` for zero.
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    /// Identity of the current process.
    ///
    /// Falls back to 1 only on the (impossible on Unix) pid 0.
    pub fn current_process() -> Self {
        Self(NonZeroU32::new(std::process::id()).unwrap_or(NonZeroU32::MIN))
    }

    /// Returns the raw integer value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failure to parse a [`ClientId`] from wire text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("client id is not a decimal integer: {0:?}")]
    NotANumber(String),

    #[error("client id must be positive")]
    Zero,
}

impl FromStr for ClientId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .trim()
            .parse::<u32>()
            .map_err(|_| IdentityError::NotANumber(s.to_string()))?;
        Self::new(raw).ok_or(IdentityError::Zero)
    }
}

impl TryFrom<u32> for ClientId {
    type Error = IdentityError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(IdentityError::Zero)
    }
}
